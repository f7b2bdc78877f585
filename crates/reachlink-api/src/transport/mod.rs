//! Transport seam between the dispatch engine and the wire.
//!
//! A transport is two halves: a [`CommandSink`] the engine pushes outbound
//! commands into, and an [`Inbound`] receiver of already-decoded device
//! data records that the host pumps into its devices.

mod channel;
mod tcp;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::record::{CommandRecord, DeviceDataRecord};

pub use channel::{ChannelPeer, ChannelTransport};
pub use tcp::{MAX_UNSENT, ReconnectConfig, TcpTransport};

/// Stream of inbound records produced by a transport.
/// Ends when the transport shuts down.
pub type Inbound = mpsc::UnboundedReceiver<DeviceDataRecord>;

/// Outbound half of a transport.
///
/// `send` must not block: implementations enqueue and return.
pub trait CommandSink: Send + Sync {
    fn send(&self, cmd: CommandRecord) -> Result<(), Error>;
}
