// reachlink-api: wire records, JSON-lines codec and transports for a
// remote robot/simulator host.

pub mod codec;
pub mod error;
pub mod record;
pub mod transport;

pub use error::Error;
pub use record::{
    CMD_STATUS, CommandRecord, CommandStatus, DeviceDataRecord, DeviceKey, FRAME_REQUEST,
    KEY_VALUE,
};
pub use transport::{
    ChannelPeer, ChannelTransport, CommandSink, Inbound, MAX_UNSENT, ReconnectConfig,
    TcpTransport,
};
