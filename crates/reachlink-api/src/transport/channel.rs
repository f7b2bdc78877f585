// ── In-memory transport ──
//
// Connects the engine to an in-process peer (tests, log playback,
// simulators). The peer sees every command and injects device data.

use tokio::sync::mpsc;

use super::{CommandSink, Inbound};
use crate::error::Error;
use crate::record::{CommandRecord, DeviceDataRecord};

/// Engine-facing half of an in-memory transport.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    command_tx: mpsc::UnboundedSender<CommandRecord>,
}

/// Peer-facing half: observes commands, delivers device data.
#[derive(Debug)]
pub struct ChannelPeer {
    command_rx: mpsc::UnboundedReceiver<CommandRecord>,
    data_tx: mpsc::UnboundedSender<DeviceDataRecord>,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair plus the inbound stream the
    /// host consumes.
    pub fn pair() -> (Self, Inbound, ChannelPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        (
            Self { command_tx },
            data_rx,
            ChannelPeer {
                command_rx,
                data_tx,
            },
        )
    }
}

impl CommandSink for ChannelTransport {
    fn send(&self, cmd: CommandRecord) -> Result<(), Error> {
        self.command_tx
            .send(cmd)
            .map_err(|_| Error::TransportClosed)
    }
}

impl ChannelPeer {
    /// Push a record towards the engine.
    pub fn deliver(&self, record: DeviceDataRecord) -> Result<(), Error> {
        self.data_tx.send(record).map_err(|_| Error::TransportClosed)
    }

    /// Wait for the next command the engine sent.
    /// Returns `None` once every engine-side sender is gone.
    pub async fn next_command(&mut self) -> Option<CommandRecord> {
        self.command_rx.recv().await
    }

    /// Take a command if one is already queued.
    pub fn try_next_command(&mut self) -> Option<CommandRecord> {
        self.command_rx.try_recv().ok()
    }

    /// Take every command queued so far.
    pub fn drain_commands(&mut self) -> Vec<CommandRecord> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.command_rx.try_recv() {
            out.push(cmd);
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_reach_the_peer_in_order() {
        let (transport, _inbound, mut peer) = ChannelTransport::pair();
        transport.send(CommandRecord::frame_request("a", "")).unwrap();
        transport.send(CommandRecord::frame_request("b", "")).unwrap();

        let cmds = peer.drain_commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].device_type, "a");
        assert_eq!(cmds[1].device_type, "b");
    }

    #[tokio::test]
    async fn delivered_records_reach_the_inbound_stream() {
        let (_transport, mut inbound, peer) = ChannelTransport::pair();
        peer.deliver(DeviceDataRecord::new("robot", "", "joints"))
            .unwrap();
        let record = inbound.recv().await.unwrap();
        assert_eq!(record.data_type, "joints");
    }

    #[test]
    fn send_after_peer_dropped_is_closed() {
        let (transport, _inbound, peer) = ChannelTransport::pair();
        drop(peer);
        let err = transport
            .send(CommandRecord::frame_request("a", ""))
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }
}
