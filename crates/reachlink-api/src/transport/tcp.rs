//! TCP JSON-lines transport with auto-reconnect.
//!
//! Connects to a host's local TCP endpoint and exchanges one JSON record per
//! line in each direction. Decoded device data flows out through an
//! [`Inbound`] receiver; commands go in through [`CommandSink::send`].
//! Reconnection uses exponential backoff + jitter, and commands sent while
//! disconnected are held (up to [`MAX_UNSENT`]) and written in order once
//! the link is back.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{CommandSink, Inbound};
use crate::codec::{decode_device_data, encode_command, line_codec};
use crate::error::Error;
use crate::record::{CommandRecord, DeviceDataRecord, FRAME_REQUEST};

/// Commands held while disconnected. The oldest are dropped past this.
pub const MAX_UNSENT: usize = 1024;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── TcpTransport ─────────────────────────────────────────────────────

/// Handle to a running TCP connection loop.
///
/// Cheaply cloneable. Call [`shutdown`](Self::shutdown) (or cancel the token
/// passed to [`connect`](Self::connect)) to tear down the background task;
/// the [`Inbound`] receiver ends when it exits.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    command_tx: mpsc::UnboundedSender<CommandRecord>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Spawn the connection loop for `host:port`.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background. Must be called from within a tokio runtime.
    pub fn connect(
        host: &str,
        port: u16,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> (Self, Inbound) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let addr = format!("{host}:{port}");

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            tcp_loop(addr, command_rx, data_tx, reconnect, task_cancel).await;
        });

        (Self { command_tx, cancel }, data_rx)
    }

    /// Signal the background task to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl CommandSink for TcpTransport {
    fn send(&self, cmd: CommandRecord) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.command_tx
            .send(cmd)
            .map_err(|_| Error::TransportClosed)
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// How a single connection ended.
#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    /// Peer closed the socket; reconnect.
    Disconnected,
    /// Cancelled, or nobody is left on either side of the channels.
    Shutdown,
}

/// Main loop: connect → pump → on error, backoff → reconnect.
async fn tcp_loop(
    addr: String,
    mut command_rx: mpsc::UnboundedReceiver<CommandRecord>,
    data_tx: mpsc::UnboundedSender<DeviceDataRecord>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    let mut unsent: VecDeque<CommandRecord> = VecDeque::new();

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = connect_and_pump(&addr, &mut command_rx, &mut unsent, &data_tx, &cancel) => result,
        };

        let delay = match result {
            Ok(LinkEnd::Shutdown) => break,
            Ok(LinkEnd::Disconnected) => {
                tracing::info!(addr = %addr, "host disconnected cleanly, reconnecting");
                attempt = 0;
                reconnect.initial_delay
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, addr = %addr, "host connection error");

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(
                            max_retries = max,
                            "host reconnection limit reached, giving up"
                        );
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &reconnect);
                attempt += 1;
                delay
            }
        };

        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt,
            "waiting before reconnect"
        );
        if !hold_off(delay, &mut command_rx, &mut unsent, &cancel).await {
            break;
        }
    }

    tracing::debug!(addr = %addr, "tcp transport loop exiting");
}

/// Sleep for `delay` while still taking commands off the channel.
/// Returns `false` if the transport shut down meanwhile.
async fn hold_off(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<CommandRecord>,
    unsent: &mut VecDeque<CommandRecord>,
    cancel: &CancellationToken,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            () = &mut sleep => return true,
            cmd = command_rx.recv() => match cmd {
                Some(cmd) => buffer_unsent(unsent, cmd),
                None => return false,
            },
        }
    }
}

/// Establish one connection and shuttle records until it drops.
async fn connect_and_pump(
    addr: &str,
    command_rx: &mut mpsc::UnboundedReceiver<CommandRecord>,
    unsent: &mut VecDeque<CommandRecord>,
    data_tx: &mpsc::UnboundedSender<DeviceDataRecord>,
    cancel: &CancellationToken,
) -> Result<LinkEnd, Error> {
    tracing::info!(addr, "connecting to host");

    let connect = TcpStream::connect(addr);
    tokio::pin!(connect);
    let stream = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LinkEnd::Shutdown),
            result = &mut connect => {
                break result.map_err(|e| Error::Connect {
                    addr: addr.to_owned(),
                    reason: e.to_string(),
                })?;
            }
            cmd = command_rx.recv() => match cmd {
                Some(cmd) => buffer_unsent(unsent, cmd),
                None => return Ok(LinkEnd::Shutdown),
            },
        }
    };
    stream.set_nodelay(true)?;

    tracing::info!(addr, "host connected");

    let (read, write) = stream.into_split();
    let mut reader: FramedRead<OwnedReadHalf, LinesCodec> = FramedRead::new(read, line_codec());
    let mut writer: FramedWrite<OwnedWriteHalf, LinesCodec> =
        FramedWrite::new(write, line_codec());

    // Commands that were queued while the link was down go first.
    while let Some(cmd) = unsent.pop_front() {
        if let Err(e) = write_command(&mut writer, &cmd).await {
            unsent.push_front(cmd);
            return Err(e);
        }
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LinkEnd::Shutdown),
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { return Ok(LinkEnd::Shutdown) };
                if let Err(e) = write_command(&mut writer, &cmd).await {
                    unsent.push_front(cmd);
                    return Err(e);
                }
            }
            line = reader.next() => {
                match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_device_data(&line) {
                            Ok(record) => {
                                tracing::trace!(
                                    device_type = %record.device_type,
                                    device_name = %record.device_name,
                                    data_type = %record.data_type,
                                    "received device data"
                                );
                                if data_tx.send(record).is_err() {
                                    return Ok(LinkEnd::Shutdown);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping undecodable line");
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(LinkEnd::Disconnected),
                }
            }
        }
    }
}

// ── Unsent backlog ───────────────────────────────────────────────────

fn is_untagged_frame_request(cmd: &CommandRecord) -> bool {
    cmd.tag.is_none() && cmd.data_type == FRAME_REQUEST
}

/// Hold a command until the link is back.
///
/// An untagged `frame-request` replaces an identical one already waiting,
/// so periodic requests do not pile up during an outage. Past
/// [`MAX_UNSENT`] the oldest command is dropped.
fn buffer_unsent(unsent: &mut VecDeque<CommandRecord>, cmd: CommandRecord) {
    if is_untagged_frame_request(&cmd) {
        unsent.retain(|queued| {
            !(is_untagged_frame_request(queued)
                && queued.device_type == cmd.device_type
                && queued.device_name == cmd.device_name
                && queued.extra == cmd.extra)
        });
    }
    if unsent.len() >= MAX_UNSENT {
        if let Some(dropped) = unsent.pop_front() {
            tracing::warn!(
                data_type = %dropped.data_type,
                device_type = %dropped.device_type,
                "unsent backlog full, dropping oldest command"
            );
        }
    }
    unsent.push_back(cmd);
}

async fn write_command(
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    cmd: &CommandRecord,
) -> Result<(), Error> {
    let line = match encode_command(cmd) {
        Ok(line) => line,
        Err(e) => {
            // Unserializable commands are dropped, not retried.
            tracing::warn!(error = %e, data_type = %cmd.data_type, "dropping unencodable command");
            return Ok(());
        }
    };
    writer.send(line).await?;
    Ok(())
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25%, deterministic in the attempt number.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(31)).unwrap_or(31);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
