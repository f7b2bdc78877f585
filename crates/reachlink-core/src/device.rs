// ── Device base ──
//
// The lifecycle and plumbing shared by every device: outbound sends,
// the non-blocking inbound queue, the closed signal, background work and
// the key/value configuration store. Request correlation lives in
// `Requester`, which is built on top of this.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use reachlink_api::{CommandRecord, CommandSink, DeviceDataRecord, KEY_VALUE};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::executor::{Executor, Job};

/// Key of one entry in the key/value configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyValueKey {
    pub device_type: String,
    pub device_name: String,
    pub key: String,
}

impl KeyValueKey {
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
            key: key.into(),
        }
    }
}

/// Work items for the dispatch task, in arrival order.
pub(crate) enum Inbound {
    Record(Arc<DeviceDataRecord>),
    Flush(oneshot::Sender<()>),
    Close,
}

pub struct DeviceBase {
    label: String,
    sink: Arc<dyn CommandSink>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    closing: AtomicBool,
    closed: CancellationToken,
    pub(crate) executor: Executor,
    key_values: DashMap<KeyValueKey, String>,
}

impl DeviceBase {
    pub fn new(label: impl Into<String>, sink: Arc<dyn CommandSink>) -> Self {
        let label = label.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            executor: Executor::new(label.clone()),
            label,
            sink,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            key_values: DashMap::new(),
        }
    }

    /// Name used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Hand a command to the transport. Failures are logged, never raised.
    pub fn send(&self, cmd: CommandRecord) {
        if self.is_closed() {
            tracing::debug!(device = %self.label, data_type = %cmd.data_type, "device closed, dropping command");
            return;
        }
        tracing::trace!(
            device = %self.label,
            device_type = %cmd.device_type,
            device_name = %cmd.device_name,
            data_type = %cmd.data_type,
            tag = cmd.tag.as_deref().unwrap_or_default(),
            "sending command"
        );
        if let Err(e) = self.sink.send(cmd) {
            tracing::warn!(device = %self.label, error = %e, "command not sent");
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Enqueue a record for dispatch. Never blocks; dropped after close.
    pub fn on_message(&self, record: Arc<DeviceDataRecord>) {
        if self.is_closed() {
            tracing::trace!(device = %self.label, data_type = %record.data_type, "device closed, dropping record");
            return;
        }
        let _ = self.inbound_tx.send(Inbound::Record(record));
    }

    pub(crate) fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Record a `key-value` update, if this is one.
    pub(crate) fn record_key_value(&self, record: &DeviceDataRecord) {
        if record.data_type != KEY_VALUE {
            return;
        }
        let Some(key) = record.key.clone() else { return };
        let entry = KeyValueKey::new(record.device_type.clone(), record.device_name.clone(), key);
        self.key_values
            .insert(entry, record.value.clone().unwrap_or_default());
    }

    pub fn get_key_value(&self, key: &KeyValueKey) -> Option<String> {
        self.key_values.get(key).map(|v| v.value().clone())
    }

    pub fn key_values(&self) -> Vec<(KeyValueKey, String)> {
        let mut out: Vec<_> = self
            .key_values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin closing. Returns `true` for the first call only.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.cancel();
        let _ = self.inbound_tx.send(Inbound::Close);
        tracing::debug!(device = %self.label, "device closing");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the device closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wait for the device to close. Returns `false` if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.closed.cancelled())
                .await
                .is_ok(),
            None => {
                self.closed.cancelled().await;
                true
            }
        }
    }

    /// Resolve once every record enqueued before this call has been
    /// dispatched and the callbacks it triggered have run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.is_closed() || self.inbound_tx.send(Inbound::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub(crate) fn submit(&self, job: Job) {
        self.executor.submit_or_run(job);
    }

    // ── Background work ──────────────────────────────────────────────

    /// Run a future in the background; `shutdown` waits for it.
    pub fn run<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor.spawn(fut);
    }

    /// Call `f` every `period`, starting now, until it returns `true` or
    /// the device closes.
    pub fn poll<F>(&self, period: Duration, f: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.poll_until(period, self.closed.child_token(), f);
    }

    /// Like [`poll`](Self::poll) but also stops when `stop` is cancelled.
    pub(crate) fn poll_until<F>(&self, period: Duration, stop: CancellationToken, mut f: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let label = self.label.clone();
        self.run(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut done = false;
                        crate::executor::run_guarded(&label, || done = f());
                        if done {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for DeviceBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBase")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
