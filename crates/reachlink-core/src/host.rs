// ── Host ──
//
// Owns one transport and the devices attached to it. A pump task fans
// every inbound record out to every registered device; each device
// enqueues without blocking, so one slow device never stalls the rest.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use reachlink_api::{CommandSink, DeviceDataRecord, Inbound, TcpTransport};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::{HostConfig, RequesterConfig};
use crate::devices::{ColorCamera, Vnc};
use crate::error::CoreError;
use crate::requester::{MessageParser, Requester};

/// What the host needs from an attached device.
pub trait DeviceHandle: Send + Sync {
    /// Spawn the device's background tasks on `runtime`.
    fn start(&self, runtime: &Handle);
    /// Enqueue an inbound record. Must not block.
    fn on_message(&self, record: Arc<DeviceDataRecord>);
    /// Close the device. Idempotent.
    fn close(&self);
}

impl<P: MessageParser> DeviceHandle for Requester<P> {
    fn start(&self, runtime: &Handle) {
        Requester::start_on(self, runtime);
    }

    fn on_message(&self, record: Arc<DeviceDataRecord>) {
        Requester::on_message(self, record);
    }

    fn close(&self) {
        Requester::close(self);
    }
}

/// Connection to one host and its devices.
///
/// Cheaply cloneable via `Arc<HostInner>`.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    sink: Arc<dyn CommandSink>,
    config: RequesterConfig,
    devices: Mutex<Vec<Arc<dyn DeviceHandle>>>,
    inbound: Mutex<Option<Inbound>>,
    runtime: OnceLock<Handle>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Host {
    /// Build a host over an already-connected transport. Does not start
    /// pumping; call [`start`](Self::start).
    pub fn new(sink: Arc<dyn CommandSink>, inbound: Inbound, config: RequesterConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                sink,
                config,
                devices: Mutex::new(Vec::new()),
                inbound: Mutex::new(Some(inbound)),
                runtime: OnceLock::new(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Open a TCP connection to the host described by `config` and start pumping.
    pub fn connect_tcp(config: &HostConfig) -> Self {
        let cancel = CancellationToken::new();
        let (transport, inbound) = TcpTransport::connect(
            &config.address,
            config.port,
            config.reconnect.clone(),
            cancel.child_token(),
        );
        let host = Self::new(Arc::new(transport), inbound, config.requester.clone());
        let transport_cancel = cancel;
        let host_cancel = host.inner.cancel.clone();
        host.inner.tracker.spawn(async move {
            host_cancel.cancelled().await;
            transport_cancel.cancel();
        });
        host.start();
        host
    }

    /// Spawn the pump task on the current runtime, which also hosts every
    /// device attached later. Panics outside a tokio runtime; later calls
    /// are no-ops.
    pub fn start(&self) {
        let runtime = self.inner.runtime.get_or_init(Handle::current);
        let inbound = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(inbound) = inbound else { return };
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn_on(pump(inner, inbound), runtime);
    }

    pub fn sink(&self) -> Arc<dyn CommandSink> {
        Arc::clone(&self.inner.sink)
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Attach and start a device. Callable from any thread once the host
    /// has started.
    pub fn add_device(&self, device: Arc<dyn DeviceHandle>) -> Result<(), CoreError> {
        let runtime = match self.inner.runtime.get() {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| CoreError::NoRuntime)?,
        };
        let mut devices = self
            .inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            return Err(CoreError::Closed {
                target: "host".into(),
            });
        }
        device.start(&runtime);
        devices.push(device);
        Ok(())
    }

    /// Attach a color camera facade for `(device_type, device_name)`.
    pub fn color_camera(&self, device_type: &str, device_name: &str) -> Result<ColorCamera, CoreError> {
        let (handle, camera) = ColorCamera::new(self.sink(), self.config().clone(), device_type, device_name);
        self.add_device(handle)?;
        Ok(camera)
    }

    /// Attach a VNC facade for `(device_type, device_name)`.
    pub fn vnc(&self, device_type: &str, device_name: &str) -> Result<Vnc, CoreError> {
        let (handle, vnc) = Vnc::new(self.sink(), self.config().clone(), device_type, device_name);
        self.add_device(handle)?;
        Ok(vnc)
    }

    /// Close every device and stop pumping. Idempotent.
    pub fn close(&self) {
        self.inner.close_devices();
    }

    /// Close and wait for the pump to exit.
    pub async fn shutdown(&self) {
        self.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl HostInner {
    fn close_devices(&self) {
        self.cancel.cancel();
        let devices = std::mem::take(
            &mut *self
                .devices
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !devices.is_empty() {
            debug!(count = devices.len(), "closing devices");
        }
        for device in devices {
            device.close();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn pump(inner: Arc<HostInner>, mut inbound: Inbound) {
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            record = inbound.recv() => {
                let Some(record) = record else {
                    info!("transport closed, closing devices");
                    inner.close_devices();
                    break;
                };
                let record = Arc::new(record);
                for device in inner.snapshot() {
                    device.on_message(Arc::clone(&record));
                }
            }
        }
    }
    debug!("host pump exiting");
}
