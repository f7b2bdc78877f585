// ── Dispatch executor ──
//
// Two kinds of work run on behalf of a device:
//
// - callback jobs go through a single serial lane, so callbacks of one
//   device never overlap and run in submission order;
// - background futures (deadline watchers, timers, queue drains) are
//   spawned onto the runtime and tracked so shutdown can wait for them.
//
// A panic inside a job is caught and logged; the lane keeps going.
//
// Futures go to the runtime captured by `start`, so requests may be made
// from threads outside any runtime.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct Executor {
    name: String,
    lane_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    lane_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    runtime: OnceLock<Handle>,
    tracker: TaskTracker,
}

impl Executor {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            lane_tx: Mutex::new(Some(tx)),
            lane_rx: Mutex::new(Some(rx)),
            runtime: OnceLock::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start the callback lane on `runtime`. Jobs submitted earlier are
    /// already queued. Later calls are no-ops.
    pub(crate) fn start(&self, runtime: &Handle) {
        let _ = self.runtime.set(runtime.clone());
        let rx = self
            .lane_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else { return };
        let name = self.name.clone();
        self.tracker.spawn_on(
            async move {
                while let Some(job) = rx.recv().await {
                    run_guarded(&name, job);
                }
                tracing::debug!(device = %name, "callback lane drained");
            },
            runtime,
        );
    }

    /// Queue a job on the lane. Returns the job back if the lane is closed.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        let guard = self.lane_tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    /// Queue a job, or run it right here if the lane is gone.
    pub(crate) fn submit_or_run(&self, job: Job) {
        if let Err(job) = self.submit(job) {
            run_guarded(&self.name, job);
        }
    }

    /// Run a future in the background, tracked for shutdown.
    ///
    /// Before `start` this falls back to the caller's runtime, if any.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self
            .runtime
            .get()
            .cloned()
            .or_else(|| Handle::try_current().ok());
        match runtime {
            Some(runtime) => {
                self.tracker.spawn_on(fut, &runtime);
            }
            None => {
                tracing::warn!(device = %self.name, "no runtime to run background work on, dropped");
            }
        }
    }

    /// Stop accepting jobs; the lane exits once it has run what is queued.
    pub(crate) fn close_lane(&self) {
        self.lane_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // A lane that never started runs its backlog here.
        let rx = self
            .lane_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut rx) = rx {
            while let Ok(job) = rx.try_recv() {
                run_guarded(&self.name, job);
            }
        }
    }

    /// Wait for the lane and every tracked future to finish.
    pub(crate) async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Run a job, logging instead of unwinding if it panics.
pub(crate) fn run_guarded(name: &str, job: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        tracing::warn!(device = %name, reason = %reason, "callback panicked");
    }
}
