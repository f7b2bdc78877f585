// ── Requester ──
//
// Request/response correlation on top of `DeviceBase`. Every inbound
// record runs through one dispatch task:
//
//   parse supplement → cache → pending requests → subscribers
//
// State mutations happen under a single lock; user callbacks run later on
// the device's serial callback lane, never under that lock. Timers
// (deadlines, periodic requests, housekeeping) are background tasks bound
// to the device's closed token.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use reachlink_api::{CommandRecord, CommandSink, DeviceDataRecord, DeviceKey};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::UpdateCache;
use crate::config::RequesterConfig;
use crate::device::{DeviceBase, Inbound, KeyValueKey};
use crate::error::CoreError;
use crate::executor::run_guarded;
use crate::pending::PendingTable;
use crate::queue::{Response, ResponseQueue};
use crate::request::{Expect, PendingRequest};
use crate::status::Status;
use crate::subscription::{FinishedCallback, SubscriptionEntry, SubscriptionRegistry, UpdateSubscription};
use crate::tag::generate_tag;

/// Device-specific parsing of records into typed updates.
pub trait MessageParser: Send + Sync + 'static {
    /// The typed value a record carries for this device.
    type Supplement: Send + Sync + 'static;

    /// Parse `record`, or `None` if it carries nothing for this device.
    fn get_message_supplement(&self, record: &DeviceDataRecord) -> Option<Self::Supplement>;
}

type PeriodicKey = (DeviceKey, String);

struct PeriodicRequest {
    period: Duration,
    stop: CancellationToken,
}

struct RequesterState<T> {
    pending: PendingTable<T>,
    subscriptions: SubscriptionRegistry<T>,
    periodic: HashMap<PeriodicKey, PeriodicRequest>,
    tagged_streams: BTreeSet<DeviceKey>,
}

impl<T> Default for RequesterState<T> {
    fn default() -> Self {
        Self {
            pending: PendingTable::default(),
            subscriptions: SubscriptionRegistry::default(),
            periodic: HashMap::new(),
            tagged_streams: BTreeSet::new(),
        }
    }
}

struct RequesterInner<P: MessageParser> {
    device: DeviceBase,
    parser: P,
    config: RequesterConfig,
    started: AtomicBool,
    state: Mutex<RequesterState<P::Supplement>>,
    cache: UpdateCache<P::Supplement>,
}

/// Correlates outbound commands with inbound records for one device.
///
/// Cheaply cloneable; clones share the same device.
pub struct Requester<P: MessageParser> {
    inner: Arc<RequesterInner<P>>,
}

impl<P: MessageParser> Clone for Requester<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: MessageParser> Requester<P> {
    pub fn new(
        label: impl Into<String>,
        sink: Arc<dyn CommandSink>,
        parser: P,
        config: RequesterConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                device: DeviceBase::new(label, sink),
                parser,
                config,
                started: AtomicBool::new(false),
                state: Mutex::new(RequesterState::default()),
                cache: UpdateCache::default(),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the dispatch, callback and housekeeping tasks on the current
    /// runtime. Panics outside a tokio runtime; later calls are no-ops.
    pub fn start(&self) {
        self.start_on(&Handle::current());
    }

    /// Like [`start`](Self::start), on an explicit runtime.
    ///
    /// Every background task of the device (deadline watchers, periodic
    /// requests, queue adapters) runs there, so requests can be issued
    /// from any thread afterwards.
    pub fn start_on(&self, runtime: &Handle) {
        if self.inner.device.is_closed() {
            return;
        }
        let Some(inbound) = self.inner.device.take_inbound() else {
            return;
        };
        self.inner.started.store(true, Ordering::Release);
        self.inner.device.executor.start(runtime);

        let weak = Arc::downgrade(&self.inner);
        self.inner.device.run(dispatch_loop(weak, inbound));

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .device
            .poll(self.inner.config.poll_interval, move || match weak.upgrade() {
                Some(inner) => {
                    inner.on_poll();
                    false
                }
                None => true,
            });
        tracing::debug!(device = %self.inner.device.label(), "requester started");
    }

    /// Close the device. Idempotent; safe to call from inside a callback.
    ///
    /// Records already enqueued are still dispatched, then every pending
    /// queue closes and every subscription's finished callback runs once.
    pub fn close(&self) {
        if self.inner.device.begin_close() && !self.inner.started.load(Ordering::Acquire) {
            self.inner.finalize();
        }
    }

    /// Close and wait for every task owned by the device to finish.
    pub async fn shutdown(&self) {
        self.close();
        self.inner.device.executor.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.device.is_closed()
    }

    /// Wait for the device to close. Returns `false` on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.device.wait(timeout).await
    }

    /// Resolve once every record enqueued so far has been dispatched and
    /// its callbacks have run.
    pub async fn flush(&self) {
        self.inner.device.flush().await;
    }

    pub fn device(&self) -> &DeviceBase {
        &self.inner.device
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.inner.config
    }

    // ── Inbound / outbound ───────────────────────────────────────────

    /// Enqueue a record for dispatch. Never blocks.
    pub fn on_message(&self, record: Arc<DeviceDataRecord>) {
        self.inner.device.on_message(record);
    }

    /// Send a command without expecting a reply.
    pub fn send(&self, cmd: CommandRecord) {
        self.inner.device.send(cmd);
    }

    // ── Cached values ────────────────────────────────────────────────

    /// Latest supplement parsed for `key`.
    pub fn get_cached(&self, key: &DeviceKey) -> Option<Arc<P::Supplement>> {
        self.inner.cache.get(key)
    }

    /// Latest supplement parsed for any identity.
    pub fn latest(&self) -> Option<Arc<P::Supplement>> {
        self.inner.cache.latest()
    }

    pub fn get_key_value(&self, key: &KeyValueKey) -> Option<String> {
        self.inner.device.get_key_value(key)
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Send a command and collect the records tagged with its tag.
    ///
    /// A tag is generated if `cmd` has none. On a closed device the
    /// returned queue is already closed and nothing is sent.
    pub fn send_tagged_request(
        &self,
        cmd: CommandRecord,
        timeout: Option<Duration>,
        expect: Expect,
    ) -> Result<ResponseQueue<P::Supplement>, CoreError> {
        let queue = self.inner.submit_tagged(cmd, timeout, expect)?;
        self.inner.on_poll();
        Ok(queue)
    }

    /// Send a tagged `frame-request` to an identity.
    pub fn request_tagged(
        &self,
        key: &DeviceKey,
        timeout: Option<Duration>,
        expect: Expect,
    ) -> ResponseQueue<P::Supplement> {
        let cmd = CommandRecord::frame_request(key.device_type.clone(), key.device_name.clone())
            .with_tag(generate_tag());
        match self.send_tagged_request(cmd, timeout, expect) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(device = %self.inner.device.label(), error = %e, "tagged request not issued");
                ResponseQueue::closed()
            }
        }
    }

    /// Send an untagged `frame-request` and take the next record of
    /// `data_type` from that identity.
    ///
    /// The request is re-sent periodically until answered or timed out.
    pub fn request_untagged(
        &self,
        key: &DeviceKey,
        data_type: &str,
        timeout: Option<Duration>,
    ) -> ResponseQueue<P::Supplement> {
        let inner = &self.inner;
        let (tx, queue) = ResponseQueue::channel();
        let now = Instant::now();
        let deadline = timeout.map(|t| now + t);
        let request = PendingRequest::untagged(
            key.clone(),
            data_type.to_owned(),
            tx,
            deadline,
            now + inner.config.untagged_resend_interval,
        );
        let inserted = {
            // Checked under the lock so `finalize` cannot miss the request.
            let mut state = inner.lock_state();
            if inner.device.is_closed() {
                return ResponseQueue::closed();
            }
            state.pending.insert(request)
        };
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(device = %inner.device.label(), error = %e, "untagged request not issued");
                return ResponseQueue::closed();
            }
        };
        inner
            .device
            .send(CommandRecord::frame_request(key.device_type.clone(), key.device_name.clone()));
        inner.watch_deadline(id, deadline);
        inner.on_poll();
        queue
    }

    /// Install, replace or (with `None`) remove a periodic untagged request.
    pub fn set_untagged_request_period(
        &self,
        key: &DeviceKey,
        data_type: &str,
        period: Option<Duration>,
    ) -> Result<(), CoreError> {
        if let Some(period) = period {
            if period.is_zero() {
                return Err(CoreError::InvalidPeriod { period });
            }
        }

        let inner = &self.inner;
        let periodic_key = (key.clone(), data_type.to_owned());
        let stop = {
            let mut state = inner.lock_state();
            if let Some(period) = period {
                if state
                    .periodic
                    .get(&periodic_key)
                    .is_some_and(|p| p.period == period)
                {
                    return Ok(());
                }
            }
            if let Some(previous) = state.periodic.remove(&periodic_key) {
                previous.stop.cancel();
            }
            let Some(period) = period else {
                tracing::debug!(device = %key, data_type, "periodic request removed");
                return Ok(());
            };
            if inner.device.is_closed() {
                return Ok(());
            }
            let stop = inner.device.closed_token().child_token();
            state.periodic.insert(
                periodic_key,
                PeriodicRequest {
                    period,
                    stop: stop.clone(),
                },
            );
            (period, stop)
        };

        let (period, stop) = stop;
        tracing::debug!(device = %key, data_type, ?period, "periodic request installed");
        let weak = Arc::downgrade(inner);
        let target = key.clone();
        inner.device.poll_until(period, stop, move || {
            let Some(inner) = weak.upgrade() else {
                return true;
            };
            inner.device.send(CommandRecord::frame_request(
                target.device_type.clone(),
                target.device_name.clone(),
            ));
            false
        });
        Ok(())
    }

    /// Keep one tagged `frame-request` in flight for `key` while enabled.
    pub fn set_enable_tagged_request(&self, key: &DeviceKey, enabled: bool) {
        {
            let mut state = self.inner.lock_state();
            if enabled {
                state.tagged_streams.insert(key.clone());
            } else {
                state.tagged_streams.remove(key);
            }
        }
        self.inner.on_poll();
    }

    // ── Callbacks ────────────────────────────────────────────────────

    /// Register a callback for every parsed update.
    ///
    /// The callback runs on the callback lane and unsubscribes itself by
    /// returning `true`. `finished` runs exactly once when the
    /// subscription ends, however it ends.
    pub fn add_update_callback<F>(
        &self,
        callback: F,
        finished: Option<FinishedCallback>,
    ) -> UpdateSubscription
    where
        F: FnMut(&P::Supplement) -> bool + Send + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if inner.device.is_closed() {
            drop(state);
            if let Some(finished) = finished {
                inner.device.submit(finished);
            }
            return UpdateSubscription::finished();
        }
        let entry = state.subscriptions.add(Box::new(callback), finished);
        drop(state);

        let weak = Arc::downgrade(inner);
        UpdateSubscription::new(move || {
            end_subscription(&weak, &entry);
        })
    }

    /// Drain `queue` in the background, calling `callback` per element and
    /// `finished` once it closes.
    pub fn queue_to_callback<C, F>(&self, mut queue: ResponseQueue<P::Supplement>, callback: C, finished: F)
    where
        C: FnMut(Response<P::Supplement>) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let label = self.inner.device.label().to_owned();
        self.inner.device.run(async move {
            let mut callback = Some(callback);
            while let Some(item) = queue.recv().await {
                let Some(cb) = callback.as_mut() else { continue };
                if catch_unwind(AssertUnwindSafe(|| cb(item))).is_err() {
                    tracing::warn!(device = %label, "queue callback panicked, draining the rest");
                    callback = None;
                }
            }
            run_guarded(&label, finished);
        });
    }

    /// Drain `queue` and report a single outcome: the parsed value to
    /// `callback`, or a `Status` to `error_callback`.
    pub fn queue_to_error_callback<C, E>(
        &self,
        queue: ResponseQueue<P::Supplement>,
        callback: C,
        error_callback: E,
    ) where
        C: FnOnce(Arc<P::Supplement>) + Send + 'static,
        E: FnOnce(Status) + Send + 'static,
    {
        self.queue_to_error_callback_transform(queue, callback, error_callback, |_, supplement| {
            supplement.cloned()
        });
    }

    /// Like [`queue_to_error_callback`](Self::queue_to_error_callback) with
    /// a caller-supplied mapping from each element to the reported value.
    pub fn queue_to_error_callback_transform<U, C, E, X>(
        &self,
        queue: ResponseQueue<P::Supplement>,
        callback: C,
        error_callback: E,
        transform: X,
    ) where
        U: Send + 'static,
        C: FnOnce(U) + Send + 'static,
        E: FnOnce(Status) + Send + 'static,
        X: FnMut(&DeviceDataRecord, Option<&Arc<P::Supplement>>) -> Option<U> + Send + 'static,
    {
        let label = self.inner.device.label().to_owned();
        self.inner.device.run(async move {
            let items = queue.drain().await;
            match resolve_outcome(&items, transform) {
                Outcome::Value(value) => run_guarded(&label, move || callback(value)),
                Outcome::Failed(status) => run_guarded(&label, move || error_callback(status)),
            }
        });
    }

    // ── Background work ──────────────────────────────────────────────

    /// Run a future in the background; `shutdown` waits for it.
    pub fn run<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.device.run(fut);
    }

    /// Call `f` every `period` until it returns `true` or the device closes.
    pub fn poll<F>(&self, period: Duration, f: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.inner.device.poll(period, f);
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    /// Number of live update subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock_state().subscriptions.len()
    }
}

impl<P: MessageParser> std::fmt::Debug for Requester<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("device", &self.inner.device)
            .finish_non_exhaustive()
    }
}

// ── Internals ────────────────────────────────────────────────────────

impl<P: MessageParser> RequesterInner<P> {
    fn lock_state(&self) -> MutexGuard<'_, RequesterState<P::Supplement>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register and send a tagged command without running housekeeping.
    fn submit_tagged(
        self: &Arc<Self>,
        mut cmd: CommandRecord,
        timeout: Option<Duration>,
        expect: Expect,
    ) -> Result<ResponseQueue<P::Supplement>, CoreError> {
        let tag = match cmd.tag.clone() {
            Some(tag) => tag,
            None => {
                let tag = generate_tag();
                cmd.tag = Some(tag.clone());
                tag
            }
        };
        let (tx, queue) = ResponseQueue::channel();
        let deadline = timeout.map(|t| Instant::now() + t);
        let request = PendingRequest::tagged(cmd.device_key(), tag.clone(), expect, tx, deadline);
        let id = {
            // Checked under the lock so `finalize` cannot miss the request.
            let mut state = self.lock_state();
            if self.device.is_closed() {
                drop(state);
                tracing::debug!(device = %self.device.label(), tag = %tag, "device closed, request not sent");
                return Ok(ResponseQueue::closed());
            }
            state.pending.insert(request)?
        };
        self.device.send(cmd);
        self.watch_deadline(id, deadline);
        Ok(queue)
    }

    /// Expire request `id` at `deadline`. Past deadlines are left to `on_poll`.
    fn watch_deadline(self: &Arc<Self>, id: u64, deadline: Option<Instant>) {
        let Some(deadline) = deadline else { return };
        if deadline <= Instant::now() {
            return;
        }
        let weak = Arc::downgrade(self);
        let closed = self.device.closed_token();
        self.device.run(async move {
            tokio::select! {
                biased;
                () = closed.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.lock_state().pending.expire(id, Instant::now());
                    }
                }
            }
        });
    }

    /// Housekeeping: expire, re-send untagged requests, keep tagged streams alive.
    fn on_poll(self: &Arc<Self>) {
        let now = Instant::now();
        let (resends, streams) = {
            let mut state = self.lock_state();
            let resends = state
                .pending
                .poll(now, self.config.untagged_resend_interval);
            let streams: Vec<DeviceKey> = state
                .tagged_streams
                .iter()
                .filter(|key| !state.pending.has_live_tagged(key))
                .cloned()
                .collect();
            (resends, streams)
        };
        if self.device.is_closed() {
            return;
        }
        for cmd in resends {
            self.device.send(cmd);
        }
        for key in streams {
            let cmd = CommandRecord::frame_request(key.device_type.clone(), key.device_name.clone());
            if let Err(e) = self.submit_tagged(
                cmd,
                Some(self.config.tagged_stream_timeout),
                Expect::terminal(),
            ) {
                tracing::warn!(device = %key, error = %e, "tagged stream request not issued");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, record: Arc<DeviceDataRecord>) {
        tracing::trace!(
            device = %self.device.label(),
            device_type = %record.device_type,
            device_name = %record.device_name,
            data_type = %record.data_type,
            tag = record.tag.as_deref().unwrap_or_default(),
            "dispatching record"
        );
        let supplement = self.parser.get_message_supplement(&record).map(Arc::new);
        self.device.record_key_value(&record);
        if let Some(value) = &supplement {
            self.cache.update(record.device_key(), Arc::clone(value));
        }

        let subscribers = {
            let mut state = self.lock_state();
            let matched = state.pending.dispatch(&record, supplement.as_ref());
            if !matched {
                if let Some(tag) = record.tag.as_deref() {
                    tracing::trace!(device = %self.device.label(), tag, "no pending request for tag");
                }
            }
            if supplement.is_some() {
                state.subscriptions.snapshot()
            } else {
                Vec::new()
            }
        };

        if let Some(value) = supplement {
            for entry in subscribers {
                self.notify(entry, Arc::clone(&value));
            }
        }
        self.on_poll();
    }

    fn notify(self: &Arc<Self>, entry: Arc<SubscriptionEntry<P::Supplement>>, value: Arc<P::Supplement>) {
        let weak = Arc::downgrade(self);
        self.device.submit(Box::new(move || {
            if entry.invoke(&value) {
                end_subscription(&weak, &entry);
            }
        }));
    }

    /// Tear down after the last pre-close record has been dispatched.
    fn finalize(&self) {
        let (entries, periodic) = {
            let mut state = self.lock_state();
            state.pending.close_all();
            state.tagged_streams.clear();
            (
                state.subscriptions.drain(),
                std::mem::take(&mut state.periodic),
            )
        };
        for request in periodic.into_values() {
            request.stop.cancel();
        }
        for entry in entries {
            if entry.deactivate() {
                self.device.submit(Box::new(move || entry.finish()));
            }
        }
        self.cache.clear();
        self.device.executor.close_lane();
        tracing::debug!(device = %self.device.label(), "device closed");
    }
}

/// Deactivate, unregister and schedule the finished callback, once.
fn end_subscription<P: MessageParser>(
    weak: &Weak<RequesterInner<P>>,
    entry: &Arc<SubscriptionEntry<P::Supplement>>,
) {
    if !entry.deactivate() {
        return;
    }
    let entry = Arc::clone(entry);
    match weak.upgrade() {
        Some(inner) => {
            inner.lock_state().subscriptions.remove(entry.id);
            inner.device.submit(Box::new(move || entry.finish()));
        }
        None => entry.finish(),
    }
}

async fn dispatch_loop<P: MessageParser>(
    weak: Weak<RequesterInner<P>>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(item) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match item {
            Inbound::Record(record) => inner.dispatch(record),
            Inbound::Flush(done) => inner.device.submit(Box::new(move || {
                let _ = done.send(());
            })),
            Inbound::Close => {
                inner.finalize();
                break;
            }
        }
    }
}

// ── Outcome resolution ───────────────────────────────────────────────

#[derive(Debug)]
enum Outcome<U> {
    Value(U),
    Failed(Status),
}

/// Reduce a drained queue to one outcome.
///
/// A failed final status wins; then the last transformed value; then the
/// last status of any kind; then a synthesized timeout.
fn resolve_outcome<T, U, X>(items: &[Response<T>], mut transform: X) -> Outcome<U>
where
    X: FnMut(&DeviceDataRecord, Option<&Arc<T>>) -> Option<U>,
{
    let mut value = None;
    let mut last_status = None;
    for (record, supplement) in items {
        if let Some(mapped) = transform(record, supplement.as_ref()) {
            value = Some(mapped);
        }
        if record.is_cmd_status() {
            last_status = Some(Status::from_record(record));
        }
    }

    match (value, last_status) {
        (_, Some(status)) if status.is_error() => Outcome::Failed(status),
        (Some(value), _) => Outcome::Value(value),
        (None, Some(status)) => Outcome::Failed(status),
        (None, None) => Outcome::Failed(Status::timeout()),
    }
}
