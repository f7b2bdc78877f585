// ── Update subscriptions ──
//
// Persistent callbacks fired for every parsed update. Each subscription
// deactivates at most once, and its finished callback runs at most once,
// whichever of cancel, "callback returned true" or device close gets
// there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with each update. Returning `true` unsubscribes.
pub type UpdateCallback<T> = Box<dyn FnMut(&T) -> bool + Send>;

/// Callback invoked once when a subscription ends.
pub type FinishedCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct SubscriptionEntry<T> {
    pub(crate) id: u64,
    active: AtomicBool,
    callback: Mutex<UpdateCallback<T>>,
    finished: Mutex<Option<FinishedCallback>>,
}

impl<T> SubscriptionEntry<T> {
    /// Run the update callback. Returns `true` if it asked to unsubscribe.
    /// Inactive subscriptions are skipped.
    pub(crate) fn invoke(&self, value: &T) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        callback(value)
    }

    /// Mark inactive. Returns `true` only for the call that flipped it.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run the finished callback if it has not run yet.
    pub(crate) fn finish(&self) {
        let finished = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(finished) = finished {
            finished();
        }
    }
}

pub(crate) struct SubscriptionRegistry<T> {
    entries: Vec<Arc<SubscriptionEntry<T>>>,
    next_id: u64,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T> SubscriptionRegistry<T> {
    pub(crate) fn add(
        &mut self,
        callback: UpdateCallback<T>,
        finished: Option<FinishedCallback>,
    ) -> Arc<SubscriptionEntry<T>> {
        let entry = Arc::new(SubscriptionEntry {
            id: self.next_id,
            active: AtomicBool::new(true),
            callback: Mutex::new(callback),
            finished: Mutex::new(finished),
        });
        self.next_id += 1;
        self.entries.push(Arc::clone(&entry));
        entry
    }

    /// Active subscriptions, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<SubscriptionEntry<T>>> {
        self.entries.iter().filter(|e| e.is_active()).cloned().collect()
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<SubscriptionEntry<T>>> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Public handle ────────────────────────────────────────────────────

/// Handle returned by `add_update_callback`.
///
/// Cheap to clone. [`cancel`](Self::cancel) is idempotent and safe to call
/// from any thread, including from inside the callback itself.
#[derive(Clone)]
pub struct UpdateSubscription {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl UpdateSubscription {
    pub(crate) fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// A handle for a subscription that already ended.
    pub(crate) fn finished() -> Self {
        Self::new(|| {})
    }

    /// Stop delivering updates; the finished callback runs once.
    pub fn cancel(&self) {
        (self.cancel)();
    }
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription").finish_non_exhaustive()
    }
}
