// ── Pending request table ──
//
// Every outstanding request of one requester, in issue order. Tagged
// records go to the request holding that tag; untagged interest is served
// FIFO, so only the oldest waiting request for an identity and data type
// sees a given record.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reachlink_api::{CommandRecord, DeviceDataRecord, DeviceKey};
use tokio::time::Instant;

use crate::error::CoreError;
use crate::request::PendingRequest;

#[derive(Debug)]
pub(crate) struct PendingTable<T> {
    requests: Vec<PendingRequest<T>>,
    tags: HashSet<String>,
    next_id: u64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            tags: HashSet::new(),
            next_id: 1,
        }
    }
}

impl<T> PendingTable<T> {
    /// Register a request and return its id. Tags must be unique among
    /// live requests.
    pub(crate) fn insert(&mut self, mut request: PendingRequest<T>) -> Result<u64, CoreError> {
        if let Some(tag) = request.tag() {
            if self.tags.contains(tag) {
                return Err(CoreError::DuplicateTag {
                    tag: tag.to_owned(),
                });
            }
            self.tags.insert(tag.to_owned());
        }
        let id = self.next_id;
        self.next_id += 1;
        request.id = id;
        self.requests.push(request);
        Ok(id)
    }

    /// Route a record to the requests it answers. Returns `true` if any
    /// request took it.
    pub(crate) fn dispatch(&mut self, record: &Arc<DeviceDataRecord>, supplement: Option<&Arc<T>>) -> bool {
        let mut delivered = false;

        if let Some(tag) = record.tag.as_deref() {
            if let Some(request) = self
                .requests
                .iter_mut()
                .find(|r| !r.is_resolved() && r.tag() == Some(tag))
            {
                request.deliver((Arc::clone(record), supplement.map(Arc::clone)));
                delivered = true;
            }
        }

        if let Some(request) = self.requests.iter_mut().find(|r| r.accepts_untagged(record)) {
            request.deliver((Arc::clone(record), supplement.map(Arc::clone)));
            delivered = true;
        }

        self.prune();
        delivered
    }

    /// Expire overdue requests and collect untagged resends.
    pub(crate) fn poll(&mut self, now: Instant, resend_interval: Duration) -> Vec<CommandRecord> {
        let mut resends = Vec::new();
        for request in &mut self.requests {
            request.expire_if_due(now);
            if let Some(cmd) = request.resend_if_due(now, resend_interval) {
                resends.push(cmd);
            }
        }
        self.prune();
        resends
    }

    /// Expire one request by id if its deadline passed.
    pub(crate) fn expire(&mut self, id: u64, now: Instant) {
        if let Some(request) = self.requests.iter_mut().find(|r| r.id == id) {
            request.expire_if_due(now);
        }
        self.prune();
    }

    /// True if a tagged request for `key` is still outstanding.
    pub(crate) fn has_live_tagged(&self, key: &DeviceKey) -> bool {
        self.requests
            .iter()
            .any(|r| r.tag().is_some() && !r.is_resolved() && r.key() == key)
    }

    /// Resolve everything. Used when the device closes.
    pub(crate) fn close_all(&mut self) {
        for request in &mut self.requests {
            request.resolve();
        }
        self.requests.clear();
        self.tags.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    fn prune(&mut self) {
        let tags = &mut self.tags;
        self.requests.retain(|r| {
            if r.is_resolved() {
                if let Some(tag) = r.tag() {
                    tags.remove(tag);
                }
                false
            } else {
                true
            }
        });
    }
}
