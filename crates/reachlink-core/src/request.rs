// ── Pending requests ──
//
// One outstanding request and the rules that decide when it resolves.
// Resolving drops the response sender, which closes the caller's queue
// once it has drained what was already delivered.

use std::sync::Arc;
use std::time::Duration;

use reachlink_api::{CommandRecord, CommandStatus, DeviceDataRecord, DeviceKey};
use tokio::time::Instant;

use crate::queue::{Response, ResponseSender};

/// When a tagged request closes its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect {
    /// Close after this many entries instead of waiting for a terminal status.
    pub messages: Option<usize>,
    /// With `messages` set, also wait for a trailing `done` status.
    pub cmd_status: bool,
}

impl Expect {
    /// Close only on a terminal `cmd-status` record (or timeout).
    pub const fn terminal() -> Self {
        Self {
            messages: None,
            cmd_status: true,
        }
    }

    /// Close once `n` entries have been delivered.
    pub const fn messages(n: usize) -> Self {
        Self {
            messages: Some(n),
            cmd_status: false,
        }
    }

    /// Close once `n` data entries and a trailing `done` status have arrived.
    pub const fn messages_then_status(n: usize) -> Self {
        Self {
            messages: Some(n),
            cmd_status: true,
        }
    }
}

impl Default for Expect {
    fn default() -> Self {
        Self::terminal()
    }
}

#[derive(Debug)]
pub(crate) enum Matcher {
    Tagged { tag: String, expect: Expect },
    Untagged { data_type: String },
}

#[derive(Debug)]
pub(crate) struct PendingRequest<T> {
    pub(crate) id: u64,
    key: DeviceKey,
    matcher: Matcher,
    sender: Option<ResponseSender<T>>,
    deadline: Option<Instant>,
    resend_at: Option<Instant>,
    delivered: usize,
    held_status: Option<Response<T>>,
}

impl<T> PendingRequest<T> {
    pub(crate) fn tagged(
        key: DeviceKey,
        tag: String,
        expect: Expect,
        sender: ResponseSender<T>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id: 0,
            key,
            matcher: Matcher::Tagged { tag, expect },
            sender: Some(sender),
            deadline,
            resend_at: None,
            delivered: 0,
            held_status: None,
        }
    }

    pub(crate) fn untagged(
        key: DeviceKey,
        data_type: String,
        sender: ResponseSender<T>,
        deadline: Option<Instant>,
        resend_at: Instant,
    ) -> Self {
        Self {
            id: 0,
            key,
            matcher: Matcher::Untagged { data_type },
            sender: Some(sender),
            deadline,
            resend_at: Some(resend_at),
            delivered: 0,
            held_status: None,
        }
    }

    pub(crate) fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub(crate) fn tag(&self) -> Option<&str> {
        match &self.matcher {
            Matcher::Tagged { tag, .. } => Some(tag),
            Matcher::Untagged { .. } => None,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }

    /// Untagged requests answer to any record of their identity and data type.
    pub(crate) fn accepts_untagged(&self, record: &DeviceDataRecord) -> bool {
        match &self.matcher {
            Matcher::Untagged { data_type } => {
                !self.is_resolved()
                    && *data_type == record.data_type
                    && self.key.matches(&record.device_type, &record.device_name)
            }
            Matcher::Tagged { .. } => false,
        }
    }

    /// Hand a matching record to the caller and resolve if this ends the request.
    pub(crate) fn deliver(&mut self, response: Response<T>) {
        match self.matcher {
            Matcher::Untagged { .. } => {
                self.push(response);
                self.resolve();
            }
            Matcher::Tagged { expect, .. } => self.deliver_tagged(response, expect),
        }
    }

    fn deliver_tagged(&mut self, response: Response<T>, expect: Expect) {
        let record = Arc::clone(&response.0);
        if let Some(limit) = expect.messages {
            let clean_done = record.is_cmd_status()
                && record.status == Some(CommandStatus::Done)
                && record.error.is_empty();
            if clean_done && self.delivered < limit {
                self.held_status = Some(response);
                return;
            }
            self.push(response);
            if self.delivered >= limit && (self.held_status.is_some() || !expect.cmd_status) {
                if let Some(held) = self.held_status.take() {
                    self.push(held);
                }
                self.resolve();
                return;
            }
        } else {
            self.push(response);
        }
        if record.is_terminal() {
            self.resolve();
        }
    }

    fn push(&mut self, response: Response<T>) {
        self.delivered += 1;
        if let Some(sender) = &self.sender {
            // A caller that dropped its queue still lets the request run its course.
            let _ = sender.send(response);
        }
    }

    /// Close the queue. Anything already delivered stays readable.
    pub(crate) fn resolve(&mut self) {
        if let Some(held) = self.held_status.take() {
            self.push(held);
        }
        self.sender = None;
    }

    /// Expire the request if its deadline passed.
    pub(crate) fn expire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now && !self.is_resolved() => {
                tracing::debug!(
                    device = %self.key,
                    tag = self.tag().unwrap_or_default(),
                    "request timed out"
                );
                self.resolve();
                true
            }
            _ => false,
        }
    }

    /// The command to re-send if an untagged request is still waiting.
    pub(crate) fn resend_if_due(
        &mut self,
        now: Instant,
        interval: Duration,
    ) -> Option<CommandRecord> {
        if self.is_resolved() {
            return None;
        }
        let resend_at = self.resend_at?;
        if resend_at > now {
            return None;
        }
        self.resend_at = Some(now + interval);
        Some(CommandRecord::frame_request(
            self.key.device_type.clone(),
            self.key.device_name.clone(),
        ))
    }
}
