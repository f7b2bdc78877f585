// ── Command status ──
//
// Caller-facing summary of a `cmd-status` record, used by the
// error-callback helpers and facade operations that report an outcome
// rather than data.

use chrono::{DateTime, Utc};
use reachlink_api::{CommandStatus, DeviceDataRecord};

/// Error string of the status synthesized when nothing answered in time.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Outcome of a tagged command.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub time: DateTime<Utc>,
    pub sequence: i64,
    /// `None` when the record carried no (or an unknown) status string.
    pub status: Option<CommandStatus>,
    pub script: String,
    pub error: String,
    pub progress: f64,
    pub message: String,
    pub code: i64,
}

impl Status {
    /// A status with the given marker and error, stamped now.
    pub fn new(status: CommandStatus, error: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            sequence: 0,
            status: Some(status),
            script: String::new(),
            error: error.into(),
            progress: 0.0,
            message: String::new(),
            code: 0,
        }
    }

    /// `done` with error `timeout`: no answer arrived before the deadline.
    pub fn timeout() -> Self {
        Self::new(CommandStatus::Done, TIMEOUT_ERROR)
    }

    /// A status rejected locally, before anything was sent.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self::new(CommandStatus::Rejected, error)
    }

    pub fn from_record(record: &DeviceDataRecord) -> Self {
        Self {
            time: record.timestamp(),
            sequence: record.seq,
            status: record.status,
            script: record.script.clone(),
            error: record.error.clone(),
            progress: record.progress,
            message: record.message.clone(),
            code: record.code,
        }
    }

    /// True if no further status will follow this one.
    pub fn is_last_status(&self) -> bool {
        self.status.is_some_and(CommandStatus::is_terminal)
    }

    /// True if the command failed: rejected, aborted, or an error was reported.
    pub fn is_error(&self) -> bool {
        self.status.is_some_and(CommandStatus::is_failure) || !self.error.is_empty()
    }

    pub fn is_timeout(&self) -> bool {
        self.error == TIMEOUT_ERROR
    }
}
