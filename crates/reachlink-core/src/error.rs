// ── Core error types ──
//
// Programming-level failures of the dispatch engine. Business outcomes
// (a rejected command, a timed-out request) are never errors: they arrive
// as records in a response queue or as a `Status`.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("{target} is closed")]
    Closed { target: String },

    #[error("No tokio runtime to start the device on")]
    NoRuntime,

    // ── Request errors ───────────────────────────────────────────────
    #[error("Tag already in use by a pending request: {tag}")]
    DuplicateTag { tag: String },

    #[error("Request period must be greater than zero (got {period:?})")]
    InvalidPeriod { period: Duration },

    // ── Wire errors (wrapped) ────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(#[from] reachlink_api::Error),
}
