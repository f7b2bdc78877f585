use thiserror::Error;

/// Top-level error type for the `reachlink-api` crate.
///
/// Covers the wire layer only: framing, JSON, and the transports.
/// `reachlink-core` wraps these in its own error type.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not reach the remote host.
    #[error("Cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The transport was shut down; no further commands are accepted.
    #[error("Transport closed")]
    TransportClosed,

    // ── Framing ─────────────────────────────────────────────────────
    /// A line could not be framed (too long, invalid UTF-8, ...).
    #[error("Framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if reconnecting might resolve the error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connect { .. } | Self::Codec(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_not_transient() {
        assert!(!Error::TransportClosed.is_transient());
        assert!(
            Error::Connect {
                addr: "localhost:50008".into(),
                reason: "refused".into(),
            }
            .is_transient()
        );
    }
}
