// ── Runtime configuration ──
//
// Plain structs describing how the engine paces itself and where the host
// lives. Callers build these (or load them through `reachlink-config`);
// the core never touches disk.

use std::time::Duration;

use reachlink_api::ReconnectConfig;

/// Pacing of a single requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterConfig {
    /// Housekeeping tick: expiry, untagged resends, tagged streams.
    pub poll_interval: Duration,
    /// How often an unanswered untagged request re-sends its command.
    pub untagged_resend_interval: Duration,
    /// Timeout of each tagged request issued for a streaming identity.
    pub tagged_stream_timeout: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            untagged_resend_interval: Duration::from_secs(1),
            tagged_stream_timeout: Duration::from_secs(20),
        }
    }
}

/// Where the host listens and how devices attached to it behave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub address: String,
    pub port: u16,
    pub reconnect: ReconnectConfig,
    pub requester: RequesterConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: "localhost".into(),
            port: 50008,
            reconnect: ReconnectConfig::default(),
            requester: RequesterConfig::default(),
        }
    }
}
