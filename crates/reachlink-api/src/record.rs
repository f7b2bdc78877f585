// ── Wire records ──
//
// The two record kinds carried over the host channel: outbound commands
// and inbound device data. Field names follow the host's camelCase JSON;
// empty strings and zero values are omitted on the wire.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// `data_type` of the status records that close a tagged interaction.
pub const CMD_STATUS: &str = "cmd-status";

/// `data_type` of the generic "send me your current data" command.
pub const FRAME_REQUEST: &str = "frame-request";

/// `data_type` of key/value configuration records.
pub const KEY_VALUE: &str = "key-value";

// ── CommandStatus ────────────────────────────────────────────────────

/// Progress marker carried by `cmd-status` records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Executing,
    Done,
    Rejected,
    Aborted,
}

impl CommandStatus {
    /// `done`, `rejected` and `aborted` end an interaction; `executing` does not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Executing)
    }

    /// `rejected` and `aborted` report a failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Rejected | Self::Aborted)
    }
}

// ── DeviceKey ────────────────────────────────────────────────────────

/// Identity of a logical remote endpoint: `(device_type, device_name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub device_type: String,
    pub device_name: String,
}

impl DeviceKey {
    pub fn new(device_type: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
        }
    }

    /// True when the record was emitted by (or addressed to) this device.
    pub fn matches(&self, device_type: &str, device_name: &str) -> bool {
        self.device_type == device_type && self.device_name == device_name
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device_name.is_empty() {
            f.write_str(&self.device_type)
        } else {
            write!(f, "{}/{}", self.device_type, self.device_name)
        }
    }
}

// ── DeviceDataRecord ─────────────────────────────────────────────────

/// An inbound record received from the host.
///
/// Only the fields the dispatch engine reasons about are typed. Everything
/// else the host sends (image paths, joint states, metric fields, ...)
/// lands in `extra` and is left to the device facades.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDataRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_type: String,

    /// Correlation tag echoed from a tagged command. Empty on the wire means `None`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty_string"
    )]
    pub tag: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ts: i64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: i64,

    /// Unknown status strings decode as `None` rather than failing the record.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_status"
    )]
    pub status: Option<CommandStatus>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub progress: f64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// All remaining fields the host sends.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceDataRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
            data_type: data_type.into(),
            ts: Utc::now().timestamp_millis(),
            ..Self::default()
        }
    }

    /// Build a `cmd-status` record answering `tag`.
    pub fn cmd_status(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        tag: impl Into<String>,
        status: CommandStatus,
    ) -> Self {
        Self {
            tag: Some(tag.into()),
            status: Some(status),
            ..Self::new(device_type, device_name, CMD_STATUS)
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn with_extra(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(field.into(), value);
        self
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(self.device_type.clone(), self.device_name.clone())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        millis_to_datetime(self.ts)
    }

    pub fn is_cmd_status(&self) -> bool {
        self.data_type == CMD_STATUS
    }

    /// True when this record closes a tagged interaction: a `cmd-status`
    /// record that is `done`/`rejected`/`aborted` or carries an error.
    pub fn is_terminal(&self) -> bool {
        self.is_cmd_status()
            && (self.status.is_some_and(CommandStatus::is_terminal) || !self.error.is_empty())
    }
}

// ── CommandRecord ────────────────────────────────────────────────────

/// An outbound command. A tag marks it as awaiting correlated replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_type: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty_string"
    )]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub ts: i64,

    /// Command-specific fields (pointer coordinates, script names, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommandRecord {
    /// Build an untagged command stamped with the current time.
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
            data_type: data_type.into(),
            tag: None,
            ts: Utc::now().timestamp_millis(),
            extra: serde_json::Map::new(),
        }
    }

    /// An untagged `frame-request` for a device.
    pub fn frame_request(device_type: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self::new(device_type, device_name, FRAME_REQUEST)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_extra(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(field.into(), value);
        self
    }

    pub fn device_key(&self) -> DeviceKey {
        DeviceKey::new(self.device_type.clone(), self.device_name.clone())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        millis_to_datetime(self.ts)
    }
}

// ── Serde helpers ────────────────────────────────────────────────────

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()))
}

fn lenient_status<'de, D>(deserializer: D) -> Result<Option<CommandStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}
