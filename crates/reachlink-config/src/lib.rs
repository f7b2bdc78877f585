//! Configuration for reachlink clients.
//!
//! TOML profiles (one per host), global pacing defaults, environment
//! overrides, and translation to `reachlink_core::HostConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use reachlink_api::ReconnectConfig;
use reachlink_core::{HostConfig, RequesterConfig};

/// Prefix of environment overrides; nested keys are separated by `__`,
/// e.g. `REACHLINK_DEFAULTS__POLL_INTERVAL_MS=250`.
pub const ENV_PREFIX: &str = "REACHLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named host profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Pacing shared by every profile. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_untagged_resend_ms")]
    pub untagged_resend_interval_ms: u64,

    #[serde(default = "default_tagged_stream_timeout_ms")]
    pub tagged_stream_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Give up reconnecting after this many attempts. Unset retries forever.
    #[serde(default)]
    pub reconnect_max_retries: Option<u32>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            untagged_resend_interval_ms: default_untagged_resend_ms(),
            tagged_stream_timeout_ms: default_tagged_stream_timeout_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_ms(),
            reconnect_max_delay_ms: default_reconnect_max_ms(),
            reconnect_max_retries: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_untagged_resend_ms() -> u64 {
    1_000
}
fn default_tagged_stream_timeout_ms() -> u64 {
    20_000
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

/// A named host profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Override the global poll interval for this host.
    pub poll_interval_ms: Option<u64>,

    /// Override the global tagged stream timeout for this host.
    pub tagged_stream_timeout_ms: Option<u64>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            poll_interval_ms: None,
            tagged_stream_timeout_ms: None,
        }
    }
}

fn default_address() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    50008
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "reachlink", "reachlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("reachlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full config from the canonical file plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load config from `path` plus environment. A missing file is not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, falling back to defaults on any error.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML at the canonical path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profile resolution ──────────────────────────────────────────────

/// Pick the named profile, else the default one. A default profile that
/// is not listed resolves to built-in settings.
pub fn select_profile<'a>(
    cfg: &'a Config,
    name: Option<&'a str>,
) -> Result<(&'a str, Profile), ConfigError> {
    let name = name
        .or(cfg.default_profile.as_deref())
        .unwrap_or("default");
    match cfg.profiles.get(name) {
        Some(profile) => Ok((name, profile.clone())),
        None if Some(name) == cfg.default_profile.as_deref() => Ok((name, Profile::default())),
        None => Err(ConfigError::UnknownProfile {
            profile: name.into(),
        }),
    }
}

/// Build a validated `HostConfig` from a profile and the global defaults.
pub fn profile_to_host_config(profile: &Profile, defaults: &Defaults) -> Result<HostConfig, ConfigError> {
    if profile.address.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "address".into(),
            reason: "must not be empty".into(),
        });
    }
    if profile.port == 0 {
        return Err(ConfigError::Validation {
            field: "port".into(),
            reason: "must be non-zero".into(),
        });
    }

    let requester = RequesterConfig {
        poll_interval: non_zero_ms(
            "poll_interval_ms",
            profile.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
        )?,
        untagged_resend_interval: non_zero_ms(
            "untagged_resend_interval_ms",
            defaults.untagged_resend_interval_ms,
        )?,
        tagged_stream_timeout: non_zero_ms(
            "tagged_stream_timeout_ms",
            profile
                .tagged_stream_timeout_ms
                .unwrap_or(defaults.tagged_stream_timeout_ms),
        )?,
    };

    let initial_delay = non_zero_ms("reconnect_initial_delay_ms", defaults.reconnect_initial_delay_ms)?;
    let max_delay = non_zero_ms("reconnect_max_delay_ms", defaults.reconnect_max_delay_ms)?;
    if max_delay < initial_delay {
        return Err(ConfigError::Validation {
            field: "reconnect_max_delay_ms".into(),
            reason: "must not be below reconnect_initial_delay_ms".into(),
        });
    }

    Ok(HostConfig {
        address: profile.address.clone(),
        port: profile.port,
        reconnect: ReconnectConfig {
            initial_delay,
            max_delay,
            max_retries: defaults.reconnect_max_retries,
        },
        requester,
    })
}

fn non_zero_ms(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_millis(ms))
}
