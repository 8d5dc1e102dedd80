//! Session client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconnect::{DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_CAP};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("reconnect cap ({cap:?}) is below the reconnect base ({base:?})")]
    CapBelowBase { base: Duration, cap: Duration },
    #[error("base url must not be empty")]
    EmptyBaseUrl,
}

/// Session client configuration.
///
/// Durations are written as milliseconds in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP(S) or WS(S) origin of the meeting server.
    pub base_url: String,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_base: Duration,
    #[serde(with = "duration_ms")]
    pub reconnect_cap: Duration,
    /// Upper bound on waiting for a close handshake.
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
    /// Keep at most this many inbound messages; `None` keeps all of them.
    pub message_log_capacity: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            message_log_capacity: None,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        for (field, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("reconnect_base", self.reconnect_base),
            ("reconnect_cap", self.reconnect_cap),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        if self.reconnect_cap < self.reconnect_base {
            return Err(ConfigError::CapBelowBase {
                base: self.reconnect_base,
                cap: self.reconnect_cap,
            });
        }
        Ok(())
    }
}

/// `serde(with)` helper storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
