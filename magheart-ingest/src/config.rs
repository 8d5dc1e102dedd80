//! Ingestion client configuration.

use std::time::Duration;

use magheart_session::config::duration_ms;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_USER_ID: &str = "demo";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Heart-rate ingestion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Backend origin; readings go to `{base_url}/api/heart_rate`.
    pub base_url: String,
    /// Sent as `X-User-Id`. Empty means [`DEFAULT_USER_ID`].
    pub user_id: String,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Optional `source` label attached to every reading.
    pub source: Option<String>,
    /// Optional `device` label attached to every reading.
    pub device: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_id: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            source: None,
            device: None,
        }
    }
}

impl IngestConfig {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// User id to report, with the `demo` fallback applied.
    pub fn effective_user_id(&self) -> &str {
        if self.user_id.trim().is_empty() {
            DEFAULT_USER_ID
        } else {
            &self.user_id
        }
    }
}
