//! HTTP uploader for heart-rate readings.

use chrono::Utc;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::IngestConfig;

pub const HEART_RATE_PATH: &str = "/api/heart_rate";
pub const USER_HEADER: &str = "X-User-Id";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}")]
    Status { status: u16 },
    #[error("invalid user id header `{0}`")]
    InvalidUserId(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Body of `POST /api/heart_rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRatePayload {
    pub bpm: u32,
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl HeartRatePayload {
    /// Reading taken now.
    pub fn now(bpm: u32) -> Self {
        Self {
            bpm,
            ts: Utc::now().timestamp_millis(),
            source: None,
            confidence: None,
            device: None,
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    /// `None` when no response was received at all.
    pub status: Option<u16>,
}

pub struct HeartRateUploader {
    http: reqwest::Client,
    config: IngestConfig,
    user_header: HeaderValue,
}

impl HeartRateUploader {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let user_id = config.effective_user_id();
        let user_header = HeaderValue::from_str(user_id)
            .map_err(|_| IngestError::InvalidUserId(user_id.to_string()))?;
        Ok(Self {
            http,
            config,
            user_header,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Reading for `bpm` stamped now, with the configured labels.
    pub fn reading(&self, bpm: u32) -> HeartRatePayload {
        HeartRatePayload {
            source: self.config.source.clone(),
            device: self.config.device.clone(),
            ..HeartRatePayload::now(bpm)
        }
    }

    /// POST one reading. Any non-2xx answer is an error.
    pub async fn post_heart_rate(&self, payload: &HeartRatePayload) -> Result<()> {
        let response = self
            .http
            .post(self.url(HEART_RATE_PATH))
            .header(USER_HEADER, self.user_header.clone())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status {
                status: status.as_u16(),
            });
        }
        log::debug!("Uploaded {} bpm", payload.bpm);
        Ok(())
    }

    /// GET the base URL. Never fails; transport errors read as unhealthy.
    pub async fn health_check(&self) -> HealthStatus {
        match self.http.get(self.url("")).send().await {
            Ok(response) => {
                let status = response.status();
                HealthStatus {
                    healthy: status.is_success(),
                    status: Some(status.as_u16()),
                }
            }
            Err(e) => {
                log::warn!("Health check failed: {e}");
                HealthStatus {
                    healthy: false,
                    status: None,
                }
            }
        }
    }
}
