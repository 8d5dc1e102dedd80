//! # magheart-ingest — Heart-rate ingestion client
//!
//! Posts heart-rate readings to the MagHeart backend and checks that the
//! backend is reachable.
//!
//! - [`uploader`] — `POST /api/heart_rate` and the health check
//! - [`relay`] — Forward a channel of bpm values to the uploader
//! - [`config`] — Ingestion configuration

pub mod config;
pub mod relay;
pub mod uploader;

pub use config::IngestConfig;
pub use relay::{run_relay, RelayStats};
pub use uploader::{HealthStatus, HeartRatePayload, HeartRateUploader, IngestError};
