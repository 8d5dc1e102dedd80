//! Settings file for the command-line client.
//!
//! ```toml
//! user_id = "alice"
//!
//! [session]
//! base_url = "https://magheart.example"
//! heartbeat_interval = 15000
//!
//! [ingest]
//! source = "watch"
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use magheart_ingest::IngestConfig;
use magheart_session::ClientConfig;
use serde::Deserialize;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_SETTINGS_FILE: &str = "magheart.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Used by every subcommand unless `--user` overrides it.
    pub user_id: Option<String>,
    pub session: ClientConfig,
    pub ingest: IngestConfig,
}

impl Settings {
    /// Load `path`, or the default file if present, or built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_SETTINGS_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings = Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
        log::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.session.validate()?;
        Ok(settings)
    }

    /// Point both clients at `base_url`.
    pub fn override_base_url(&mut self, base_url: &str) {
        self.session.base_url = base_url.to_string();
        self.ingest.base_url = base_url.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_file_is_default() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.session, ClientConfig::default());
        assert_eq!(settings.user_id, None);
    }

    #[test]
    fn test_sections_are_read() {
        let settings = Settings::parse(
            r#"
            user_id = "alice"

            [session]
            base_url = "https://magheart.example"
            reconnect_cap = 5000
            message_log_capacity = 200

            [ingest]
            source = "watch"
            "#,
        )
        .unwrap();
        assert_eq!(settings.user_id.as_deref(), Some("alice"));
        assert_eq!(settings.session.base_url, "https://magheart.example");
        assert_eq!(settings.session.reconnect_cap, Duration::from_secs(5));
        assert_eq!(settings.session.message_log_capacity, Some(200));
        assert_eq!(settings.ingest.source.as_deref(), Some("watch"));
    }

    #[test]
    fn test_invalid_session_config_rejected() {
        assert!(Settings::parse("[session]\nheartbeat_interval = 0\n").is_err());
    }

    #[test]
    fn test_override_base_url() {
        let mut settings = Settings::default();
        settings.override_base_url("http://10.0.0.2:8000");
        assert_eq!(settings.session.base_url, "http://10.0.0.2:8000");
        assert_eq!(settings.ingest.base_url, "http://10.0.0.2:8000");
    }
}
