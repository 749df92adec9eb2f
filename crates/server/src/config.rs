//! Server configuration file (TOML).
//!
//! ```toml
//! welcome_message = "Hi! How can we help?"
//! retention_days = 30
//!
//! [webhook]
//! url = "https://example.com/pocketping-events"
//! secret = "s3cret"
//!
//! [ip_filter]
//! enabled = true
//! mode = "blocklist"
//! blocklist = ["203.0.113.0/24"]
//!
//! [ua_filter]
//! enabled = true
//! blocklist = ["/my-scraper-\\d+/"]
//!
//! [[bridges]]
//! name = "telegram"
//! url = "http://127.0.0.1:3100"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use pocketping_bridge_core::HttpBridgeConfig;
use pocketping_core::service::DEFAULT_MAX_CONTENT_LENGTH;
use pocketping_core::{IpFilter, ServiceConfig, UaFilter, WebhookConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub welcome_message: Option<String>,
    pub max_content_length: usize,
    pub min_widget_version: Option<String>,
    pub latest_widget_version: Option<String>,
    pub version_warning_message: Option<String>,
    pub version_upgrade_url: Option<String>,
    /// Sessions idle for longer are swept periodically. Unset disables the sweep.
    pub retention_days: Option<u32>,
    pub webhook: Option<WebhookConfig>,
    pub ip_filter: IpFilter,
    pub ua_filter: UaFilter,
    pub bridges: Vec<BridgeEntry>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            welcome_message: None,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            min_widget_version: None,
            latest_widget_version: None,
            version_warning_message: None,
            version_upgrade_url: None,
            retention_days: None,
            webhook: None,
            ip_filter: IpFilter::default(),
            ua_filter: UaFilter::default(),
            bridges: Vec::new(),
        }
    }
}

/// A remote bridge server reached through [`pocketping_bridge_core::HttpBridge`].
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl BridgeEntry {
    pub fn to_bridge_config(&self) -> HttpBridgeConfig {
        let mut config = HttpBridgeConfig::new(&self.name, &self.url);
        config.api_key = self.api_key.clone().filter(|k| !k.is_empty());
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }
}

impl FileConfig {
    /// Read `path`. A missing file at the default location is not an error.
    pub fn load(path: &Path, required: bool) -> anyhow::Result<Self> {
        if !path.exists() && !required {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if config.max_content_length == 0 {
            anyhow::bail!("max_content_length must be greater than zero");
        }
        Ok(config)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            welcome_message: self.welcome_message.clone(),
            max_content_length: self.max_content_length,
            min_widget_version: self.min_widget_version.clone(),
            latest_widget_version: self.latest_widget_version.clone(),
            version_warning_message: self.version_warning_message.clone(),
            version_upgrade_url: self.version_upgrade_url.clone(),
            ip_filter: self.ip_filter.clone(),
            ua_filter: self.ua_filter.clone(),
        }
    }

    pub fn retention(&self) -> Option<chrono::Duration> {
        self.retention_days
            .filter(|days| *days > 0)
            .map(|days| chrono::Duration::days(i64::from(days)))
    }
}

#[cfg(test)]
mod tests {
    use pocketping_core::FilterMode;

    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FileConfig::parse("").unwrap();
        assert_eq!(config.max_content_length, DEFAULT_MAX_CONTENT_LENGTH);
        assert!(config.bridges.is_empty());
        assert!(config.retention().is_none());
        assert!(!config.ip_filter.enabled);
        assert!(!config.ua_filter.enabled);
    }

    #[test]
    fn parses_full_file() {
        let raw = r#"
            welcome_message = "Hi!"
            min_widget_version = "1.0.0"
            retention_days = 30

            [webhook]
            url = "https://hooks.example/pp"
            secret = "s3cret"

            [ip_filter]
            enabled = true
            mode = "both"
            allowlist = ["10.0.0.0/8"]
            blocklist = ["10.0.0.13"]

            [ua_filter]
            enabled = true
            mode = "allowlist"
            allowlist = ["mozilla/"]

            [[bridges]]
            name = "telegram"
            url = "http://127.0.0.1:3100"
            api_key = "k"

            [[bridges]]
            name = "slack"
            url = "http://127.0.0.1:3200"
        "#;
        let config = FileConfig::parse(raw).unwrap();
        assert_eq!(config.retention(), Some(chrono::Duration::days(30)));
        assert_eq!(config.ip_filter.mode, FilterMode::Both);
        assert_eq!(config.ua_filter.mode, FilterMode::Allowlist);
        assert!(config.ua_filter.use_default_bots);
        assert_eq!(config.bridges.len(), 2);
        assert_eq!(config.bridges[0].to_bridge_config().api_key.as_deref(), Some("k"));
        assert!(config.bridges[1].to_bridge_config().api_key.is_none());

        let webhook = config.webhook.unwrap();
        assert_eq!(webhook.secret.as_deref(), Some("s3cret"));
        assert_eq!(webhook.timeout_secs, 5);

        let service = FileConfig::parse(raw).unwrap().service_config();
        assert_eq!(service.welcome_message.as_deref(), Some("Hi!"));
        assert_eq!(service.min_widget_version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn missing_default_file_is_fine_but_explicit_is_not() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        assert!(FileConfig::load(&path, false).is_ok());
        assert!(FileConfig::load(&path, true).is_err());

        std::fs::write(&path, "max_content_length = 0").unwrap();
        assert!(FileConfig::load(&path, false).is_err());
    }
}
