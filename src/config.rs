//! Client configuration

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable pointing at the commitment helper binary
pub const COMMP_HELPER_ENV: &str = "PDP_STORAGE_COMMP_HELPER";

/// Smallest payload a provider accepts
pub const MIN_UPLOAD_SIZE: u64 = 256;

/// Largest payload a provider accepts (254 MiB)
pub const MAX_UPLOAD_SIZE: u64 = 254 * 1024 * 1024;

/// Configuration shared by the protocol driver and the workflows built on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Minimum payload size in bytes (default: 256)
    #[serde(rename = "min-upload-size")]
    pub min_upload_size: u64,

    /// Maximum payload size in bytes (default: 254 MiB)
    #[serde(rename = "max-upload-size")]
    pub max_upload_size: u64,

    /// Per-request timeout in milliseconds for non-transfer calls (default: 300 s)
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,

    /// How long an upload waits for the provider to index a piece (default: 60 s)
    #[serde(rename = "indexing-timeout-ms")]
    pub indexing_timeout_ms: u64,

    /// Delay between indexing status polls (default: 2 s)
    #[serde(rename = "indexing-poll-interval-ms")]
    pub indexing_poll_interval_ms: u64,

    /// How long to wait for an on-chain dataset creation (default: 300 s)
    #[serde(rename = "dataset-creation-timeout-ms")]
    pub dataset_creation_timeout_ms: u64,

    /// Delay between dataset creation status polls (default: 4 s)
    #[serde(rename = "dataset-poll-interval-ms")]
    pub dataset_poll_interval_ms: u64,

    /// Timeout for provider health pings (default: 5 s)
    #[serde(rename = "ping-timeout-ms")]
    pub ping_timeout_ms: u64,

    /// Record keeper contract address forwarded on dataset creation
    #[serde(rename = "record-keeper", skip_serializing_if = "Option::is_none")]
    pub record_keeper: Option<String>,

    /// Path to the commitment helper; falls back to `stream-commp` on PATH
    #[serde(rename = "commp-helper", skip_serializing_if = "Option::is_none")]
    pub commp_helper: Option<PathBuf>,

    /// User agent sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_upload_size: MIN_UPLOAD_SIZE,
            max_upload_size: MAX_UPLOAD_SIZE,
            request_timeout_ms: 300_000,
            indexing_timeout_ms: 60_000,
            indexing_poll_interval_ms: 2_000,
            dataset_creation_timeout_ms: 300_000,
            dataset_poll_interval_ms: 4_000,
            ping_timeout_ms: 5_000,
            record_keeper: None,
            commp_helper: None,
            user_agent: format!("pdp-storage/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Apply `PDP_STORAGE_COMMP_HELPER` if set
    pub fn apply_env(mut self) -> Self {
        if let Some(path) = std::env::var_os(COMMP_HELPER_ENV) {
            if !path.is_empty() {
                self.commp_helper = Some(PathBuf::from(path));
            }
        }
        self
    }

    pub fn upload_size_bounds(mut self, min: u64, max: u64) -> Self {
        self.min_upload_size = min;
        self.max_upload_size = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn indexing_timeout(mut self, timeout: Duration) -> Self {
        self.indexing_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn indexing_poll_interval(mut self, interval: Duration) -> Self {
        self.indexing_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn dataset_creation_timeout(mut self, timeout: Duration) -> Self {
        self.dataset_creation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn dataset_poll_interval(mut self, interval: Duration) -> Self {
        self.dataset_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn record_keeper(mut self, address: impl Into<String>) -> Self {
        self.record_keeper = Some(address.into());
        self
    }

    pub fn commp_helper<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.commp_helper = Some(path.into());
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn indexing_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.indexing_timeout_ms)
    }

    pub fn indexing_poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.indexing_poll_interval_ms)
    }

    pub fn dataset_creation_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.dataset_creation_timeout_ms)
    }

    pub fn dataset_poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.dataset_poll_interval_ms)
    }

    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_upload_size > self.max_upload_size {
            return Err(StorageError::config(format!(
                "min-upload-size {} exceeds max-upload-size {}",
                self.min_upload_size, self.max_upload_size
            )));
        }

        if self.indexing_poll_interval_ms == 0 || self.dataset_poll_interval_ms == 0 {
            return Err(StorageError::config("Poll intervals must be greater than 0"));
        }

        if self.request_timeout_ms == 0 {
            return Err(StorageError::config("Request timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Convert the configuration to a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(StorageError::from)
    }

    /// Create a configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.min_upload_size, 256);
        assert_eq!(config.max_upload_size, 254 * 1024 * 1024);
        assert_eq!(config.indexing_timeout_duration(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .upload_size_bounds(1, 1024)
            .indexing_timeout(Duration::from_millis(500))
            .indexing_poll_interval(Duration::from_millis(10))
            .record_keeper("0xkeeper")
            .commp_helper("/opt/bin/stream-commp");

        assert_eq!(config.min_upload_size, 1);
        assert_eq!(config.max_upload_size, 1024);
        assert_eq!(config.indexing_timeout_ms, 500);
        assert_eq!(config.record_keeper.as_deref(), Some("0xkeeper"));
        assert_eq!(
            config.commp_helper,
            Some(PathBuf::from("/opt/bin/stream-commp"))
        );
    }

    #[test]
    fn test_config_validation() {
        let config = ClientConfig::new().upload_size_bounds(2048, 1024);
        assert!(config.validate().is_err());

        let config = ClientConfig::new().indexing_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json() {
        let config = ClientConfig::new().upload_size_bounds(1, 4096);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"min-upload-size\":1"));

        let parsed = ClientConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);

        let partial = ClientConfig::from_json(r#"{"indexing-timeout-ms": 10}"#).unwrap();
        assert_eq!(partial.indexing_timeout_ms, 10);
        assert_eq!(partial.min_upload_size, MIN_UPLOAD_SIZE);
    }
}
