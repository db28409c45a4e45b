//! Poller worker configuration: TOML file + environment variable overrides.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;
pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub cache: CacheConfig,
    pub availability: AvailabilityConfig,
    pub http: HttpPollerConfig,
    pub poller: GeneralPollerConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            availability: AvailabilityConfig::default(),
            http: HttpPollerConfig::default(),
            poller: GeneralPollerConfig::default(),
        }
    }
}

impl PollerConfig {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PollerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }
}

/// `ConfigCache.FetchDue` tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub fetch_timeout_ms: u64,
    pub max_batch_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { fetch_timeout_ms: 1_000, max_batch_items: poller_common::MAX_POLLER_ITEMS }
    }
}

/// Grace-window tunables consumed by `AvailabilityFSM`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub unavailable_delay_secs: i64,
    pub unreachable_period_secs: i64,
    pub unreachable_delay_secs: i64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            unavailable_delay_secs: 60,
            unreachable_period_secs: 45,
            unreachable_delay_secs: 15,
        }
    }
}

/// `HttpAsyncEngine` tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPollerConfig {
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_in_flight: usize,
}

impl Default for HttpPollerConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1_000, request_timeout_ms: 30_000, max_in_flight: 1_000 }
    }
}

/// Generic poller loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralPollerConfig {
    pub poller_delay_secs: i64,
    pub source_ip: Option<String>,
}

impl Default for GeneralPollerConfig {
    fn default() -> Self {
        Self { poller_delay_secs: 5, source_ip: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PollerConfig::default();
        assert_eq!(config.cache.max_batch_items, poller_common::MAX_POLLER_ITEMS);
        assert!(config.availability.unreachable_period_secs > 0);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [availability]
            unavailable_delay_secs = 300
        "#;
        let config: PollerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.availability.unavailable_delay_secs, 300);
        assert_eq!(config.availability.unreachable_period_secs, 45);
    }
}
