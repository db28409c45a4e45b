//! Configuration loader with file and environment variable support.

use crate::{ConfigError, PollerConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &["config.toml", "poller.toml", "/etc/poller/config.toml"];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { config_path: Some(path.into()) }
    }

    pub fn load(&self) -> Result<PollerConfig, ConfigError> {
        let mut config = PollerConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading poller configuration from file");
            config = PollerConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("POLLER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut PollerConfig) {
        if let Ok(val) = env::var("POLLER_CACHE_FETCH_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.cache.fetch_timeout_ms = v;
            }
        }
        if let Ok(val) = env::var("POLLER_CACHE_MAX_BATCH_ITEMS") {
            if let Ok(v) = val.parse() {
                config.cache.max_batch_items = v;
            }
        }
        if let Ok(val) = env::var("POLLER_AVAILABILITY_UNAVAILABLE_DELAY_SECS") {
            if let Ok(v) = val.parse() {
                config.availability.unavailable_delay_secs = v;
            }
        }
        if let Ok(val) = env::var("POLLER_AVAILABILITY_UNREACHABLE_PERIOD_SECS") {
            if let Ok(v) = val.parse() {
                config.availability.unreachable_period_secs = v;
            }
        }
        if let Ok(val) = env::var("POLLER_AVAILABILITY_UNREACHABLE_DELAY_SECS") {
            if let Ok(v) = val.parse() {
                config.availability.unreachable_delay_secs = v;
            }
        }
        if let Ok(val) = env::var("POLLER_HTTP_TICK_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                config.http.tick_interval_ms = v;
            }
        }
        if let Ok(val) = env::var("POLLER_HTTP_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                config.http.request_timeout_ms = v;
            }
        }
        if let Ok(val) = env::var("POLLER_HTTP_MAX_IN_FLIGHT") {
            if let Ok(v) = val.parse() {
                config.http.max_in_flight = v;
            }
        }
        if let Ok(val) = env::var("POLLER_DELAY_SECS") {
            if let Ok(v) = val.parse() {
                config.poller.poller_delay_secs = v;
            }
        }
        if let Ok(val) = env::var("POLLER_SOURCE_IP") {
            config.poller.source_ip = Some(val);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/path/config.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.poller.poller_delay_secs, 5);
    }

    #[test]
    fn loads_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\npoller_delay_secs = 30\n").unwrap();

        let loader = ConfigLoader::with_path(&path);
        let config = loader.load().unwrap();
        assert_eq!(config.poller.poller_delay_secs, 30);
    }
}
