//! Configuration for the broker binary.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::broker::BrokerOptions;
use crate::engine::{DispatchMode, EngineOptions};

/// Broker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport endpoints and keys.
    pub broker: BrokerEndpoints,
    /// Runtime tuning knobs.
    pub runtime: RuntimeConfig,
}

/// Transport endpoint configuration.
///
/// The URLs and secret keys are consumed by the transport implementation
/// bound at startup; the in-memory transport ignores them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerEndpoints {
    /// Front-end bind address for client requests.
    pub frontend_url: String,
    /// Optional front-end key material.
    pub frontend_secret_key: String,
    /// Back-end bind address for pub/sub consumers.
    pub backend_url: String,
    /// Optional back-end key material.
    pub backend_secret_key: String,
}

impl Default for BrokerEndpoints {
    fn default() -> Self {
        Self {
            frontend_url: "tcp://127.0.0.1:12306".to_string(),
            frontend_secret_key: String::new(),
            backend_url: "ipc://switchyard.internal.ipc".to_string(),
            backend_secret_key: String::new(),
        }
    }
}

/// Runtime tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bound on concurrently handled messages.
    pub worker_pool_size: usize,
    /// Bounded transport poll timeout, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Idle dispatch backoff, in milliseconds.
    pub dispatch_backoff_ms: u64,
    /// Per-handler wall-clock warning threshold, in milliseconds.
    pub handler_time_budget_ms: u64,
    /// Bound on the reply dedupe cache.
    pub reply_cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 16,
            poll_timeout_ms: 100,
            dispatch_backoff_ms: 100,
            handler_time_budget_ms: 1000,
            reply_cache_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`SWITCHYARD_CONFIG`, default `config.yaml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("SWITCHYARD_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FRONTEND_URL") {
            self.broker.frontend_url = url;
        }
        if let Ok(key) = std::env::var("FRONTEND_SECRET_KEY") {
            self.broker.frontend_secret_key = key;
        }
        if let Ok(url) = std::env::var("BACKEND_URL") {
            self.broker.backend_url = url;
        }
        if let Ok(key) = std::env::var("BACKEND_SECRET_KEY") {
            self.broker.backend_secret_key = key;
        }
        if let Ok(size) = std::env::var("WORKER_POOL_SIZE") {
            if let Ok(n) = size.parse() {
                self.runtime.worker_pool_size = n;
            }
        }
        if let Ok(ms) = std::env::var("POLL_TIMEOUT_MS") {
            if let Ok(n) = ms.parse() {
                self.runtime.poll_timeout_ms = n;
            }
        }
        if let Ok(ms) = std::env::var("DISPATCH_BACKOFF_MS") {
            if let Ok(n) = ms.parse() {
                self.runtime.dispatch_backoff_ms = n;
            }
        }
    }

    /// Broker options derived from the runtime section.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            poll_timeout: Duration::from_millis(self.runtime.poll_timeout_ms),
            worker_pool_size: self.runtime.worker_pool_size,
            handler_time_budget: Duration::from_millis(self.runtime.handler_time_budget_ms),
            reply_cache_capacity: self.runtime.reply_cache_capacity,
            ..BrokerOptions::default()
        }
    }

    /// Engine options derived from the runtime section, for engines embedded
    /// alongside (or linked to) the broker.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            dispatch_mode: DispatchMode::Pooled {
                workers: self.runtime.worker_pool_size,
            },
            poll_timeout: Duration::from_millis(self.runtime.poll_timeout_ms),
            dispatch_backoff: Duration::from_millis(self.runtime.dispatch_backoff_ms),
            handler_time_budget: Duration::from_millis(self.runtime.handler_time_budget_ms),
            reply_cache_capacity: self.runtime.reply_cache_capacity,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.frontend_url, "tcp://127.0.0.1:12306");
        assert_eq!(config.runtime.worker_pool_size, 16);
        assert_eq!(config.runtime.poll_timeout_ms, 100);
        assert_eq!(config.runtime.dispatch_backoff_ms, 100);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
broker:
  frontend_url: tcp://0.0.0.0:7700
  backend_url: tcp://0.0.0.0:7701
  backend_secret_key: /etc/keys/backend

runtime:
  worker_pool_size: 4
  poll_timeout_ms: 250
  reply_cache_capacity: 64
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.frontend_url, "tcp://0.0.0.0:7700");
        assert_eq!(config.broker.backend_secret_key, "/etc/keys/backend");
        assert_eq!(config.runtime.worker_pool_size, 4);
        assert_eq!(config.runtime.poll_timeout_ms, 250);
        // Unset fields keep their defaults.
        assert_eq!(config.runtime.dispatch_backoff_ms, 100);

        let options = config.broker_options();
        assert_eq!(options.poll_timeout, Duration::from_millis(250));
        assert_eq!(options.reply_cache_capacity, 64);

        let engine = config.engine_options();
        assert_eq!(engine.dispatch_mode, DispatchMode::Pooled { workers: 4 });
        assert_eq!(engine.dispatch_backoff, Duration::from_millis(100));
    }
}
