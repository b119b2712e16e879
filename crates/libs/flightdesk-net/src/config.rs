use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Request executor options. Durations are milliseconds on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequestConfig {
    pub cache_enabled: bool,
    pub cache_ttl_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Zero disables debouncing.
    pub debounce_delay_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_ms: 5 * 60 * 1_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            debounce_delay_ms: 0,
        }
    }
}

impl RequestConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn debounce_delay(&self) -> Option<Duration> {
        (self.debounce_delay_ms > 0).then(|| Duration::from_millis(self.debounce_delay_ms))
    }
}

/// WebSocket session options. Durations are milliseconds on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    /// Zero disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            heartbeat_interval_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// Top-level configuration for one frontend process.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetConfig {
    pub request: RequestConfig,
    pub connection: ConnectionConfig,
    /// REST service name to base URL.
    pub services: BTreeMap<String, String>,
    pub push_endpoint: Option<String>,
}

impl NetConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request.cache_enabled && self.request.cache_ttl_ms == 0 {
            return Err(ConfigError::invalid(
                "request.cache_ttl_ms",
                "must be positive when caching is enabled",
            ));
        }
        if self.connection.max_reconnect_attempts == 0 && self.connection.auto_reconnect {
            return Err(ConfigError::invalid(
                "connection.max_reconnect_attempts",
                "must be positive when auto_reconnect is enabled",
            ));
        }
        if self.connection.reconnect_max_delay_ms < self.connection.reconnect_base_delay_ms {
            return Err(ConfigError::invalid(
                "connection.reconnect_max_delay_ms",
                "must not be below reconnect_base_delay_ms",
            ));
        }
        for (name, url) in &self.services {
            if url.trim().is_empty() {
                return Err(ConfigError::invalid("services", format!("empty base url for '{name}'")));
            }
        }
        if matches!(self.push_endpoint.as_deref(), Some(endpoint) if endpoint.trim().is_empty()) {
            return Err(ConfigError::invalid("push_endpoint", "must not be empty"));
        }
        Ok(())
    }

    pub fn service_url(&self, name: &str) -> Option<&str> {
        self.services.get(name).map(String::as_str)
    }
}
