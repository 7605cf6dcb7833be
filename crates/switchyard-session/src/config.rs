//! Gateway configuration.
//!
//! Read from an optional TOML file, then overridden by `SWITCHYARD_*`
//! environment variables.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::SweeperConfig;

const ENV_BIND: &str = "SWITCHYARD_BIND";
const ENV_IDLE_TIMEOUT: &str = "SWITCHYARD_IDLE_TIMEOUT_SECS";
const ENV_SWEEP_INTERVAL: &str = "SWITCHYARD_SWEEP_INTERVAL_SECS";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Sessions unused for this long are evicted.
    pub idle_timeout_secs: u64,
    /// Time between idle sweeps.
    pub sweep_interval_secs: u64,
    /// Lifecycle events kept for late subscribers.
    pub event_history: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            idle_timeout_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            event_history: switchyard_core::events::DEFAULT_HISTORY,
        }
    }
}

impl GatewayConfig {
    /// Load from `path` (if given), then apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.with_overrides(|var| std::env::var(var).ok())
    }

    /// Parse a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up by variable name.
    ///
    /// # Errors
    /// Returns error if an override does not parse.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BIND) {
            self.bind_addr = value.parse().map_err(|_| ConfigError::Env {
                var: ENV_BIND,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT) {
            self.idle_timeout_secs = parse_secs(ENV_IDLE_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(ENV_SWEEP_INTERVAL) {
            self.sweep_interval_secs = parse_secs(ENV_SWEEP_INTERVAL, value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Sweeper timing derived from this config.
    #[must_use]
    pub const fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    const fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be positive"));
        }
        Ok(())
    }
}

fn parse_secs(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = GatewayConfig::from_toml_str("idle_timeout_secs = 120\n").unwrap();
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.sweep_interval_secs, 300);
        assert_eq!(config.bind_addr, GatewayConfig::default().bind_addr);
        assert_eq!(config.sweeper().idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BIND, "0.0.0.0:8080"),
            (ENV_SWEEP_INTERVAL, " 30 "),
        ]);
        let config = GatewayConfig::from_toml_str("sweep_interval_secs = 600\n")
            .unwrap()
            .with_overrides(|var| env.get(var).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.sweep_interval_secs, 30);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            GatewayConfig::from_toml_str("idle_timeout_secs = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            GatewayConfig::from_toml_str("idle_timeout_secs = \"soon\"\n"),
            Err(ConfigError::Parse(_))
        ));
        let err = GatewayConfig::default()
            .with_overrides(|var| (var == ENV_IDLE_TIMEOUT).then(|| "forever".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_IDLE_TIMEOUT, .. }));
    }
}
