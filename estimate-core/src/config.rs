use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port the host's advertiser listens on for probes.
    pub port: u16,

    /// Address probes are sent to when searching for a host.
    pub broadcast_addr: String,

    /// Milliseconds between discovery probes.
    pub probe_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 42424,
            broadcast_addr: "255.255.255.255".to_string(),
            probe_interval_ms: 1000,
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,

    /// "pretty" for development, "json" for structured output
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `estimate.toml` if present,
    /// then `ESTIMATE_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("estimate.toml"))
    }

    /// Load configuration with an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("ESTIMATE").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.discovery.port, 42424);
        assert_eq!(config.discovery.probe_interval(), Duration::from_millis(1000));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/estimate.toml"))
            .expect("defaults should load");
        assert_eq!(config.discovery.port, 42424);
        assert_eq!(config.logging.format, "pretty");
    }
}
