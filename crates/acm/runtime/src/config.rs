//! Configuration for acmd

use acm_supervision::SupervisionConfig;
use serde::{Deserialize, Serialize};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Supervision engine timing
    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Message bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// In-memory bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-topic channel capacity
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// Load configuration from defaults, an optional file and `ACM_`
    /// environment variables, in increasing precedence
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RuntimeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // ACM_SUPERVISION__SCAN_INTERVAL_MS=5000
        builder = builder.add_source(
            config::Environment::with_prefix("ACM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.supervision, SupervisionConfig::default());
        assert_eq!(config.bus.capacity, 1024);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[supervision]\nmax_operation_wait_ms = 5000\n\n[logging]\njson = true"
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.supervision.max_operation_wait_ms, 5000);
        assert_eq!(
            config.supervision.scan_interval_ms,
            SupervisionConfig::default().scan_interval_ms
        );
        assert!(config.logging.json);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = RuntimeConfig::load(Some("/nonexistent/acmd")).unwrap();
        assert_eq!(config.bus.capacity, 1024);
    }
}
