//! Application configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/beamline.toml`)
//! 2. environment variables prefixed with `BEAMLINE_`, nested keys separated
//!    by `__` (e.g. `BEAMLINE_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use beamline_daq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_from("config/beamline.toml")?;
//! config.validate()?;
//! println!("Settings database: {}", config.database.root.display());
//! # Ok(())
//! # }
//! ```

use beamline_detector::CoordinatorConfig;
use beamline_driver_sim::SimulatorConfig;
use beamline_ioc::IocConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::tracing_init::{parse_log_level, OutputFormat};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/beamline.toml";

/// Errors loading or validating the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Settings database
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Simulated instruments
    #[serde(default)]
    pub simulator: SimulatorsConfig,
    /// X-ray detector coordinator; absent when no detector is attached
    #[serde(default)]
    pub detector: Option<CoordinatorConfig>,
    /// Objects republished on the control bus
    #[serde(default)]
    pub ioc: Vec<IocBinding>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Settings database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the `_settings.txt` files
    #[serde(default = "default_database_root")]
    pub root: PathBuf,
    /// How often settings files are checked for external edits
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

/// Simulated temperature instruments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorsConfig {
    /// Run the simulators (also enabled by `--simulate`)
    #[serde(default)]
    pub enabled: bool,
    /// Serve each simulator's line protocol on an emulated serial port
    #[serde(default)]
    pub serve_on_emulated_port: bool,
    /// Temperature controller model
    #[serde(default)]
    pub temperature_controller: SimulatorConfig,
    /// Chiller model
    #[serde(default)]
    pub chiller: SimulatorConfig,
}

/// One IOC: which object to publish and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocBinding {
    /// Name of the published object, e.g. `chiller`
    pub object: String,
    /// Bus prefix, properties and scan period
    #[serde(flatten)]
    pub config: IocConfig,
}

fn default_name() -> String {
    "beamline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_root() -> PathBuf {
    PathBuf::from("settings")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            root: default_database_root(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_log_level(&self.application.log_level).map_err(ConfigError::Invalid)?;

        if self.database.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "database.poll_interval must be greater than zero".to_string(),
            ));
        }

        self.simulator
            .temperature_controller
            .validate()
            .and_then(|()| self.simulator.chiller.validate())
            .map_err(|e| ConfigError::Invalid(format!("simulator: {e}")))?;

        if let Some(detector) = &self.detector {
            detector
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("detector: {e}")))?;
        }

        let mut prefixes = HashSet::new();
        for binding in &self.ioc {
            binding
                .config
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("ioc '{}': {e}", binding.object)))?;
            if !prefixes.insert(binding.config.prefix.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate IOC prefix: {}",
                    binding.config.prefix
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = AppConfig::load_from("/nonexistent/beamline.toml").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.database.poll_interval, Duration::from_secs(1));
        assert!(config.detector.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file() {
        let file = write_config(
            r#"
[application]
log_level = "debug"
log_format = "json"

[database]
root = "/tmp/settings"
poll_interval = "500ms"

[detector]
scratch_directory = "/tmp/xray_scratch"
nimages_to_keep = 200

[[ioc]]
object = "chiller"
prefix = "NIH:CHILLER"
properties = ["temperature", "nominal_temperature"]
scan_period = "5s"
"#,
        );
        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.database.root, PathBuf::from("/tmp/settings"));
        assert_eq!(config.detector.as_ref().unwrap().nimages_to_keep, 200);
        assert_eq!(config.ioc[0].object, "chiller");
        assert_eq!(config.ioc[0].config.scan_period, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ioc_prefix() {
        let binding = |object: &str| IocBinding {
            object: object.to_string(),
            config: IocConfig::new("NIH:TEMP", ["temperature"]),
        };
        let config = AppConfig {
            ioc: vec![binding("temperature"), binding("chiller")],
            ..AppConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate IOC prefix"));
    }
}
