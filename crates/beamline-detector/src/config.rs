//! Coordinator configuration.
//!
//! Durations use humantime strings (`"500ms"`, `"30s"`).
//!
//! ```toml
//! scratch_directory = "/tmp/xray_scratch"
//! extension = "rx"
//! digits = 7
//! nimages_to_keep = 1000
//! poll_interval = "500ms"
//! xdet_trig_count_offset = 100   # pin; omit to auto-tune
//! dataset_directory = "/data/lysozyme-1"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DetectorError, Result};

/// Settings of one [`crate::Coordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Where the detector drops raw images
    pub scratch_directory: PathBuf,

    /// Scratch file extension without the dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Width of the zero-padded image number in scratch filenames
    #[serde(default = "default_digits")]
    pub digits: u32,

    /// Upper bound on the number of scratch files; oldest are deleted
    #[serde(default = "default_nimages_to_keep")]
    pub nimages_to_keep: usize,

    /// Scratch directory polling period
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Snap distances above this are reported
    #[serde(with = "humantime_serde", default = "default_snap_tolerance")]
    pub snap_tolerance: Duration,

    /// Maximum time between a trigger and an acquisition event counted as
    /// firing together
    #[serde(with = "humantime_serde", default = "default_coincidence_tolerance")]
    pub coincidence_tolerance: Duration,

    /// Largest standard deviation, in counts, accepted when re-estimating
    /// the trigger count offset
    #[serde(default = "default_offset_spread")]
    pub trig_offset_max_spread: f64,

    /// Images still unassigned after this long are discarded
    #[serde(with = "humantime_serde", default = "default_pending_timeout")]
    pub pending_timeout: Duration,

    /// Capacity of the counter histories
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    /// Settings database name of the coordinator
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Pinned trigger count offset; auto-tuned when absent
    #[serde(default)]
    pub xdet_trig_count_offset: Option<i64>,

    /// Pinned detector-to-host clock offset in seconds; derived when absent
    #[serde(default)]
    pub acquire_timestamp_offset: Option<f64>,

    /// Dataset archived into at start-up; none until `dataset_directory`
    /// is written
    #[serde(default)]
    pub dataset_directory: Option<PathBuf>,
}

fn default_extension() -> String {
    "rx".to_string()
}

fn default_digits() -> u32 {
    6
}

fn default_nimages_to_keep() -> usize {
    1000
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_snap_tolerance() -> Duration {
    Duration::from_millis(100)
}

fn default_coincidence_tolerance() -> Duration {
    Duration::from_millis(10)
}

fn default_offset_spread() -> f64 {
    0.25
}

fn default_pending_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_history_length() -> usize {
    10_000
}

fn default_db_name() -> String {
    "xray_detector".to_string()
}

impl CoordinatorConfig {
    /// Defaults for a scratch directory.
    pub fn new(scratch_directory: impl Into<PathBuf>) -> Self {
        Self {
            scratch_directory: scratch_directory.into(),
            extension: default_extension(),
            digits: default_digits(),
            nimages_to_keep: default_nimages_to_keep(),
            poll_interval: default_poll_interval(),
            snap_tolerance: default_snap_tolerance(),
            coincidence_tolerance: default_coincidence_tolerance(),
            trig_offset_max_spread: default_offset_spread(),
            pending_timeout: default_pending_timeout(),
            history_length: default_history_length(),
            db_name: default_db_name(),
            xdet_trig_count_offset: None,
            acquire_timestamp_offset: None,
            dataset_directory: None,
        }
    }

    /// Length of the series commanded at start: `10^digits - 1`.
    pub fn series_length(&self) -> u64 {
        10u64.saturating_pow(self.digits).saturating_sub(1)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        if self.scratch_directory.as_os_str().is_empty() {
            return Err(DetectorError::Config("scratch_directory is empty".into()));
        }
        if self.extension.is_empty() || self.extension.contains(|c| c == '.' || c == '/') {
            return Err(DetectorError::Config(format!(
                "Invalid extension '{}'. Give it without the dot",
                self.extension
            )));
        }
        if !(1..=18).contains(&self.digits) {
            return Err(DetectorError::Config(format!(
                "Invalid digits {}. Must be 1-18",
                self.digits
            )));
        }
        if self.nimages_to_keep == 0 {
            return Err(DetectorError::Config("nimages_to_keep must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(DetectorError::Config("poll_interval must be positive".into()));
        }
        if self.trig_offset_max_spread.is_nan() || self.trig_offset_max_spread <= 0.0 {
            return Err(DetectorError::Config(
                "trig_offset_max_spread must be positive".into(),
            ));
        }
        if self.db_name.trim().is_empty() {
            return Err(DetectorError::Config("db_name is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config: CoordinatorConfig =
            toml::from_str(r#"scratch_directory = "/tmp/scratch""#).unwrap();
        assert_eq!(config.extension, "rx");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.snap_tolerance, Duration::from_millis(100));
        assert_eq!(config.xdet_trig_count_offset, None);
        assert_eq!(config.dataset_directory, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_pinned_values() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            scratch_directory = "/tmp/scratch"
            digits = 7
            poll_interval = "250ms"
            xdet_trig_count_offset = 100
            acquire_timestamp_offset = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.series_length(), 9_999_999);
        assert_eq!(config.xdet_trig_count_offset, Some(100));
        assert_eq!(config.acquire_timestamp_offset, Some(0.0));
    }

    #[test]
    fn test_validation() {
        let mut config = CoordinatorConfig::new("/tmp/scratch");
        config.validate().unwrap();

        config.extension = ".rx".into();
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::new("/tmp/scratch");
        config.digits = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::new("/tmp/scratch");
        config.trig_offset_max_spread = f64::NAN;
        assert!(config.validate().is_err());
    }
}
