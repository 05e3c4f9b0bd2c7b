//! Wall-clock timestamps as seconds since the Unix epoch.
//!
//! Events, histories and the detector coordinator all compare times from
//! different sources (host clock, file mtimes, detector headers), so every
//! timestamp in the runtime is a plain `f64` of seconds since the epoch.

use chrono::Utc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in seconds since the Unix epoch.
pub fn now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
}

/// Convert a `SystemTime` (e.g. a file mtime) to seconds since the epoch.
///
/// Times before the epoch are returned as negative values.
pub fn from_system_time(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Convert seconds since the epoch back to a `SystemTime`.
///
/// Non-finite inputs map to the epoch itself.
pub fn to_system_time(secs: f64) -> SystemTime {
    if !secs.is_finite() {
        return UNIX_EPOCH;
    }
    if secs >= 0.0 {
        UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        UNIX_EPOCH - Duration::from_secs_f64(-secs)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        // 2023-01-01
        assert!(now() > 1_672_531_200.0);
    }

    #[test]
    fn test_system_time_conversion() {
        let t = 1_700_000_000.25;
        let back = from_system_time(to_system_time(t));
        assert!((back - t).abs() < 1e-6);
        assert_eq!(to_system_time(f64::NAN), UNIX_EPOCH);
    }
}
