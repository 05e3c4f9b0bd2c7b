//! First-order thermal model shared by the simulated instruments.
//!
//! Between updates the temperature relaxes exponentially toward a target:
//!
//! ```text
//! T(t) = T_target + (T0 - T_target) * exp(-dt / tau)
//! ```
//!
//! The target is the set-point while the servo is enabled, otherwise the
//! heat-sink temperature.

use std::time::Duration;

/// Thermal behavior of one simulated stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalModel {
    /// Relaxation time constant
    pub time_constant: Duration,
    /// Temperature the stage drifts to with the servo off
    pub heat_sink_temperature: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self {
            time_constant: Duration::from_secs(10),
            heat_sink_temperature: 22.0,
        }
    }
}

impl ThermalModel {
    /// Temperature the stage is heading for.
    pub fn target(&self, set_point: f64, servo_enabled: bool) -> f64 {
        if servo_enabled {
            set_point
        } else {
            self.heat_sink_temperature
        }
    }

    /// Temperature `elapsed` after being at `temperature`, heading for `target`.
    ///
    /// A zero time constant reaches the target immediately.
    pub fn step(&self, temperature: f64, target: f64, elapsed: Duration) -> f64 {
        let tau = self.time_constant.as_secs_f64();
        if tau <= 0.0 {
            return target;
        }
        target + (temperature - target) * (-elapsed.as_secs_f64() / tau).exp()
    }
}
