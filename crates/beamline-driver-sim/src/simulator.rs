//! Simulated temperature controller and chiller.
//!
//! Both instruments are a [`ThermalSimulator`]: a property set whose
//! `temperature` follows the [`ThermalModel`], advanced by a `running`
//! thread property at [`UPDATE_PERIOD`]. They differ in the name of the
//! set-point property and in the extra knobs they carry.

use beamline_core::{supervised_loop, Observable, PropertySet, ThreadProperty};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Result, SimError};
use crate::thermal::ThermalModel;

/// Update rate of the simulated physics (4 Hz).
pub const UPDATE_PERIOD: Duration = Duration::from_millis(250);

/// Starting conditions of a simulated stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Temperature at construction (default: 22.0)
    #[serde(default = "default_temperature")]
    pub initial_temperature: f64,

    /// Temperature reached with the servo off (default: 22.0)
    #[serde(default = "default_temperature")]
    pub heat_sink_temperature: f64,

    /// Relaxation time constant (default: 10s)
    #[serde(default = "default_time_constant", with = "humantime_serde")]
    pub time_constant: Duration,

    /// Physics update period (default: 250ms)
    #[serde(default = "default_update_period", with = "humantime_serde")]
    pub update_period: Duration,
}

fn default_temperature() -> f64 {
    22.0
}

fn default_time_constant() -> Duration {
    Duration::from_secs(10)
}

fn default_update_period() -> Duration {
    UPDATE_PERIOD
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            initial_temperature: default_temperature(),
            heat_sink_temperature: default_temperature(),
            time_constant: default_time_constant(),
            update_period: default_update_period(),
        }
    }
}

impl SimulatorConfig {
    /// Reject non-finite temperatures and a zero update period.
    pub fn validate(&self) -> Result<()> {
        if !self.initial_temperature.is_finite() || !self.heat_sink_temperature.is_finite() {
            return Err(SimError::Config(
                "temperatures must be finite numbers".to_string(),
            ));
        }
        if self.update_period.is_zero() {
            return Err(SimError::Config(
                "update_period must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn finite(value: &f64) -> anyhow::Result<()> {
    anyhow::ensure!(value.is_finite(), "{value} is not a finite number");
    Ok(())
}

/// A simulated thermal stage exposed as a property set.
///
/// Properties: `temperature` (read-only), the set-point, `enabled`,
/// `heat_sink_temperature`, `time_constant` and `running`.
pub struct ThermalSimulator {
    identity: String,
    props: Arc<PropertySet>,
    temperature: Observable<f64>,
    set_point: Observable<f64>,
    enabled: Observable<bool>,
    heat_sink_temperature: Observable<f64>,
    time_constant: Observable<f64>,
    last_update: Mutex<Instant>,
    period: Duration,
    running: Arc<ThreadProperty>,
}

impl fmt::Debug for ThermalSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThermalSimulator")
            .field("object", self.props.owner())
            .field("temperature", &self.temperature.get())
            .field("set_point", &self.set_point.get())
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

impl ThermalSimulator {
    /// Build a stage named `name` whose set-point property is `set_point_name`.
    ///
    /// The physics thread is not started.
    pub fn new(
        name: &str,
        identity: impl Into<String>,
        set_point_name: &str,
        set_point_range: (f64, f64),
        config: &SimulatorConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let props = Arc::new(PropertySet::new(name));
        let owner = props.owner().clone();
        let period = config.update_period;
        let task_name = name.to_string();

        let simulator = Arc::new_cyclic(|weak: &Weak<ThermalSimulator>| {
            let weak = weak.clone();
            let running = Arc::new(ThreadProperty::new(&owner, "running", move |cancel| {
                if let Some(simulator) = weak.upgrade() {
                    *simulator.last_update.lock() = Instant::now();
                }
                supervised_loop(&task_name, cancel, period, || {
                    match weak.upgrade() {
                        Some(simulator) => simulator.tick(),
                        None => {
                            cancel.cancel();
                        }
                    }
                    Ok(())
                });
            }));

            ThermalSimulator {
                identity: identity.into(),
                temperature: Observable::new(&owner, "temperature", config.initial_temperature)
                    .with_units("C")
                    .with_description("Simulated stage temperature")
                    .read_only(),
                set_point: Observable::new(&owner, set_point_name, config.initial_temperature)
                    .with_units("C")
                    .with_range(set_point_range.0, set_point_range.1),
                enabled: Observable::new(&owner, "enabled", true),
                heat_sink_temperature: Observable::new(
                    &owner,
                    "heat_sink_temperature",
                    config.heat_sink_temperature,
                )
                .with_units("C")
                .with_validator(finite),
                time_constant: Observable::new(
                    &owner,
                    "time_constant",
                    config.time_constant.as_secs_f64(),
                )
                .with_units("s")
                .with_range(0.0, 1.0e6),
                last_update: Mutex::new(Instant::now()),
                period,
                running,
                props,
            }
        });

        let props = &simulator.props;
        props.register(Arc::new(simulator.temperature.clone()));
        props.register(Arc::new(simulator.set_point.clone()));
        props.register(Arc::new(simulator.enabled.clone()));
        props.register(Arc::new(simulator.heat_sink_temperature.clone()));
        props.register(Arc::new(simulator.time_constant.clone()));
        props.register_thread(&simulator.running);
        Ok(simulator)
    }

    /// Property set of this instrument.
    pub fn properties(&self) -> Arc<PropertySet> {
        self.props.clone()
    }

    /// Identification string answered to `*IDN?`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The physics thread.
    pub fn running(&self) -> &Arc<ThreadProperty> {
        &self.running
    }

    /// Start the physics thread.
    pub fn start(&self) -> Result<()> {
        self.running.start()?;
        Ok(())
    }

    /// Stop the physics thread and wait a few update periods for it.
    pub fn stop(&self) {
        self.running.stop();
        if !self.running.wait_stopped(self.period * 4) {
            tracing::warn!(object = %self.props.owner(), "simulator thread still running");
        }
    }

    /// Current temperature.
    pub fn temperature(&self) -> f64 {
        self.temperature.get()
    }

    /// Current set-point.
    pub fn set_point(&self) -> f64 {
        self.set_point.get()
    }

    /// External set-point write, validated against the range.
    pub fn set_set_point(&self, value: f64) -> Result<()> {
        self.set_point.set(value)?;
        Ok(())
    }

    /// Whether the servo is on.
    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Switch the servo on or off.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.enabled.set(enabled)?;
        Ok(())
    }

    fn model(&self) -> ThermalModel {
        ThermalModel {
            time_constant: Duration::try_from_secs_f64(self.time_constant.get())
                .unwrap_or(Duration::ZERO),
            heat_sink_temperature: self.heat_sink_temperature.get(),
        }
    }

    /// Advance the physics by `elapsed` and publish the new temperature.
    pub fn advance(&self, elapsed: Duration) -> f64 {
        let model = self.model();
        let target = model.target(self.set_point.get(), self.enabled.get());
        let temperature = model.step(self.temperature.get(), target, elapsed);
        self.temperature.update(temperature);
        temperature
    }

    fn tick(&self) {
        let elapsed = {
            let mut last = self.last_update.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };
        let temperature = self.advance(elapsed);
        tracing::trace!(object = %self.props.owner(), temperature, "simulator tick");
    }
}

impl Drop for ThermalSimulator {
    fn drop(&mut self) {
        self.running.stop();
    }
}

/// Simulated servo temperature controller.
///
/// Adds the PID knobs `feedback_P`, `feedback_I` and `feedback_D`, which a
/// real controller would tune. The first-order model ignores them.
#[derive(Debug)]
pub struct SimulatedTemperatureController {
    simulator: Arc<ThermalSimulator>,
    feedback_p: Observable<f64>,
    feedback_i: Observable<f64>,
    feedback_d: Observable<f64>,
}

impl SimulatedTemperatureController {
    /// Identification string of the simulated controller.
    pub const IDENTITY: &'static str = "Simulated Temperature Controller";

    /// Set-point range in degrees Celsius.
    pub const SET_POINT_RANGE: (f64, f64) = (-50.0, 150.0);

    /// Build a controller named `name`. The set-point is `set_temperature`.
    pub fn new(name: &str, config: &SimulatorConfig) -> Result<Self> {
        let simulator = ThermalSimulator::new(
            name,
            Self::IDENTITY,
            "set_temperature",
            Self::SET_POINT_RANGE,
            config,
        )?;
        let props = simulator.properties();
        let owner = props.owner();
        let feedback_p = Observable::new(owner, "feedback_P", 1.0).with_validator(finite);
        let feedback_i = Observable::new(owner, "feedback_I", 0.1).with_validator(finite);
        let feedback_d = Observable::new(owner, "feedback_D", 0.0).with_validator(finite);
        props.register(Arc::new(feedback_p.clone()));
        props.register(Arc::new(feedback_i.clone()));
        props.register(Arc::new(feedback_d.clone()));
        Ok(Self {
            simulator,
            feedback_p,
            feedback_i,
            feedback_d,
        })
    }

    /// The underlying thermal stage.
    pub fn simulator(&self) -> &Arc<ThermalSimulator> {
        &self.simulator
    }

    /// Current `(P, I, D)` feedback gains.
    pub fn feedback(&self) -> (f64, f64, f64) {
        (
            self.feedback_p.get(),
            self.feedback_i.get(),
            self.feedback_d.get(),
        )
    }
}

/// Simulated recirculating chiller. The set-point is `nominal_temperature`.
#[derive(Debug)]
pub struct SimulatedChiller {
    simulator: Arc<ThermalSimulator>,
}

impl SimulatedChiller {
    /// Identification string of the simulated chiller.
    pub const IDENTITY: &'static str = "Simulated Chiller";

    /// Set-point range in degrees Celsius.
    pub const SET_POINT_RANGE: (f64, f64) = (-20.0, 80.0);

    /// Build a chiller named `name`.
    pub fn new(name: &str, config: &SimulatorConfig) -> Result<Self> {
        let simulator = ThermalSimulator::new(
            name,
            Self::IDENTITY,
            "nominal_temperature",
            Self::SET_POINT_RANGE,
            config,
        )?;
        Ok(Self { simulator })
    }

    /// The underlying thermal stage.
    pub fn simulator(&self) -> &Arc<ThermalSimulator> {
        &self.simulator
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beamline_core::{PropertyHost, Value};

    fn config() -> SimulatorConfig {
        SimulatorConfig {
            initial_temperature: 22.0,
            heat_sink_temperature: 22.0,
            time_constant: Duration::from_secs(1),
            update_period: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_config_from_toml() {
        let config: SimulatorConfig =
            toml::from_str("time_constant = \"30s\"\nheat_sink_temperature = 18.5").unwrap();
        assert_eq!(config.time_constant, Duration::from_secs(30));
        assert_eq!(config.heat_sink_temperature, 18.5);
        assert_eq!(config.update_period, UPDATE_PERIOD);
        config.validate().unwrap();

        let bad = SimulatorConfig {
            update_period: Duration::ZERO,
            ..SimulatorConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_servo_drives_toward_set_point() {
        let controller = SimulatedTemperatureController::new("temperature", &config()).unwrap();
        let sim = controller.simulator();
        sim.set_set_point(4.0).unwrap();

        let t = sim.advance(Duration::from_secs(1));
        assert!((t - (4.0 + 18.0 * (-1.0f64).exp())).abs() < 1e-9);
        assert_eq!(sim.temperature(), t);

        sim.set_enabled(false).unwrap();
        let drifted = sim.advance(Duration::from_secs(1));
        assert!(drifted > t && drifted < 22.0);
    }

    #[test]
    fn test_properties_are_exposed() {
        let controller = SimulatedTemperatureController::new("temperature", &config()).unwrap();
        let props = controller.simulator().properties();
        let names = props.property_names();
        for expected in [
            "temperature",
            "set_temperature",
            "enabled",
            "feedback_P",
            "feedback_I",
            "feedback_D",
            "running",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        assert!(props
            .set_property("temperature", &Value::Float(10.0))
            .is_err());
        assert!(props
            .set_property("set_temperature", &Value::Float(500.0))
            .is_err());
        props
            .set_property("feedback_P", &Value::Float(2.5))
            .unwrap();
        assert_eq!(controller.feedback().0, 2.5);
    }

    #[test]
    fn test_chiller_set_point_name() {
        let chiller = SimulatedChiller::new("chiller", &config()).unwrap();
        let props = chiller.simulator().properties();
        props
            .set_property("nominal_temperature", &Value::Float(10.0))
            .unwrap();
        assert_eq!(chiller.simulator().set_point(), 10.0);
        assert_eq!(chiller.simulator().identity(), SimulatedChiller::IDENTITY);
    }

    #[test]
    fn test_physics_thread_moves_temperature() {
        let chiller = SimulatedChiller::new("chiller", &config()).unwrap();
        let sim = chiller.simulator();
        sim.set_set_point(10.0).unwrap();
        sim.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sim.temperature() > 21.0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        sim.stop();
        assert!(sim.temperature() <= 21.0);
        assert!(!sim.running().running());
    }
}
