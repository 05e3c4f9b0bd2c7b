//! Process wiring.
//!
//! [`BeamlineApp`] builds every configured domain object, connects the IOCs
//! to a shared [`LocalBus`] and owns their lifecycles:
//!
//! ```text
//! simulators ─┐
//! timing_system, xray_detector ─┼─▶ hosts ─▶ Ioc ─▶ LocalBus
//! xray_detector_coordinator ────┘
//! ```
//!
//! `timing_system` and `xray_detector` are the property endpoints their
//! external drivers write through the bus.

use anyhow::{Context, Result};
use beamline_core::{Db, Observable, PropertyHost, PropertySet};
use beamline_detector::{Coordinator, CoordinatorInputs, ExternalDetector, HeaderTimestampDecoder};
use beamline_driver_sim::{
    EmulatedPortPair, LineServer, SimulatedChiller, SimulatedTemperatureController,
    ThermalSimulator,
};
use beamline_ioc::bus::DEFAULT_CHANNEL_CAPACITY;
use beamline_ioc::{Ioc, LocalBus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;

/// How long shutdown waits for each background thread.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

struct EmulatedInstrument {
    object: String,
    pair: EmulatedPortPair,
    server: LineServer,
}

/// The running beamline process.
pub struct BeamlineApp {
    db: Db,
    bus: Arc<LocalBus>,
    hosts: BTreeMap<String, Arc<dyn PropertyHost>>,
    simulators: Vec<Arc<ThermalSimulator>>,
    // Keeps the controller's feedback properties alive
    _controller: Option<SimulatedTemperatureController>,
    emulated: Vec<EmulatedInstrument>,
    coordinator: Option<Arc<Coordinator>>,
    iocs: Vec<Ioc>,
}

impl std::fmt::Debug for BeamlineApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamlineApp")
            .field("database", &self.db.root())
            .field("objects", &self.hosts.keys().collect::<Vec<_>>())
            .field("iocs", &self.iocs.len())
            .finish_non_exhaustive()
    }
}

fn timing_system() -> Arc<PropertySet> {
    let timing = Arc::new(PropertySet::new("timing_system"));
    let owner = timing.owner().clone();
    timing.register(Arc::new(Observable::new(&owner, "xdet_trig_count", 0i64)));
    timing.register(Arc::new(Observable::new(&owner, "xdet_acq_count", 0i64)));
    timing.register(Arc::new(Observable::new(&owner, "acquiring", false)));
    timing
}

fn xray_detector() -> Arc<PropertySet> {
    let detector = Arc::new(PropertySet::new("xray_detector"));
    let owner = detector.owner().clone();
    detector.register(Arc::new(Observable::new(&owner, "nimages", 0i64)));
    detector.register(Arc::new(Observable::new(&owner, "acquire", false)));
    detector.register(Arc::new(Observable::new(&owner, "read_bkg", false)));
    detector.register(Arc::new(Observable::new(&owner, "acquiring", false)));
    detector
}

impl BeamlineApp {
    /// Build every configured object. Nothing runs until [`start`](Self::start).
    pub fn build(config: &AppConfig) -> Result<Self> {
        let db = Db::open(&config.database.root, config.database.poll_interval)
            .with_context(|| format!("opening settings database {}", config.database.root.display()))?;
        let bus = Arc::new(LocalBus::new(DEFAULT_CHANNEL_CAPACITY));
        let mut hosts: BTreeMap<String, Arc<dyn PropertyHost>> = BTreeMap::new();
        let mut simulators = Vec::new();
        let mut controller = None;

        if config.simulator.enabled {
            let temperature = SimulatedTemperatureController::new(
                "temperature",
                &config.simulator.temperature_controller,
            )?;
            let chiller = SimulatedChiller::new("chiller", &config.simulator.chiller)?;
            simulators.push(Arc::clone(temperature.simulator()));
            simulators.push(Arc::clone(chiller.simulator()));
            controller = Some(temperature);
        }
        for simulator in &simulators {
            let props = simulator.properties();
            hosts.insert(props.owner().name().to_string(), props);
        }

        let mut emulated = Vec::new();
        if config.simulator.serve_on_emulated_port {
            for simulator in &simulators {
                let pair = EmulatedPortPair::open()?;
                let server = LineServer::new(Arc::clone(simulator), pair.simulator_port()?);
                emulated.push(EmulatedInstrument {
                    object: simulator.properties().owner().name().to_string(),
                    pair,
                    server,
                });
            }
        }

        let coordinator = match &config.detector {
            Some(detector_config) => {
                let timing = timing_system();
                let detector = xray_detector();
                let inputs = CoordinatorInputs {
                    xdet_trig_count: timing.reference("xdet_trig_count"),
                    xdet_acq_count: timing.reference("xdet_acq_count"),
                    timing_system_acquiring: timing.reference("acquiring"),
                };
                let coordinator = Coordinator::new(
                    detector_config.clone(),
                    &db,
                    &inputs,
                    Arc::new(HeaderTimestampDecoder::default()),
                    Arc::new(ExternalDetector::new(detector.clone())),
                )?;
                hosts.insert("timing_system".to_string(), timing);
                hosts.insert("xray_detector".to_string(), detector);
                hosts.insert(
                    "xray_detector_coordinator".to_string(),
                    coordinator.properties().clone(),
                );
                Some(coordinator)
            }
            None => None,
        };

        let mut iocs = Vec::new();
        for binding in &config.ioc {
            let host = hosts.get(&binding.object).cloned().with_context(|| {
                format!(
                    "IOC '{}' publishes unknown object '{}' (known: {})",
                    binding.config.prefix,
                    binding.object,
                    hosts.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            })?;
            iocs.push(Ioc::new(binding.config.clone(), host, bus.clone())?);
        }

        Ok(Self {
            db,
            bus,
            hosts,
            simulators,
            _controller: controller,
            emulated,
            coordinator,
            iocs,
        })
    }

    /// Start simulators, line servers, the coordinator and the IOCs, in that
    /// order.
    pub fn start(&self) -> Result<()> {
        for simulator in &self.simulators {
            simulator.start()?;
        }
        for instrument in &self.emulated {
            instrument.server.start()?;
            tracing::info!(
                object = %instrument.object,
                port = %instrument.pair.driver_path().display(),
                "simulator serving on emulated serial port"
            );
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.running().start()?;
            tracing::info!(
                scratch = %coordinator.config().scratch_directory.display(),
                "detector coordinator running"
            );
        }
        for ioc in &self.iocs {
            ioc.start()
                .with_context(|| format!("starting IOC '{}'", ioc.prefix()))?;
            tracing::info!(prefix = ioc.prefix(), names = ioc.pv_names().len(), "IOC started");
        }
        Ok(())
    }

    /// Stop everything in reverse start order.
    pub fn shutdown(&self) {
        for ioc in &self.iocs {
            ioc.stop();
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.running().stop();
            if !coordinator.running().wait_stopped(STOP_TIMEOUT) {
                tracing::warn!("detector coordinator did not stop in time");
            }
        }
        for instrument in &self.emulated {
            instrument.server.stop();
        }
        for simulator in &self.simulators {
            simulator.stop();
        }
        tracing::info!("shutdown complete");
    }

    /// Settings database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The control bus the IOCs publish on.
    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    /// A domain object by name.
    pub fn host(&self, name: &str) -> Option<Arc<dyn PropertyHost>> {
        self.hosts.get(name).cloned()
    }

    /// Names of all domain objects.
    pub fn object_names(&self) -> Vec<String> {
        self.hosts.keys().cloned().collect()
    }

    /// The detector coordinator, if configured.
    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// `(object, driver path)` of each simulator served on an emulated port.
    pub fn emulated_ports(&self) -> Vec<(String, PathBuf)> {
        self.emulated
            .iter()
            .map(|i| (i.object.clone(), i.pair.driver_path().to_path_buf()))
            .collect()
    }
}
