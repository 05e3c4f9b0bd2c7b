//! `beamline-driver-sim`
//!
//! Simulated instruments for exercising driver code without hardware.
//!
//! - [`thermal`]: the first-order thermal model.
//! - [`simulator`]: a temperature controller and a chiller built on it, as
//!   property sets updated at 4 Hz.
//! - [`serial_emulator`]: raw pseudo-terminal pairs (com0com on Windows).
//! - [`protocol`]: a line protocol server connecting the two.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beamline_driver_sim::{EmulatedPortPair, LineServer, SimulatedChiller, SimulatorConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chiller = SimulatedChiller::new("chiller", &SimulatorConfig::default())?;
//! chiller.simulator().start()?;
//!
//! let pair = EmulatedPortPair::open()?;
//! let server = LineServer::new(Arc::clone(chiller.simulator()), pair.simulator_port()?);
//! server.start()?;
//!
//! // Driver code under test opens this path like any serial port
//! println!("chiller on {}", pair.driver_path().display());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod protocol;
pub mod serial_emulator;
pub mod simulator;
pub mod thermal;

pub use error::{Result, SimError};
pub use protocol::{Command, LineServer};
pub use serial_emulator::{discover_emulated_ports, EmulatedPortPair, SimulatorPort};
pub use simulator::{
    SimulatedChiller, SimulatedTemperatureController, SimulatorConfig, ThermalSimulator,
};
pub use thermal::ThermalModel;
