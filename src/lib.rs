//! # Beamline DAQ
//!
//! Application crate of the beamline runtime. The workspace crates provide
//! the building blocks:
//!
//! - **`beamline-core`**: properties, references, events, the settings
//!   database, event histories and background threads.
//! - **`beamline-ioc`**: republishing properties on a control bus.
//! - **`beamline-detector`**: assigning X-ray detector images to archive
//!   filenames using the timing system's counters.
//! - **`beamline-driver-sim`**: simulated temperature instruments and emulated
//!   serial ports.
//!
//! This crate adds what the process around them needs:
//!
//! - **`config`**: `AppConfig`, loaded from TOML and `BEAMLINE_` environment
//!   variables with Figment.
//! - **`tracing_init`**: subscriber setup (pretty, compact or JSON).
//! - **`app`**: `BeamlineApp`, which builds and runs the configured objects.

pub mod app;
pub mod config;
pub mod tracing_init;

pub use app::BeamlineApp;
pub use config::{AppConfig, ConfigError};
