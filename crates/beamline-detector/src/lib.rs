//! `beamline-detector`
//!
//! Assigns the raw images an X-ray detector drops into its scratch directory
//! to archival filenames of the current dataset.
//!
//! The detector runs continuously and does not know which of its images
//! belong to a dataset. The timing system does: it counts every trigger
//! pulse and every pulse the acquisition loop commits to. The
//! [`Coordinator`] reads each scratch image's hardware timestamp, places it
//! on the timing system's time line via event histories, and hard links it
//! to `layout.xray_image_filename(xdet_acq_count - 1)`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beamline_core::{Db, Observable, PropertySet};
//! use beamline_detector::{
//!     Coordinator, CoordinatorConfig, CoordinatorInputs, DatasetLayout, ExternalDetector,
//!     HeaderTimestampDecoder,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Db::open("/var/lib/beamline/settings", Duration::from_secs(1))?;
//! let timing = Arc::new(PropertySet::new("timing_system"));
//! # timing.register(Arc::new(Observable::new(timing.owner(), "xdet_trig_count", 0i64)));
//! # timing.register(Arc::new(Observable::new(timing.owner(), "xdet_acq_count", 0i64)));
//! # timing.register(Arc::new(Observable::new(timing.owner(), "acquiring", false)));
//! let inputs = CoordinatorInputs {
//!     xdet_trig_count: timing.reference("xdet_trig_count"),
//!     xdet_acq_count: timing.reference("xdet_acq_count"),
//!     timing_system_acquiring: timing.reference("acquiring"),
//! };
//! let driver = Arc::new(PropertySet::new("rayonix"));
//! let coordinator = Coordinator::new(
//!     CoordinatorConfig::new("/tmp/xray_scratch"),
//!     &db,
//!     &inputs,
//!     Arc::new(HeaderTimestampDecoder::default()),
//!     Arc::new(ExternalDetector::new(driver)),
//! )?;
//!
//! coordinator.set_layout(Some(Arc::new(DatasetLayout::new("/data/lysozyme-1", "lysozyme-1", "rx"))));
//! coordinator.start_acquiring()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod image;
pub mod layout;
pub mod offsets;
pub mod scratch;

pub use archive::{link_or_copy, ArchiveOutcome};
pub use config::CoordinatorConfig;
pub use control::{DetectorControl, ExternalDetector};
pub use coordinator::{
    AcquisitionState, Assignment, Coordinator, CoordinatorInputs, CoordinatorStats, PollReport,
};
pub use error::{DetectorError, Result};
pub use image::{HeaderTimestampDecoder, ImageDecoder};
pub use layout::{AcquisitionLayout, DatasetLayout};
pub use scratch::{ScratchDirectory, ScratchEntry};
