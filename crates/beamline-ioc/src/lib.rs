//! `beamline-ioc`
//!
//! Republishes properties of beamline objects on a control-system bus so
//! that external clients can read, monitor and write them by name.
//!
//! An [`Ioc`] owns one prefix. For every configured property it publishes
//! `<prefix>.<FIELD>` (the upper-cased property name), pushes an update
//! whenever the local property changes, and forwards writes arriving from the
//! bus back to the property. A slow round-robin scan re-publishes every
//! property once per `scan_period`, so late-joining clients and lost updates
//! converge.
//!
//! The wire protocol is not part of this crate. [`ControlBus`] is the seam;
//! [`LocalBus`] is the in-process implementation used by the application and
//! tests.

pub mod bus;
pub mod error;
pub mod ioc;

pub use bus::{BusMessage, BusUpdate, ControlBus, LocalBus, WriteSink};
pub use error::IocError;
pub use ioc::{pv_name, Ioc, IocConfig, IocState};
