//! `beamline-core`
//!
//! Property/event runtime shared by every beamline domain object.
//!
//! Domain objects (cameras, motors, chillers, timing channels, the detector
//! coordinator) expose named *properties*. A property comes in one of three
//! flavors:
//!
//! - **Live**: an [`Observable`] cell written by a driver thread.
//! - **Persistent**: a [`PersistentProperty`] stored in the filesystem-backed
//!   [`Db`], surviving process restarts.
//! - **Derived**: a [`MonitoredProperty`] computed from upstream references
//!   and re-evaluated when any of them changes.
//!
//! A [`Reference`] is a first-class handle to one attribute of one object.
//! Every reference carries a [`MonitorSet`] of [`Handler`]s that receive an
//! [`Event`] when the value changes. Handlers run on the thread that emitted
//! the event; there is no central scheduler.
//!
//! ## Data Flow
//!
//! ```text
//! driver thread ──update()──▶ Observable ──Event──▶ MonitorSet
//!                                                    ├─▶ MonitoredProperty (recompute, re-emit)
//!                                                    ├─▶ EventHistory (record)
//!                                                    └─▶ IOC republisher, coordinator, ...
//! ```
//!
//! ## Example
//!
//! ```rust
//! use beamline_core::{Handler, ObjectId, Observable};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let owner = ObjectId::new("chiller");
//! let temperature = Observable::new(&owner, "temperature", 20.0);
//!
//! let count = Arc::new(AtomicUsize::new(0));
//! let seen = count.clone();
//! temperature.monitors().add(Handler::new("counter", move |_event| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! temperature.update(21.5);
//! assert_eq!(count.load(Ordering::SeqCst), 1);
//! ```

pub mod alias;
pub mod cached;
pub mod db;
pub mod error;
pub mod event;
pub mod history;
pub mod monitored;
pub mod observable;
pub mod persistent;
pub mod property_set;
pub mod reference;
pub mod retry;
pub mod run_async;
pub mod thread_property;
pub mod timestamp;
pub mod value;

pub use alias::AliasProperty;
pub use cached::{singleton, CachedFunction};
pub use db::Db;
pub use error::{BeamlineError, Result};
pub use event::{Event, Handler, MonitorSet};
pub use history::{history, EventHistory};
pub use monitored::{Inputs, MonitoredProperty};
pub use observable::{Observable, ObservableMetadata};
pub use persistent::{DbBacked, PersistentCell, PersistentProperty};
pub use property_set::{PropertyAccess, PropertySet};
pub use reference::{ObjectId, PropertyHost, Reference, ReferenceId};
pub use retry::RetryPolicy;
pub use run_async::{run_async, supervised_loop};
pub use thread_property::{CancelFlag, ThreadProperty};
pub use value::{PropertyValue, Value};
