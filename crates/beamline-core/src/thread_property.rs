//! Background tasks exposed as a boolean `running` property.
//!
//! A [`ThreadProperty`] owns at most one worker thread. Writing `true` starts
//! the worker, which runs the task closure with a [`CancelFlag`]; writing
//! `false` sets the flag. The task polls the flag at safe points and returns;
//! nothing is ever forcibly terminated. Reading the property reports whether
//! the worker is still alive.
//!
//! The cancellation flag is itself published as `<name>_cancelled` (see
//! [`ThreadProperty::cancelled_property`]).
//!
//! ```rust
//! use beamline_core::{ObjectId, ThreadProperty};
//! use std::time::Duration;
//!
//! let owner = ObjectId::new("scanner");
//! let scan = ThreadProperty::new(&owner, "running", |cancel| {
//!     while !cancel.is_cancelled() {
//!         cancel.sleep(Duration::from_millis(10));
//!     }
//! });
//! scan.start().unwrap();
//! assert!(scan.running());
//! scan.stop();
//! assert!(scan.wait_stopped(Duration::from_secs(1)));
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BeamlineError, Result};
use crate::event::{Event, MonitorSet};
use crate::property_set::PropertyAccess;
use crate::reference::{ObjectId, ReferenceId};
use crate::value::{PropertyValue, Value};

/// Granularity of [`CancelFlag::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation token.
#[derive(Clone, Default, Debug)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A flag that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Request cancellation. Returns whether the flag changed.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Clear the flag. Returns whether the flag changed.
    pub fn reset(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Task body type.
pub type TaskFn = dyn Fn(&CancelFlag) + Send + Sync;

/// Cancellation flag plus its change notifications.
struct CancelState {
    flag: CancelFlag,
    id: ReferenceId,
    monitors: MonitorSet,
}

impl CancelState {
    fn set(&self, cancelled: bool) {
        let changed = if cancelled {
            self.flag.cancel()
        } else {
            self.flag.reset()
        };
        if changed {
            self.monitors
                .notify(&Event::new(self.id.clone(), Value::Bool(cancelled)));
        }
    }
}

/// A background task whose lifecycle is a boolean property.
pub struct ThreadProperty {
    name: String,
    id: ReferenceId,
    task: Arc<TaskFn>,
    alive: Arc<AtomicBool>,
    start_lock: Mutex<()>,
    monitors: MonitorSet,
    cancel: Arc<CancelState>,
}

impl fmt::Debug for ThreadProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadProperty")
            .field("id", &self.id)
            .field("running", &self.running())
            .field("cancelled", &self.cancel.flag.is_cancelled())
            .finish()
    }
}

impl ThreadProperty {
    /// Declare task `name` on `owner`. Nothing runs until [`start`](Self::start).
    pub fn new<F>(owner: &ObjectId, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(&CancelFlag) + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            id: ReferenceId::new(owner, &name),
            cancel: Arc::new(CancelState {
                flag: CancelFlag::new(),
                id: ReferenceId::new(owner, &format!("{name}_cancelled")),
                monitors: MonitorSet::new(),
            }),
            name,
            task: Arc::new(task),
            alive: Arc::new(AtomicBool::new(false)),
            start_lock: Mutex::new(()),
            monitors: MonitorSet::new(),
        }
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference identity of the `running` property.
    pub fn id(&self) -> &ReferenceId {
        &self.id
    }

    /// True while the worker thread is alive.
    pub fn running(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// True once [`stop`](Self::stop) was requested and not yet reset by a start.
    pub fn cancelled(&self) -> bool {
        self.cancel.flag.is_cancelled()
    }

    /// The flag handed to the task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.flag.clone()
    }

    /// Handlers notified of `running` transitions.
    pub fn monitors(&self) -> MonitorSet {
        self.monitors.clone()
    }

    /// Start the worker. A no-op if it is already alive.
    ///
    /// A worker that was asked to stop but has not exited yet is not
    /// restarted; the request is logged at warn level and the flag stays set.
    pub fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock();
        if self.alive.swap(true, Ordering::AcqRel) {
            if self.cancel.flag.is_cancelled() {
                tracing::warn!(
                    task = %self.id,
                    "start ignored, previous worker still winding down"
                );
            }
            return Ok(());
        }
        self.cancel.set(false);

        let task = self.task.clone();
        let flag = self.cancel.flag.clone();
        let alive = self.alive.clone();
        let monitors = self.monitors.clone();
        let id = self.id.clone();
        let thread_name = format!("{}.{}", id.object(), self.name);
        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                monitors.notify(&Event::new(id.clone(), Value::Bool(true)));
                tracing::debug!(task = %id, "worker started");
                if catch_unwind(AssertUnwindSafe(|| task(&flag))).is_err() {
                    tracing::error!(task = %id, "worker panicked");
                }
                alive.store(false, Ordering::Release);
                tracing::debug!(task = %id, "worker exited");
                monitors.notify(&Event::new(id, Value::Bool(false)));
            });
        if let Err(source) = spawned {
            self.alive.store(false, Ordering::Release);
            return Err(BeamlineError::Spawn {
                name: thread_name,
                source,
            });
        }
        Ok(())
    }

    /// Request cooperative cancellation.
    pub fn stop(&self) {
        self.cancel.set(true);
    }

    /// `running = value`.
    pub fn set_running(&self, value: bool) -> Result<()> {
        if value {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    /// Wait until the worker has exited. Returns `false` on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.running() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// The `<name>_cancelled` flag as a property.
    pub fn cancelled_property(&self) -> CancelledProperty {
        CancelledProperty {
            name: format!("{}_cancelled", self.name),
            state: self.cancel.clone(),
        }
    }
}

impl PropertyAccess for ThreadProperty {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_value(&self) -> Result<Value> {
        Ok(Value::Bool(self.running()))
    }

    fn set_value(&self, value: &Value) -> Result<()> {
        let running = bool::from_value(value).ok_or_else(|| BeamlineError::TypeMismatch {
            property: self.id.to_string(),
            expected: "bool",
            value: value.to_literal(),
        })?;
        self.set_running(running)
    }

    fn monitors(&self) -> MonitorSet {
        self.monitors.clone()
    }
}

/// The cancellation flag of a [`ThreadProperty`], as a property.
pub struct CancelledProperty {
    name: String,
    state: Arc<CancelState>,
}

impl PropertyAccess for CancelledProperty {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_value(&self) -> Result<Value> {
        Ok(Value::Bool(self.state.flag.is_cancelled()))
    }

    fn set_value(&self, value: &Value) -> Result<()> {
        let cancelled = bool::from_value(value).ok_or_else(|| BeamlineError::TypeMismatch {
            property: self.state.id.to_string(),
            expected: "bool",
            value: value.to_literal(),
        })?;
        self.state.set(cancelled);
        Ok(())
    }

    fn monitors(&self) -> MonitorSet {
        self.state.monitors.clone()
    }
}
