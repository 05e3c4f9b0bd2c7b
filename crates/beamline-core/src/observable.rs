//! Observable Properties
//!
//! Typed live-value cells for driver-backed properties. An [`Observable<T>`]
//! is written by its driver thread and read by everything else; every change
//! is broadcast two ways:
//!
//! - synchronously, as an [`Event`] to the handlers in its [`MonitorSet`]
//!   (IOC republisher, event histories, monitored properties);
//! - asynchronously, through a `tokio::sync::watch` channel for async
//!   consumers that only care about the latest value.
//!
//! # Writes
//!
//! | Method | Read-only check | Validator | Emits |
//! |--------|-----------------|-----------|-------|
//! | [`set`](Observable::set) | yes | yes | on change |
//! | [`update`](Observable::update) | no | no | on change |
//!
//! `set` is for external writers (operator, IOC, scripts). `update` is for
//! the driver reporting a new readback, which is allowed even on read-only
//! properties. "Change" is judged NaN-aware: replacing NaN with NaN is not a
//! change.
//!
//! # Example
//!
//! ```rust
//! use beamline_core::{ObjectId, Observable};
//!
//! let chiller = ObjectId::new("chiller");
//! let set_point = Observable::new(&chiller, "set_temperature", 20.0)
//!     .with_units("C")
//!     .with_range(-10.0, 45.0);
//!
//! assert!(set_point.set(50.0).is_err());
//! assert!(set_point.set(22.0).unwrap());
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{BeamlineError, Result};
use crate::event::{Event, MonitorSet};
use crate::property_set::PropertyAccess;
use crate::reference::{ObjectId, ReferenceId};
use crate::value::{PropertyValue, Value};

// =============================================================================
// Type Aliases
// =============================================================================

/// Validator callback type.
///
/// Returns an error describing why the value is unacceptable.
pub type Validator<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

// =============================================================================
// Shared State
// =============================================================================

/// Metadata and validator shared by all clones of one observable.
struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

/// Descriptive metadata for a live property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Property name (unique within its object).
    pub name: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Physical units (e.g. "C", "mm", "counts").
    pub units: Option<String>,

    /// Whether external writers are rejected.
    ///
    /// The driver can still report readbacks through
    /// [`Observable::update`].
    pub read_only: bool,
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe live value with change notifications.
pub struct Observable<T: PropertyValue> {
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Shared metadata and validator
    shared: Arc<RwLock<ObservableSharedState<T>>>,
    /// Synchronous handlers
    monitors: MonitorSet,
    id: ReferenceId,
}

impl<T: PropertyValue> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("id", &self.id)
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: PropertyValue> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
            monitors: self.monitors.clone(),
            id: self.id.clone(),
        }
    }
}

impl<T: PropertyValue> Observable<T> {
    /// Create a live property `name` on `owner` with an initial value.
    pub fn new(owner: &ObjectId, name: impl Into<String>, initial_value: T) -> Self {
        let name = name.into();
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            id: ReferenceId::new(owner, &name),
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name,
                    ..Default::default()
                },
                validator: None,
            })),
            monitors: MonitorSet::new(),
        }
    }

    /// Add a description.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Reject external writes.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Property name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Reference identity of this property.
    pub fn id(&self) -> &ReferenceId {
        &self.id
    }

    /// Metadata snapshot.
    pub fn metadata(&self) -> ObservableMetadata {
        self.shared.read().metadata.clone()
    }

    /// Synchronous handler set.
    pub fn monitors(&self) -> MonitorSet {
        self.monitors.clone()
    }

    /// Validate a value without setting it.
    ///
    /// Fails if the property is read-only or the validator rejects the value.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(BeamlineError::ReadOnly(self.id.to_string()));
        }
        if let Some(validator) = &guard.validator {
            validator(value).map_err(|e| BeamlineError::Validation {
                property: self.id.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// External write: validate, store, and emit if the value changed.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> Result<bool> {
        self.validate(&value)?;
        Ok(self.update(value))
    }

    /// Driver write: store and emit if the value changed.
    pub fn update(&self, value: T) -> bool {
        let new_value = value.to_value();
        let changed = self.sender.send_if_modified(|current| {
            if current.to_value() == new_value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed {
            tracing::trace!(property = %self.id, value = %new_value, "value changed");
            self.monitors.notify(&Event::new(self.id.clone(), new_value));
        }
        changed
    }

    /// Dynamic read.
    pub fn get_value(&self) -> Value {
        self.get().to_value()
    }

    /// Dynamic external write with type coercion.
    pub fn set_value(&self, value: &Value) -> Result<()> {
        let typed = T::from_value(value).ok_or_else(|| BeamlineError::TypeMismatch {
            property: self.id.to_string(),
            expected: T::type_label(),
            value: value.to_literal(),
        })?;
        self.set(typed).map(|_| ())
    }

    /// Subscribe to value changes asynchronously.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of async subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Observable<T>
where
    T: PropertyValue + PartialOrd + Debug,
{
    /// Add min/max range validation.
    pub fn with_range(self, min: T, max: T) -> Self {
        self.shared.write().validator = Some(Arc::new(move |value: &T| {
            if value < &min || value > &max {
                Err(anyhow::anyhow!(
                    "Value {:?} out of range [{:?}, {:?}]",
                    value,
                    min,
                    max
                ))
            } else {
                Ok(())
            }
        }));
        self
    }
}

impl<T: PropertyValue> PropertyAccess for Observable<T> {
    fn name(&self) -> String {
        Observable::name(self)
    }

    fn get_value(&self) -> Result<Value> {
        Ok(Observable::get_value(self))
    }

    fn set_value(&self, value: &Value) -> Result<()> {
        Observable::set_value(self, value)
    }

    fn monitors(&self) -> MonitorSet {
        self.monitors.clone()
    }

    fn is_read_only(&self) -> bool {
        self.shared.read().metadata.read_only
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Handler;
    use parking_lot::Mutex;

    fn recorder<T: PropertyValue>(obs: &Observable<T>) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        obs.monitors().add(Handler::new("recorder", move |e: &Event| {
            sink.lock().push(e.value.clone());
        }));
        seen
    }

    #[test]
    fn test_basic_observable() {
        let owner = ObjectId::new("motor");
        let obs = Observable::new(&owner, "position", 42.0);
        assert_eq!(obs.get(), 42.0);
        assert_eq!(obs.name(), "position");
        assert_eq!(obs.id().attribute(), "position");
    }

    #[test]
    fn test_update_emits_only_on_change() {
        let owner = ObjectId::new("chiller");
        let obs = Observable::new(&owner, "temperature", 20.0);
        let seen = recorder(&obs);

        assert!(obs.update(21.0));
        assert!(!obs.update(21.0));
        assert!(obs.update(f64::NAN));
        assert!(!obs.update(f64::NAN));
        assert_eq!(seen.lock().len(), 2);
        assert!(seen.lock()[1].is_nan());
    }

    #[test]
    fn test_read_only_rejects_external_writes() {
        let owner = ObjectId::new("detector");
        let obs = Observable::new(&owner, "acquiring", false).read_only();

        let err = obs.set(true).unwrap_err();
        assert!(matches!(err, BeamlineError::ReadOnly(_)));
        assert!(!obs.get());

        // Driver readbacks still go through
        assert!(obs.update(true));
        assert!(obs.get());
    }

    #[test]
    fn test_range_validation() {
        let owner = ObjectId::new("controller");
        let obs = Observable::new(&owner, "set_temperature", 20.0).with_range(-10.0, 45.0);

        assert!(obs.set(30.0).is_ok());
        let err = obs.set(99.0).unwrap_err();
        assert!(matches!(err, BeamlineError::Validation { .. }));
        assert_eq!(obs.get(), 30.0);
    }

    #[test]
    fn test_dynamic_set_coerces_and_rejects() {
        let owner = ObjectId::new("timing");
        let obs = Observable::new(&owner, "count", 0i64);

        obs.set_value(&Value::Float(7.0)).unwrap();
        assert_eq!(obs.get(), 7);

        let err = obs.set_value(&Value::Str("seven".into())).unwrap_err();
        assert!(matches!(err, BeamlineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_metadata_is_shared_between_clones() {
        let owner = ObjectId::new("stage");
        let obs = Observable::new(&owner, "x", 0.0)
            .with_units("mm")
            .with_description("horizontal");
        let clone = obs.clone();
        assert_eq!(clone.metadata().units.as_deref(), Some("mm"));
        assert!(clone.monitors().ptr_eq(&obs.monitors()));
    }

    #[tokio::test]
    async fn test_async_subscription() {
        let owner = ObjectId::new("async");
        let obs = Observable::new(&owner, "value", 1i64);
        let mut rx = obs.subscribe();
        assert_eq!(obs.subscriber_count(), 1);

        obs.update(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}
