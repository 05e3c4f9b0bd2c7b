//! Derived properties.
//!
//! A [`MonitoredProperty`] is computed from a declared list of upstream
//! [`Reference`]s:
//!
//! ```rust
//! use beamline_core::{MonitoredProperty, Observable, PropertySet, Value};
//! use std::sync::Arc;
//!
//! let stage = Arc::new(PropertySet::new("stage"));
//! let a = Observable::new(stage.owner(), "a", 1i64);
//! let b = Observable::new(stage.owner(), "b", 2i64);
//! stage.register(Arc::new(a.clone()));
//! stage.register(Arc::new(b.clone()));
//!
//! let sum = MonitoredProperty::builder(stage.owner(), "sum")
//!     .input("a", stage.reference("a"))
//!     .input("b", stage.reference("b"))
//!     .build(|inputs| Ok(Value::Int(inputs.i64("a")? + inputs.i64("b")?)));
//!
//! assert_eq!(sum.value(), Value::Int(3));
//! ```
//!
//! # Caching
//!
//! With no subscribers the property is recomputed on every read. The first
//! handler added to [`monitors`](MonitoredProperty::monitors) subscribes an
//! internal handler to every upstream reference; from then on the cached
//! value is kept current by change propagation and subscribers get an event
//! only when the recomputed value differs from the cache (NaN-aware). When
//! the last handler is removed the upstream subscriptions are torn down.
//!
//! # Failures
//!
//! An upstream read error or a compute error makes the property evaluate to
//! its fallback value (NaN unless configured otherwise), which is then
//! treated like any other value.
//!
//! # Concurrency
//!
//! Recomputation, cache update and the resulting event are serialized per
//! property, so concurrent upstream changes leave the cache and the last
//! event on the newest value. A re-entrant read of a property while it is
//! being computed on the same thread returns the cached value instead of
//! recursing.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{BeamlineError, Result};
use crate::event::{ActivationHooks, Event, Handler, MonitorSet};
use crate::property_set::PropertyAccess;
use crate::reference::{ObjectId, Reference, ReferenceId};
use crate::timestamp;
use crate::value::Value;

/// Compute function type.
pub type ComputeFn = dyn Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync;

/// Upstream values handed to a compute function, by input name.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    values: Vec<(String, Value)>,
}

impl Inputs {
    /// Value of input `name`.
    pub fn get(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow::anyhow!("no input named '{name}'"))
    }

    /// Input `name` as a float.
    pub fn f64(&self, name: &str) -> anyhow::Result<f64> {
        let value = self.get(name)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("input '{name}' is not numeric: {value}"))
    }

    /// Input `name` as an integer.
    pub fn i64(&self, name: &str) -> anyhow::Result<i64> {
        let value = self.get(name)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("input '{name}' is not an integer: {value}"))
    }

    /// Input `name` as a boolean.
    pub fn bool(&self, name: &str) -> anyhow::Result<bool> {
        let value = self.get(name)?;
        value
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("input '{name}' is not a boolean: {value}"))
    }

    /// All inputs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Builder for [`MonitoredProperty`].
pub struct MonitoredPropertyBuilder {
    id: ReferenceId,
    inputs: Vec<(String, Reference)>,
    fallback: Value,
}

impl MonitoredPropertyBuilder {
    /// Declare an upstream dependency available to the compute function as `name`.
    pub fn input(mut self, name: impl Into<String>, reference: Reference) -> Self {
        self.inputs.push((name.into(), reference));
        self
    }

    /// Value used when an upstream read or the computation fails.
    pub fn fallback(mut self, value: impl Into<Value>) -> Self {
        self.fallback = value.into();
        self
    }

    /// Finish with the compute function.
    pub fn build<F>(self, compute: F) -> MonitoredProperty
    where
        F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|weak: &Weak<MonitoredInner>| MonitoredInner {
            handler_key: format!("monitored:{:?}", self.id),
            id: self.id,
            inputs: self.inputs,
            compute: Box::new(compute),
            fallback: self.fallback,
            cache: Mutex::new(Cache::default()),
            update: ReentrantMutex::new(()),
            monitors: MonitorSet::with_hooks(Arc::new(UpstreamLink {
                inner: weak.clone(),
            })),
        });
        MonitoredProperty { inner }
    }
}

#[derive(Default)]
struct Cache {
    value: Option<Value>,
    computed_at: f64,
    fresh: bool,
}

struct MonitoredInner {
    id: ReferenceId,
    handler_key: String,
    inputs: Vec<(String, Reference)>,
    compute: Box<ComputeFn>,
    fallback: Value,
    cache: Mutex<Cache>,
    /// Held across evaluate, store and notify
    update: ReentrantMutex<()>,
    monitors: MonitorSet,
}

thread_local! {
    /// Properties being computed on this thread.
    static EVALUATING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

struct EvaluationGuard(usize);

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        EVALUATING.with(|set| {
            set.borrow_mut().remove(&self.0);
        });
    }
}

impl MonitoredInner {
    fn cached_or_fallback(&self) -> Value {
        self.cache
            .lock()
            .value
            .clone()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Read every upstream and run the compute function.
    fn evaluate(&self) -> Value {
        let key = self as *const Self as usize;
        let entered = EVALUATING.with(|set| set.borrow_mut().insert(key));
        if !entered {
            tracing::warn!(property = %self.id, "dependency cycle, returning cached value");
            return self.cached_or_fallback();
        }
        let _guard = EvaluationGuard(key);

        let mut inputs = Inputs::default();
        for (name, reference) in &self.inputs {
            match reference.value() {
                Ok(value) => inputs.values.push((name.clone(), value)),
                Err(e) => {
                    tracing::debug!(
                        property = %self.id,
                        upstream = %reference,
                        error = %e,
                        "upstream read failed"
                    );
                    return self.fallback.clone();
                }
            }
        }
        match (self.compute)(&inputs) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(property = %self.id, error = ?e, "compute failed");
                self.fallback.clone()
            }
        }
    }

    /// Recompute, store, and report whether the cached value changed.
    fn refresh(&self, fresh: bool) -> (Value, bool) {
        let _update = self.update.lock();
        let value = self.evaluate();
        let mut cache = self.cache.lock();
        let changed = cache.value.as_ref() != Some(&value);
        cache.value = Some(value.clone());
        cache.computed_at = timestamp::now();
        cache.fresh = fresh;
        (value, changed)
    }

    fn on_upstream_change(&self) {
        let _update = self.update.lock();
        let (value, changed) = self.refresh(true);
        if changed {
            self.monitors.notify(&Event::new(self.id.clone(), value));
        }
    }
}

/// Subscribes to upstream references while the property has subscribers.
struct UpstreamLink {
    inner: Weak<MonitoredInner>,
}

impl ActivationHooks for UpstreamLink {
    fn activate(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        for (_, reference) in &inner.inputs {
            let weak = self.inner.clone();
            reference
                .monitors()
                .add(Handler::new(inner.handler_key.clone(), move |_event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_upstream_change();
                    }
                }));
        }
        inner.refresh(true);
        tracing::trace!(property = %inner.id, "tracking upstream");
    }

    fn deactivate(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        for (_, reference) in &inner.inputs {
            reference.monitors().remove(&inner.handler_key);
        }
        inner.cache.lock().fresh = false;
        tracing::trace!(property = %inner.id, "stopped tracking upstream");
    }
}

/// A derived property computed from upstream references.
#[derive(Clone)]
pub struct MonitoredProperty {
    inner: Arc<MonitoredInner>,
}

impl fmt::Debug for MonitoredProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<_> = self.inner.inputs.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("MonitoredProperty")
            .field("id", &self.inner.id)
            .field("inputs", &inputs)
            .field("subscribers", &self.inner.monitors.len())
            .finish()
    }
}

impl MonitoredProperty {
    /// Start declaring derived property `name` on `owner`.
    pub fn builder(owner: &ObjectId, name: impl Into<String>) -> MonitoredPropertyBuilder {
        MonitoredPropertyBuilder {
            id: ReferenceId::new(owner, &name.into()),
            inputs: Vec::new(),
            fallback: Value::nan(),
        }
    }

    /// Reference identity.
    pub fn id(&self) -> &ReferenceId {
        &self.inner.id
    }

    /// Current value.
    ///
    /// Served from the cache while subscribed, computed otherwise.
    pub fn value(&self) -> Value {
        if !self.inner.monitors.is_empty() {
            let cache = self.inner.cache.lock();
            if cache.fresh {
                if let Some(value) = &cache.value {
                    return value.clone();
                }
            }
        }
        let subscribed = !self.inner.monitors.is_empty();
        self.inner.refresh(subscribed).0
    }

    /// When the cached value was last computed (NaN if never).
    pub fn last_computed(&self) -> f64 {
        let cache = self.inner.cache.lock();
        if cache.value.is_some() {
            cache.computed_at
        } else {
            f64::NAN
        }
    }

    /// Handlers notified when the derived value changes.
    pub fn monitors(&self) -> MonitorSet {
        self.inner.monitors.clone()
    }

    /// Names of the declared inputs.
    pub fn input_names(&self) -> Vec<String> {
        self.inner.inputs.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl PropertyAccess for MonitoredProperty {
    fn name(&self) -> String {
        self.inner.id.attribute().to_string()
    }

    fn get_value(&self) -> Result<Value> {
        Ok(self.value())
    }

    fn set_value(&self, _value: &Value) -> Result<()> {
        Err(BeamlineError::ReadOnly(self.inner.id.to_string()))
    }

    fn monitors(&self) -> MonitorSet {
        self.inner.monitors.clone()
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::observable::Observable;
    use crate::property_set::PropertySet;
    use crate::reference::PropertyHost;

    struct Fixture {
        set: Arc<PropertySet>,
        a: Observable<i64>,
        b: Observable<i64>,
        sum: MonitoredProperty,
    }

    fn fixture(a0: i64, b0: i64) -> Fixture {
        let set = Arc::new(PropertySet::new("fixture"));
        let a = Observable::new(set.owner(), "a", a0);
        let b = Observable::new(set.owner(), "b", b0);
        set.register(Arc::new(a.clone()));
        set.register(Arc::new(b.clone()));
        let sum = MonitoredProperty::builder(set.owner(), "sum")
            .input("a", set.reference("a"))
            .input("b", set.reference("b"))
            .build(|i| Ok(Value::Int(i.i64("a")? + i.i64("b")?)));
        Fixture { set, a, b, sum }
    }

    fn record(p: &MonitoredProperty) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        p.monitors().add(Handler::new("H", move |e: &Event| {
            sink.lock().push(e.value.clone());
        }));
        seen
    }

    #[test]
    fn test_unsubscribed_reads_recompute() {
        let f = fixture(1, 2);
        assert_eq!(f.sum.value(), Value::Int(3));
        f.a.update(10);
        assert_eq!(f.sum.value(), Value::Int(12));
    }

    #[test]
    fn test_fires_once_per_distinct_value() {
        let f = fixture(1, 1);
        let seen = record(&f.sum);

        f.a.update(1);
        f.b.update(2);
        assert_eq!(seen.lock().as_slice(), &[Value::Int(3)]);

        f.a.update(1);
        f.b.update(2);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(f.sum.value(), Value::Int(3));
    }

    #[test]
    fn test_upstream_change_with_equal_result_is_silent() {
        let set = Arc::new(PropertySet::new("peak"));
        let a = Observable::new(set.owner(), "a", 1i64);
        let b = Observable::new(set.owner(), "b", 5i64);
        set.register(Arc::new(a.clone()));
        set.register(Arc::new(b.clone()));
        let peak = MonitoredProperty::builder(set.owner(), "peak")
            .input("a", set.reference("a"))
            .input("b", set.reference("b"))
            .build(|i| Ok(Value::Int(i.i64("a")?.max(i.i64("b")?))));
        let seen = record(&peak);

        // Upstream fires, derived value stays 5
        assert!(a.update(2));
        assert!(seen.lock().is_empty());

        a.update(7);
        assert_eq!(seen.lock().as_slice(), &[Value::Int(7)]);
    }

    #[test]
    fn test_last_unsubscribe_removes_upstream_handlers() {
        let f = fixture(0, 0);
        let key = f.sum.inner.handler_key.clone();
        let _seen = record(&f.sum);
        assert!(f.a.monitors().contains(&key));
        assert!(f.b.monitors().contains(&key));

        f.sum.monitors().remove("H");
        assert!(!f.a.monitors().contains(&key));
        assert!(!f.b.monitors().contains(&key));
        assert!(f.a.monitors().is_empty());
    }

    #[test]
    fn test_compute_error_yields_fallback_and_emits() {
        let set = Arc::new(PropertySet::new("ratio"));
        let num = Observable::new(set.owner(), "num", 1.0);
        let den = Observable::new(set.owner(), "den", 2.0);
        set.register(Arc::new(num.clone()));
        set.register(Arc::new(den.clone()));
        let ratio = MonitoredProperty::builder(set.owner(), "ratio")
            .input("num", set.reference("num"))
            .input("den", set.reference("den"))
            .build(|i| {
                let den = i.f64("den")?;
                anyhow::ensure!(den != 0.0, "division by zero");
                Ok(Value::Float(i.f64("num")? / den))
            });
        let seen = record(&ratio);
        den.update(0.0);
        assert!(seen.lock()[0].is_nan());
        // NaN -> NaN is not a change
        num.update(5.0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_concurrent_upstream_changes_settle_on_latest() {
        let f = fixture(0, 0);
        let doubled = MonitoredProperty::builder(f.set.owner(), "doubled")
            .input("a", f.set.reference("a"))
            .build(|i| {
                let a = i.i64("a")?;
                // Widen the window between reading the input and storing
                std::thread::yield_now();
                Ok(Value::Int(a * 2))
            });
        let seen = record(&doubled);

        let writers: Vec<_> = (0..4i64)
            .map(|w| {
                let a = f.a.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        a.update(w * 1000 + i);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let expected = Value::Int(f.a.get() * 2);
        assert_eq!(doubled.value(), expected);
        assert_eq!(seen.lock().last(), Some(&expected));
    }

    #[test]
    fn test_missing_upstream_reads_as_fallback() {
        let set = Arc::new(PropertySet::new("partial"));
        let p = MonitoredProperty::builder(set.owner(), "p")
            .input("ghost", set.reference("ghost"))
            .fallback(-1i64)
            .build(|i| Ok(i.get("ghost")?.clone()));
        assert_eq!(p.value(), Value::Int(-1));
    }

    #[test]
    fn test_cycle_does_not_recurse() {
        let set = Arc::new(PropertySet::new("cycle"));
        let p = MonitoredProperty::builder(set.owner(), "p")
            .input("p", set.reference("p"))
            .build(|i| Ok(i.get("p")?.clone()));
        set.register(Arc::new(p.clone()));
        assert!(set.get_property("p").unwrap().is_nan());
    }

    #[test]
    fn test_derived_is_read_only() {
        let f = fixture(0, 0);
        f.set.register(Arc::new(f.sum.clone()));
        let err = f.set.set_property("sum", &Value::Int(1)).unwrap_err();
        assert!(matches!(err, BeamlineError::ReadOnly(_)));
        assert!(f.sum.last_computed().is_nan());
        f.sum.value();
        assert!(f.sum.last_computed() > 0.0);
    }
}
