//! Events, handlers and subscription sets.
//!
//! An [`Event`] is an immutable `(source, time, value)` record. A [`Handler`]
//! is a callback plus a key; handlers with equal keys are equal, so adding
//! the same handler twice to a [`MonitorSet`] is a no-op.
//!
//! # Delivery
//!
//! [`MonitorSet::notify`] runs every handler synchronously on the calling
//! thread, in subscription order. The handler list is snapshotted before the
//! first callback, so handlers may subscribe or unsubscribe while being
//! notified. A handler that triggers a notification of the *same* set on the
//! same thread is short-circuited rather than recursing.
//!
//! # Activation Hooks
//!
//! Derived properties only track their upstream references while somebody
//! listens to them. A set created with [`MonitorSet::with_hooks`] calls
//! [`ActivationHooks::activate`] when its first handler is added and
//! [`ActivationHooks::deactivate`] when its last handler is removed.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::reference::ReferenceId;
use crate::timestamp;
use crate::value::Value;

/// An immutable value-change record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The reference whose value changed
    pub source: ReferenceId,
    /// Seconds since the Unix epoch
    pub time: f64,
    /// The new value
    pub value: Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(source: ReferenceId, value: Value) -> Self {
        Self::at(source, timestamp::now(), value)
    }

    /// Create an event with an explicit timestamp.
    pub fn at(source: ReferenceId, time: f64, value: Value) -> Self {
        Self {
            source,
            time,
            value,
        }
    }
}

/// Callback type invoked with each event.
pub type HandlerFn = dyn Fn(&Event) + Send + Sync;

/// A subscribable callback with structural equality.
///
/// The key plays the role of the callback's bound arguments: two handlers
/// built for the same purpose (e.g. `"ioc:14IDB:chiller"`) compare equal even
/// if they were constructed separately.
#[derive(Clone)]
pub struct Handler {
    key: Arc<str>,
    callback: Arc<HandlerFn>,
}

impl Handler {
    /// Create a handler identified by `key`.
    pub fn new<F>(key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            key: Arc::from(key.into()),
            callback: Arc::new(callback),
        }
    }

    /// The identity key of this handler.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Invoke the callback.
    pub fn call(&self, event: &Event) {
        (self.callback)(event);
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Handler {}

impl std::hash::Hash for Handler {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("key", &self.key).finish()
    }
}

/// Called when a [`MonitorSet`] gains its first or loses its last handler.
pub trait ActivationHooks: Send + Sync {
    /// First handler was added.
    fn activate(&self);
    /// Last handler was removed.
    fn deactivate(&self);
}

struct MonitorInner {
    handlers: Mutex<Vec<Handler>>,
    hooks: Option<Arc<dyn ActivationHooks>>,
}

/// A shared, set-like collection of handlers for one reference.
///
/// Cloning a `MonitorSet` clones the handle; all clones see the same handlers.
#[derive(Clone)]
pub struct MonitorSet {
    inner: Arc<MonitorInner>,
}

impl Default for MonitorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MonitorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorSet")
            .field("handlers", &self.keys())
            .field("has_hooks", &self.inner.hooks.is_some())
            .finish()
    }
}

thread_local! {
    /// Sets currently delivering an event on this thread.
    static NOTIFYING: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

struct NotifyGuard(usize);

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFYING.with(|set| {
            set.borrow_mut().remove(&self.0);
        });
    }
}

impl MonitorSet {
    /// Create an empty set without activation hooks.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                handlers: Mutex::new(Vec::new()),
                hooks: None,
            }),
        }
    }

    /// Create an empty set that reports its first/last subscriber.
    pub fn with_hooks(hooks: Arc<dyn ActivationHooks>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                handlers: Mutex::new(Vec::new()),
                hooks: Some(hooks),
            }),
        }
    }

    /// Add a handler. Returns `false` if an equal handler was already present.
    pub fn add(&self, handler: Handler) -> bool {
        let first = {
            let mut handlers = self.inner.handlers.lock();
            if handlers.contains(&handler) {
                return false;
            }
            handlers.push(handler);
            handlers.len() == 1
        };
        if first {
            if let Some(hooks) = &self.inner.hooks {
                hooks.activate();
            }
        }
        true
    }

    /// Remove the handler with the given key. Returns `false` if absent.
    pub fn remove(&self, key: &str) -> bool {
        let emptied = {
            let mut handlers = self.inner.handlers.lock();
            let before = handlers.len();
            handlers.retain(|h| h.key() != key);
            if handlers.len() == before {
                return false;
            }
            handlers.is_empty()
        };
        if emptied {
            if let Some(hooks) = &self.inner.hooks {
                hooks.deactivate();
            }
        }
        true
    }

    /// True if a handler with this key is subscribed.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.handlers.lock().iter().any(|h| h.key() == key)
    }

    /// Number of subscribed handlers.
    pub fn len(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// True if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.inner.handlers.lock().is_empty()
    }

    /// Keys of all subscribed handlers, in subscription order.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .handlers
            .lock()
            .iter()
            .map(|h| h.key().to_string())
            .collect()
    }

    /// True if both handles refer to the same underlying set.
    pub fn ptr_eq(&self, other: &MonitorSet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Deliver an event to every handler on the calling thread.
    ///
    /// A panicking handler is logged and does not prevent delivery to the
    /// remaining handlers.
    pub fn notify(&self, event: &Event) {
        let id = Arc::as_ptr(&self.inner) as usize;
        let entered = NOTIFYING.with(|set| set.borrow_mut().insert(id));
        if !entered {
            tracing::debug!(source = %event.source, "re-entrant notification suppressed");
            return;
        }
        let _guard = NotifyGuard(id);

        let handlers = self.inner.handlers.lock().clone();
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.call(event))).is_err() {
                tracing::error!(
                    source = %event.source,
                    handler = handler.key(),
                    "event handler panicked"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reference::ObjectId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source() -> ReferenceId {
        ReferenceId::new(&ObjectId::new("test"), "value")
    }

    #[test]
    fn test_add_is_idempotent() {
        let set = MonitorSet::new();
        assert!(set.add(Handler::new("a", |_| {})));
        assert!(!set.add(Handler::new("a", |_| {})));
        assert!(set.add(Handler::new("b", |_| {})));
        assert_eq!(set.len(), 2);
        assert_eq!(set.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_remove_leaves_no_residue() {
        let set = MonitorSet::new();
        set.add(Handler::new("panel", |_| {}));
        assert!(set.remove("panel"));
        assert!(!set.remove("panel"));
        assert!(set.is_empty());
        assert!(!set.contains("panel"));
    }

    #[test]
    fn test_notify_in_subscription_order() {
        let set = MonitorSet::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = log.clone();
            set.add(Handler::new(name, move |e: &Event| {
                log.lock().push((name, e.value.clone()));
            }));
        }
        set.notify(&Event::new(source(), Value::Int(5)));
        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].0, "first");
        assert_eq!(log[2].0, "third");
        assert_eq!(log[1].1, Value::Int(5));
    }

    #[test]
    fn test_reentrant_notify_is_short_circuited() {
        let set = MonitorSet::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let inner_set = set.clone();
        let counter = calls.clone();
        set.add(Handler::new("echo", move |e: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner_set.notify(e);
        }));
        set.notify(&Event::new(source(), Value::Int(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Guard is released afterwards
        set.notify(&Event::new(source(), Value::Int(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let set = MonitorSet::new();
        let calls = Arc::new(AtomicUsize::new(0));
        set.add(Handler::new("bad", |_| panic!("boom")));
        let counter = calls.clone();
        set.add(Handler::new("good", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        set.notify(&Event::new(source(), Value::Null));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct CountingHooks {
        active: AtomicUsize,
        inactive: AtomicUsize,
    }

    impl ActivationHooks for CountingHooks {
        fn activate(&self) {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        fn deactivate(&self) {
            self.inactive.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_activation_hooks_fire_on_first_and_last() {
        let hooks = Arc::new(CountingHooks {
            active: AtomicUsize::new(0),
            inactive: AtomicUsize::new(0),
        });
        let set = MonitorSet::with_hooks(hooks.clone());
        set.add(Handler::new("a", |_| {}));
        set.add(Handler::new("b", |_| {}));
        assert_eq!(hooks.active.load(Ordering::SeqCst), 1);
        set.remove("a");
        assert_eq!(hooks.inactive.load(Ordering::SeqCst), 0);
        set.remove("b");
        assert_eq!(hooks.inactive.load(Ordering::SeqCst), 1);
    }
}
