//! Keyed singleton construction.
//!
//! Hardware handles (a serial port, a detector, a history over one
//! reference) must exist at most once per process. [`CachedFunction`] turns
//! a constructor into a memoizing factory: the first call with a given
//! argument constructs, every later call returns the same `Arc`. Concurrent
//! first calls with equal arguments block on one per-key [`OnceCell`] so
//! exactly one construction runs.
//!
//! [`singleton`] is the process-wide variant, keyed by the result type and a
//! key value, for factories that are plain functions rather than objects
//! threaded through construction.
//!
//! Entries are never evicted.

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// A memoizing factory `A -> Arc<R>`.
pub struct CachedFunction<A, R> {
    factory: Box<dyn Fn(&A) -> R + Send + Sync>,
    instances: Mutex<HashMap<A, Arc<OnceCell<Arc<R>>>>>,
}

impl<A, R> fmt::Debug for CachedFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFunction")
            .field("instances", &self.instances.lock().len())
            .finish_non_exhaustive()
    }
}

impl<A, R> CachedFunction<A, R>
where
    A: Eq + Hash + Clone,
{
    /// Wrap `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&A) -> R + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The instance for `args`, constructing it on first use.
    pub fn call(&self, args: A) -> Arc<R> {
        let cell = self.instances.lock().entry(args.clone()).or_default().clone();
        // Map lock is released; construction only blocks callers with equal args
        cell.get_or_init(|| Arc::new((self.factory)(&args))).clone()
    }

    /// The instance for `args` if it was already constructed.
    pub fn get(&self, args: &A) -> Option<Arc<R>> {
        self.instances
            .lock()
            .get(args)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of constructed instances.
    pub fn len(&self) -> usize {
        self.instances
            .lock()
            .values()
            .filter(|cell| cell.get().is_some())
            .count()
    }

    /// True if nothing has been constructed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type RegistryCell = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

static REGISTRY: Lazy<Mutex<HashMap<(TypeId, Box<dyn RegistryKey>), RegistryCell>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Object-safe hashable key for the process-wide registry.
trait RegistryKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_key(&self, other: &dyn RegistryKey) -> bool;
    fn hash_key(&self, state: &mut dyn std::hash::Hasher);
}

impl<K: Eq + Hash + Send + Sync + 'static> RegistryKey for K {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_key(&self, other: &dyn RegistryKey) -> bool {
        other.as_any().downcast_ref::<K>() == Some(self)
    }

    fn hash_key(&self, mut state: &mut dyn std::hash::Hasher) {
        self.hash(&mut state);
    }
}

impl PartialEq for Box<dyn RegistryKey> {
    fn eq(&self, other: &Self) -> bool {
        (**self).eq_key(&**other)
    }
}

impl Eq for Box<dyn RegistryKey> {}

impl Hash for Box<dyn RegistryKey> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (**self).hash_key(state);
    }
}

/// Process-wide singleton of type `T` for `key`.
///
/// `init` runs at most once per `(T, key)`; every caller receives the same
/// `Arc`.
pub fn singleton<T, K, F>(key: K, init: F) -> Arc<T>
where
    T: Send + Sync + 'static,
    K: Eq + Hash + Send + Sync + 'static,
    F: FnOnce() -> Arc<T>,
{
    let slot: (TypeId, Box<dyn RegistryKey>) = (TypeId::of::<T>(), Box::new(key));
    let cell = REGISTRY.lock().entry(slot).or_default().clone();
    let erased = cell.get_or_init(|| {
        let instance: Arc<dyn Any + Send + Sync> = init();
        instance
    });
    match erased.clone().downcast::<T>() {
        Ok(instance) => instance,
        // The slot is keyed by TypeId::of::<T>, so the stored value is a T
        Err(_) => unreachable!("singleton registry type confusion"),
    }
}
