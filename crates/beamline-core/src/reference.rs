//! Object identity and first-class references to object attributes.
//!
//! A [`Reference`] names "attribute *a* of object *o*". Two references built
//! for the same object identity and attribute name are equal, hash alike and
//! share one [`MonitorSet`], so a handler added through one is visible
//! through the other.
//!
//! Objects participate by implementing [`PropertyHost`]. Hosts that keep
//! their own per-attribute monitor sets return them from
//! [`PropertyHost::monitors`]; for hosts that do not, the runtime keeps a
//! process-wide side table keyed by [`ReferenceId`]. Side-table entries of
//! dropped hosts are pruned whenever a new entry is added.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::event::{Event, MonitorSet};
use crate::value::Value;

// =============================================================================
// Identity
// =============================================================================

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a domain object.
///
/// Two objects with the same display name still have different ids.
/// Cloning an `ObjectId` keeps the identity.
#[derive(Clone)]
pub struct ObjectId {
    id: u64,
    name: Arc<str>,
}

impl ObjectId {
    /// Allocate a fresh identity with a display name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.into()),
        }
    }

    /// Numeric identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Structural identity of a reference: `(object, attribute)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReferenceId {
    object: ObjectId,
    attribute: Arc<str>,
}

impl ReferenceId {
    /// Identity of `attribute` on `object`.
    pub fn new(object: &ObjectId, attribute: &str) -> Self {
        Self {
            object: object.clone(),
            attribute: Arc::from(attribute),
        }
    }

    /// Owning object.
    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    /// Attribute name.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }
}

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.object, self.attribute)
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.attribute)
    }
}

// =============================================================================
// PropertyHost
// =============================================================================

/// An object whose attributes can be referenced.
pub trait PropertyHost: Send + Sync {
    /// Identity of this object.
    fn object_id(&self) -> &ObjectId;

    /// Names of all readable attributes.
    fn property_names(&self) -> Vec<String>;

    /// Read an attribute.
    fn get_property(&self, name: &str) -> Result<Value>;

    /// Write an attribute.
    fn set_property(&self, name: &str, value: &Value) -> Result<()>;

    /// The host's own monitor set for `name`, if it keeps one.
    ///
    /// Returning `None` makes references fall back to the process-wide side
    /// table, in which case only writes made through a [`Reference`] are
    /// reported.
    fn monitors(&self, _name: &str) -> Option<MonitorSet> {
        None
    }

    /// A child object reachable under `name`, for dotted alias paths.
    fn child(&self, _name: &str) -> Option<Arc<dyn PropertyHost>> {
        None
    }
}

struct SideEntry {
    host: Weak<dyn PropertyHost>,
    monitors: MonitorSet,
}

static SIDE_TABLE: Lazy<Mutex<HashMap<ReferenceId, SideEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Monitor set kept on behalf of `host`, which has none of its own.
///
/// The entry lives as long as the host does.
pub fn side_table_monitors(host: &Arc<dyn PropertyHost>, id: &ReferenceId) -> MonitorSet {
    let mut table = SIDE_TABLE.lock();
    if let Some(entry) = table.get(id) {
        return entry.monitors.clone();
    }
    table.retain(|_, entry| entry.host.strong_count() > 0);
    let monitors = MonitorSet::new();
    table.insert(
        id.clone(),
        SideEntry {
            host: Arc::downgrade(host),
            monitors: monitors.clone(),
        },
    );
    monitors
}

#[cfg(test)]
fn side_table_contains(id: &ReferenceId) -> bool {
    SIDE_TABLE.lock().contains_key(id)
}

// =============================================================================
// Reference
// =============================================================================

/// Handle to one attribute of one object.
#[derive(Clone)]
pub struct Reference {
    host: Arc<dyn PropertyHost>,
    id: ReferenceId,
}

impl Reference {
    /// Reference `attribute` on `host`.
    pub fn new(host: Arc<dyn PropertyHost>, attribute: &str) -> Self {
        let id = ReferenceId::new(host.object_id(), attribute);
        Self { host, id }
    }

    /// Structural identity.
    pub fn id(&self) -> &ReferenceId {
        &self.id
    }

    /// Attribute name.
    pub fn attribute(&self) -> &str {
        self.id.attribute()
    }

    /// The object this reference points into.
    pub fn host(&self) -> &Arc<dyn PropertyHost> {
        &self.host
    }

    /// Current value of the attribute.
    pub fn value(&self) -> Result<Value> {
        self.host.get_property(self.id.attribute())
    }

    /// Current value, or NaN if the read failed.
    pub fn value_or_nan(&self) -> Value {
        match self.value() {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(reference = %self.id, error = %e, "read failed, reporting NaN");
                Value::nan()
            }
        }
    }

    /// Write the attribute.
    ///
    /// Hosts with their own monitor sets emit the event themselves; for hosts
    /// using the side table the event is emitted here.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.host.set_property(self.id.attribute(), &value)?;
        if self.host.monitors(self.id.attribute()).is_none() {
            let monitors = side_table_monitors(&self.host, &self.id);
            if !monitors.is_empty() {
                monitors.notify(&Event::new(self.id.clone(), value));
            }
        }
        Ok(())
    }

    /// The shared handler set for this reference.
    pub fn monitors(&self) -> MonitorSet {
        self.host
            .monitors(self.id.attribute())
            .unwrap_or_else(|| side_table_monitors(&self.host, &self.id))
    }
}

/// Shorthand for `Reference::new(host.clone(), attribute)`.
pub fn reference<H: PropertyHost + 'static>(host: &Arc<H>, attribute: &str) -> Reference {
    let host: Arc<dyn PropertyHost> = host.clone();
    Reference::new(host, attribute)
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reference").field(&self.id).finish()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::BeamlineError;
    use crate::event::Handler;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    /// Plain object without its own monitor sets.
    struct Plain {
        id: ObjectId,
        values: Mutex<HashMap<String, Value>>,
    }

    impl Plain {
        fn new(name: &str) -> Arc<Self> {
            let mut values = HashMap::new();
            values.insert("a".to_string(), Value::Int(0));
            Arc::new(Self {
                id: ObjectId::new(name),
                values: Mutex::new(values),
            })
        }
    }

    impl PropertyHost for Plain {
        fn object_id(&self) -> &ObjectId {
            &self.id
        }

        fn property_names(&self) -> Vec<String> {
            self.values.lock().keys().cloned().collect()
        }

        fn get_property(&self, name: &str) -> Result<Value> {
            self.values
                .lock()
                .get(name)
                .cloned()
                .ok_or_else(|| BeamlineError::UnknownProperty {
                    object: self.id.to_string(),
                    property: name.to_string(),
                })
        }

        fn set_property(&self, name: &str, value: &Value) -> Result<()> {
            self.values.lock().insert(name.to_string(), value.clone());
            Ok(())
        }
    }

    #[test]
    fn test_references_are_structurally_equal() {
        let o = Plain::new("o");
        let r1 = reference(&o, "a");
        let r2 = reference(&o, "a");
        assert_eq!(r1, r2);

        let mut set = HashSet::new();
        set.insert(r1.clone());
        assert!(set.contains(&r2));

        assert_ne!(r1, reference(&o, "b"));
        // Same display name, different identity
        let other = Plain::new("o");
        assert_ne!(r1, reference(&other, "a"));
    }

    #[test]
    fn test_references_share_monitors() {
        let o = Plain::new("shared");
        let r1 = reference(&o, "a");
        let r2 = reference(&o, "a");
        assert!(r1.monitors().ptr_eq(&r2.monitors()));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        r1.monitors().add(Handler::new("h", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        r2.set_value(5).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(r1.value().unwrap(), Value::Int(5));

        r2.monitors().remove("h");
        assert!(r1.monitors().is_empty());
    }

    #[test]
    fn test_side_table_forgets_dropped_hosts() {
        let gone = Plain::new("gone");
        let id = reference(&gone, "a").id().clone();
        reference(&gone, "a").monitors().add(Handler::new("h", |_| {}));
        assert!(side_table_contains(&id));
        drop(gone);

        // The next new entry sweeps entries whose host is gone
        let live = Plain::new("live");
        let live_ref = reference(&live, "a");
        live_ref.monitors();
        assert!(!side_table_contains(&id));
        assert!(side_table_contains(live_ref.id()));
    }

    #[test]
    fn test_value_or_nan_on_missing_attribute() {
        let o = Plain::new("missing");
        assert!(reference(&o, "nope").value_or_nan().is_nan());
    }
}
