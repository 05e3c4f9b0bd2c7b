//! Named collections of properties.
//!
//! [`PropertyAccess`] is the type-erased face of a single property (live,
//! persistent, derived, alias or thread). A [`PropertySet`] groups them under
//! one [`ObjectId`] and implements [`PropertyHost`], so domain objects get
//! references, alias traversal and IOC publishing by registering their cells
//! in a set instead of hand-writing a dispatch table.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::error::{BeamlineError, Result};
use crate::event::MonitorSet;
use crate::reference::{ObjectId, PropertyHost, Reference};
use crate::thread_property::ThreadProperty;
use crate::value::Value;

/// Type-erased access to one property.
pub trait PropertyAccess: Send + Sync {
    /// Property name within its object.
    fn name(&self) -> String;

    /// Read the current value.
    fn get_value(&self) -> Result<Value>;

    /// Write a new value.
    fn set_value(&self, value: &Value) -> Result<()>;

    /// Handlers notified when the value changes.
    fn monitors(&self) -> MonitorSet;

    /// Whether external writes are rejected.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Properties of one domain object.
pub struct PropertySet {
    owner: ObjectId,
    properties: RwLock<Vec<Arc<dyn PropertyAccess>>>,
    children: RwLock<Vec<(String, Arc<dyn PropertyHost>)>>,
}

impl fmt::Debug for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySet")
            .field("owner", &self.owner)
            .field("properties", &self.property_names())
            .finish_non_exhaustive()
    }
}

impl PropertySet {
    /// Empty set for a new object called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_owner(ObjectId::new(name))
    }

    /// Empty set for an existing identity.
    pub fn with_owner(owner: ObjectId) -> Self {
        Self {
            owner,
            properties: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
        }
    }

    /// Identity of the owning object.
    pub fn owner(&self) -> &ObjectId {
        &self.owner
    }

    /// Add a property, replacing one with the same name.
    pub fn register(&self, property: Arc<dyn PropertyAccess>) {
        let name = property.name();
        let mut properties = self.properties.write();
        if let Some(slot) = properties.iter_mut().find(|p| p.name() == name) {
            *slot = property;
        } else {
            properties.push(property);
        }
    }

    /// Add a thread property together with its `<name>_cancelled` flag.
    pub fn register_thread(&self, thread: &Arc<ThreadProperty>) {
        self.register(thread.clone());
        self.register(Arc::new(thread.cancelled_property()));
    }

    /// Add a child object reachable by alias paths.
    pub fn add_child(&self, name: impl Into<String>, child: Arc<dyn PropertyHost>) {
        let name = name.into();
        let mut children = self.children.write();
        children.retain(|(n, _)| *n != name);
        children.push((name, child));
    }

    /// Look up a property by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn PropertyAccess>> {
        self.properties
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<dyn PropertyAccess>> {
        self.get(name).ok_or_else(|| BeamlineError::UnknownProperty {
            object: self.owner.to_string(),
            property: name.to_string(),
        })
    }

    /// A [`Reference`] to one of this set's properties.
    pub fn reference(self: &Arc<Self>, name: &str) -> Reference {
        let host: Arc<dyn PropertyHost> = self.clone();
        Reference::new(host, name)
    }
}

impl PropertyHost for PropertySet {
    fn object_id(&self) -> &ObjectId {
        &self.owner
    }

    fn property_names(&self) -> Vec<String> {
        self.properties.read().iter().map(|p| p.name()).collect()
    }

    fn get_property(&self, name: &str) -> Result<Value> {
        self.require(name)?.get_value()
    }

    fn set_property(&self, name: &str, value: &Value) -> Result<()> {
        self.require(name)?.set_value(value)
    }

    fn monitors(&self, name: &str) -> Option<MonitorSet> {
        self.get(name).map(|p| p.monitors())
    }

    fn child(&self, name: &str) -> Option<Arc<dyn PropertyHost>> {
        self.children
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }
}
