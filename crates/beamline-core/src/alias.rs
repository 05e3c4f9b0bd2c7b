//! Properties that forward to a property of a nested object.
//!
//! An alias named by a dotted path `"a.b.c"` on a root object walks
//! `root.child("a").child("b")` and forwards to property `c` of the object it
//! lands on. Resolution is a fold over the parsed segments; each step yields
//! a new host and the last step yields a [`Reference`]. Subscribing to the
//! alias subscribes to that leaf reference, so the intermediate objects must
//! stay in place while anyone is subscribed.

use std::fmt;
use std::sync::Arc;

use crate::error::{BeamlineError, Result};
use crate::event::MonitorSet;
use crate::property_set::PropertyAccess;
use crate::reference::{ObjectId, PropertyHost, Reference, ReferenceId};
use crate::value::Value;

/// A forwarding property.
pub struct AliasProperty {
    name: String,
    id: ReferenceId,
    root: Arc<dyn PropertyHost>,
    path: String,
    segments: Vec<String>,
}

impl fmt::Debug for AliasProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliasProperty")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AliasProperty {
    /// Alias `name` on `owner` forwarding along `path` from `root`.
    ///
    /// Fails if the path is empty or has an empty segment.
    pub fn new(
        owner: &ObjectId,
        name: impl Into<String>,
        root: Arc<dyn PropertyHost>,
        path: &str,
    ) -> Result<Self> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if let Some(empty) = segments.iter().find(|s| s.trim().is_empty()) {
            return Err(BeamlineError::AliasResolution {
                path: path.to_string(),
                segment: empty.clone(),
            });
        }
        let name = name.into();
        Ok(Self {
            id: ReferenceId::new(owner, &name),
            name,
            root,
            path: path.to_string(),
            segments,
        })
    }

    /// The dotted path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Follow the path to the leaf reference.
    pub fn resolve(&self) -> Result<Reference> {
        let (leaf, parents) = self
            .segments
            .split_last()
            .ok_or_else(|| BeamlineError::AliasResolution {
                path: self.path.clone(),
                segment: String::new(),
            })?;
        let host = parents
            .iter()
            .try_fold(self.root.clone(), |host, segment| {
                host.child(segment)
                    .ok_or_else(|| BeamlineError::AliasResolution {
                        path: self.path.clone(),
                        segment: segment.clone(),
                    })
            })?;
        Ok(Reference::new(host, leaf))
    }

    /// Read through the alias.
    pub fn value(&self) -> Result<Value> {
        self.resolve()?.value()
    }

    /// Write through the alias.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        self.resolve()?.set_value(value)
    }
}

impl PropertyAccess for AliasProperty {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_value(&self) -> Result<Value> {
        self.value()
    }

    fn set_value(&self, value: &Value) -> Result<()> {
        AliasProperty::set_value(self, value.clone())
    }

    fn monitors(&self) -> MonitorSet {
        match self.resolve() {
            Ok(leaf) => leaf.monitors(),
            Err(e) => {
                tracing::warn!(alias = %self.id, error = %e, "unresolved alias, monitoring nothing");
                MonitorSet::new()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::event::{Event, Handler};
    use crate::observable::Observable;
    use crate::property_set::PropertySet;
    use parking_lot::Mutex;

    /// beamline -> detector -> timing with a `count` property at the bottom.
    fn tree() -> (Arc<PropertySet>, Observable<i64>) {
        let timing = Arc::new(PropertySet::new("timing"));
        let count = Observable::new(timing.owner(), "count", 0i64);
        timing.register(Arc::new(count.clone()));

        let detector = Arc::new(PropertySet::new("detector"));
        detector.add_child("timing", timing);

        let beamline = Arc::new(PropertySet::new("beamline"));
        beamline.add_child("detector", detector);
        (beamline, count)
    }

    #[test]
    fn test_alias_reads_and_writes_leaf() {
        let (root, count) = tree();
        let alias =
            AliasProperty::new(root.owner(), "frames", root.clone(), "detector.timing.count")
                .unwrap();

        count.update(12);
        assert_eq!(alias.value().unwrap(), Value::Int(12));
        alias.set_value(13).unwrap();
        assert_eq!(count.get(), 13);
    }

    #[test]
    fn test_alias_monitors_are_leaf_monitors() {
        let (root, count) = tree();
        let alias =
            AliasProperty::new(root.owner(), "frames", root.clone(), "detector.timing.count")
                .unwrap();
        assert!(PropertyAccess::monitors(&alias).ptr_eq(&count.monitors()));
        assert_eq!(alias.resolve().unwrap().id(), count.id());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        PropertyAccess::monitors(&alias).add(Handler::new("h", move |e: &Event| {
            sink.lock().push(e.value.clone());
        }));
        count.update(3);
        assert_eq!(seen.lock().as_slice(), &[Value::Int(3)]);
    }

    #[test]
    fn test_unresolvable_segment_is_reported() {
        let (root, _) = tree();
        let alias =
            AliasProperty::new(root.owner(), "bad", root.clone(), "detector.nothing.count").unwrap();
        match alias.value().unwrap_err() {
            BeamlineError::AliasResolution { segment, .. } => assert_eq!(segment, "nothing"),
            other => panic!("unexpected error {other}"),
        }
        assert!(AliasProperty::new(root.owner(), "x", root.clone(), "a..b").is_err());
    }
}
