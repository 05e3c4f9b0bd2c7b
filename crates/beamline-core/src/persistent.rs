//! Persistent properties stored in the settings database.
//!
//! A [`PersistentProperty<T>`] is a descriptor: name, default value and key
//! template, but no storage of its own. It is bound to an owner implementing
//! [`DbBacked`], which supplies the [`Db`] and the `db_name` substituted into
//! the template. Reads parse the stored literal and coerce it to the
//! default's type; anything absent or malformed reads as the default.
//!
//! [`PersistentCell<T>`] is the same descriptor already bound to one key, for
//! registration in a [`PropertySet`](crate::PropertySet).

use std::fmt;

use crate::db::Db;
use crate::error::{BeamlineError, Result};
use crate::event::MonitorSet;
use crate::property_set::PropertyAccess;
use crate::value::{PropertyValue, Value};

/// Default key template: `<db_name>.<property name>`.
pub const DEFAULT_KEY_TEMPLATE: &str = "{db_name}.{name}";

/// An object whose persistent properties live in a settings database.
pub trait DbBacked {
    /// The database holding this object's settings.
    fn db(&self) -> &Db;

    /// Key prefix for this object, e.g. `"domain/BioCARS/camera"`.
    fn db_name(&self) -> String;
}

/// Parse a stored literal as `T`, falling back to `default`.
fn decode<T: PropertyValue>(key: &str, raw: &str, default: &T) -> T {
    if raw.is_empty() {
        return default.clone();
    }
    match Value::parse_literal(raw) {
        Ok(value) => T::from_value(&value).unwrap_or_else(|| {
            tracing::warn!(
                key,
                stored = raw,
                expected = T::type_label(),
                "stored setting has the wrong type, using default"
            );
            default.clone()
        }),
        Err(e) => {
            tracing::warn!(key, stored = raw, error = %e, "malformed setting, using default");
            default.clone()
        }
    }
}

/// Descriptor for a typed setting persisted under a templated key.
#[derive(Clone)]
pub struct PersistentProperty<T: PropertyValue> {
    name: String,
    default: T,
    key_template: String,
}

impl<T: PropertyValue> fmt::Debug for PersistentProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentProperty")
            .field("name", &self.name)
            .field("default", &self.default.to_value())
            .field("key_template", &self.key_template)
            .finish()
    }
}

impl<T: PropertyValue> PersistentProperty<T> {
    /// Property `name` with the given default and the default key template.
    pub fn new(name: impl Into<String>, default: T) -> Self {
        Self {
            name: name.into(),
            default,
            key_template: DEFAULT_KEY_TEMPLATE.to_string(),
        }
    }

    /// Use a fully-qualified key template. `{db_name}` and `{name}` are
    /// substituted.
    pub fn with_key(mut self, template: impl Into<String>) -> Self {
        self.key_template = template.into();
        self
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default value.
    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Database key for `owner`.
    pub fn key<O: DbBacked + ?Sized>(&self, owner: &O) -> String {
        self.key_template
            .replace("{db_name}", &owner.db_name())
            .replace("{name}", &self.name)
    }

    /// Read the value for `owner`.
    pub fn get<O: DbBacked + ?Sized>(&self, owner: &O) -> T {
        let key = self.key(owner);
        decode(&key, &owner.db().get(&key), &self.default)
    }

    /// Store the value for `owner`.
    pub fn set<O: DbBacked + ?Sized>(&self, owner: &O, value: &T) -> Result<()> {
        owner.db().put(&self.key(owner), &value.to_value().to_literal())
    }

    /// Change notifications for `owner`'s value.
    pub fn monitors<O: DbBacked + ?Sized>(&self, owner: &O) -> MonitorSet {
        owner.db().monitors(&self.key(owner))
    }

    /// Bind to `owner`, producing a cell usable as a registered property.
    pub fn bind<O: DbBacked + ?Sized>(&self, owner: &O) -> PersistentCell<T> {
        PersistentCell {
            db: owner.db().clone(),
            key: self.key(owner),
            name: self.name.clone(),
            default: self.default.clone(),
        }
    }
}

/// A persistent property bound to one database key.
#[derive(Clone)]
pub struct PersistentCell<T: PropertyValue> {
    db: Db,
    key: String,
    name: String,
    default: T,
}

impl<T: PropertyValue> fmt::Debug for PersistentCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentCell")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: PropertyValue> PersistentCell<T> {
    /// Cell for `key` in `db` named `name`.
    pub fn new(db: &Db, key: impl Into<String>, name: impl Into<String>, default: T) -> Self {
        Self {
            db: db.clone(),
            key: key.into(),
            name: name.into(),
            default,
        }
    }

    /// Database key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value, or the default if absent or malformed.
    pub fn get(&self) -> T {
        decode(&self.key, &self.db.get(&self.key), &self.default)
    }

    /// Store a new value.
    pub fn set(&self, value: &T) -> Result<()> {
        self.db.put(&self.key, &value.to_value().to_literal())
    }

    /// Change notifications for the key.
    pub fn monitors(&self) -> MonitorSet {
        self.db.monitors(&self.key)
    }
}

impl<T: PropertyValue> PropertyAccess for PersistentCell<T> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn get_value(&self) -> Result<Value> {
        Ok(self.get().to_value())
    }

    fn set_value(&self, value: &Value) -> Result<()> {
        let typed = T::from_value(value).ok_or_else(|| BeamlineError::TypeMismatch {
            property: self.key.clone(),
            expected: T::type_label(),
            value: value.to_literal(),
        })?;
        self.set(&typed)
    }

    fn monitors(&self) -> MonitorSet {
        PersistentCell::monitors(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Camera {
        db: Db,
    }

    impl DbBacked for Camera {
        fn db(&self) -> &Db {
            &self.db
        }

        fn db_name(&self) -> String {
            "domain/BioCARS/camera".into()
        }
    }

    fn camera(dir: &tempfile::TempDir) -> Camera {
        Camera {
            db: Db::open(dir.path(), Duration::from_millis(200)).unwrap(),
        }
    }

    #[test]
    fn test_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let count = PersistentProperty::new("count", 0i64);
        assert_eq!(count.get(&camera(&dir)), 0);
    }

    #[test]
    fn test_key_template() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera(&dir);
        let plain = PersistentProperty::new("exposure_time", 0.01);
        assert_eq!(plain.key(&cam), "domain/BioCARS/camera.exposure_time");

        let custom = PersistentProperty::new("offset", 0i64).with_key("detector/{name}");
        assert_eq!(custom.key(&cam), "detector/offset");
    }

    #[test]
    fn test_malformed_literal_reads_default() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera(&dir);
        cam.db.put("domain/BioCARS/camera.gain", "[unclosed").unwrap();
        cam.db.put("domain/BioCARS/camera.mode", "'text'").unwrap();

        assert_eq!(PersistentProperty::new("gain", 3i64).get(&cam), 3);
        // Parses, but is not an integer
        assert_eq!(PersistentProperty::new("mode", 7i64).get(&cam), 7);
    }

    #[test]
    fn test_coercion_to_default_type() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera(&dir);
        let exposure = PersistentProperty::new("exposure_time", 0.5);
        cam.db.put("domain/BioCARS/camera.exposure_time", "2").unwrap();
        assert_eq!(exposure.get(&cam), 2.0);

        exposure.set(&cam, &0.25).unwrap();
        assert_eq!(cam.db.get("domain/BioCARS/camera.exposure_time"), "0.25");
    }

    #[test]
    fn test_cell_dynamic_access() {
        let dir = tempfile::tempdir().unwrap();
        let cam = camera(&dir);
        let cell = PersistentProperty::new("acquiring", false).bind(&cam);

        cell.set_value(&Value::Bool(true)).unwrap();
        assert_eq!(cell.get_value().unwrap(), Value::Bool(true));
        assert!(cell.set_value(&Value::Str("yes".into())).is_err());
        assert_eq!(cell.key(), "domain/BioCARS/camera.acquiring");
    }
}
