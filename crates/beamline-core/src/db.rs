//! Filesystem-backed key/value store.
//!
//! Keys are slash-separated paths with a dotted suffix, e.g.
//! `"domain/BioCARS/camera.acquiring"`. Everything up to the first dot of the
//! last path segment names a settings file; the rest names an entry in it:
//!
//! ```text
//! <root>/domain/BioCARS/camera_settings.txt
//!     acquiring = True
//!     exposure_time = 0.01
//! ```
//!
//! A key without a dot maps to the entry `value`. Values are stored as
//! literal text (see [`Value::to_literal`]); the store itself only deals in
//! strings.
//!
//! # Consistency
//!
//! Each settings file has one lock. Writes are read-modify-write under that
//! lock and replace the file atomically (temp file + rename). The store
//! caches parsed files by `(mtime, length)` and re-reads on any change, so
//! writes made by other processes on the same filesystem are seen on the
//! next access.
//!
//! # Change Notification
//!
//! [`Db::monitors`] returns one shared [`MonitorSet`] per key. While a key
//! has subscribers, a background watcher compares its value after every OS
//! file event and at least once per poll interval (≤ 1 s) and emits an
//! [`Event`] when it changes. The event value is the parsed literal, or the
//! raw string when it does not parse. Writes through this handle emit
//! immediately and update the watcher's baseline under the file lock, so
//! they are never reported twice.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, SystemTime};

use crate::error::{BeamlineError, Result};
use crate::event::{ActivationHooks, Event, Handler, MonitorSet};
use crate::reference::{ObjectId, ReferenceId};
use crate::retry::{with_retry, RetryPolicy};
use crate::value::Value;

/// Upper bound on the change-detection poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

const SETTINGS_SUFFIX: &str = "_settings.txt";
const DEFAULT_ENTRY: &str = "value";

/// Parsed contents of one settings file plus the file signature they came from.
#[derive(Default)]
struct FileCache {
    signature: Option<(SystemTime, u64)>,
    entries: BTreeMap<String, String>,
}

impl FileCache {
    /// Re-read the file if its signature changed since the last read.
    fn refresh(&mut self, path: &Path) -> io::Result<()> {
        let signature = match fs::metadata(path) {
            Ok(meta) => Some((meta.modified()?, meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        if signature.is_some() && signature == self.signature {
            return Ok(());
        }
        self.entries = match signature {
            Some(_) => parse_settings(&fs::read_to_string(path)?),
            None => BTreeMap::new(),
        };
        self.signature = signature;
        Ok(())
    }

    /// Atomically replace the file with the current entries.
    fn store(&mut self, path: &Path) -> io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if self.entries.is_empty() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            self.signature = None;
            return Ok(());
        }
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for (key, value) in &self.entries {
            writeln!(tmp, "{key} = {value}")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        let meta = fs::metadata(path)?;
        self.signature = Some((meta.modified()?, meta.len()));
        Ok(())
    }
}

fn parse_settings(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Event payload for a stored string.
fn event_value(raw: &str) -> Value {
    if raw.is_empty() {
        Value::Null
    } else {
        Value::parse_literal(raw).unwrap_or_else(|_| Value::Str(raw.to_string()))
    }
}

struct DbInner {
    id: ObjectId,
    root: PathBuf,
    poll_interval: Duration,
    read_retry: RetryPolicy,
    files: Mutex<HashMap<PathBuf, Arc<Mutex<FileCache>>>>,
    monitors: Mutex<HashMap<String, MonitorSet>>,
    /// Last value seen for every key with subscribers
    watched: Mutex<HashMap<String, String>>,
    watcher_started: AtomicBool,
}

/// Handle to a settings directory. Clones share caches, locks and monitors.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("root", &self.inner.root)
            .field("poll_interval", &self.inner.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let poll_interval = poll_interval.min(MAX_POLL_INTERVAL);
        tracing::debug!(root = %root.display(), ?poll_interval, "opened settings database");
        Ok(Self {
            inner: Arc::new(DbInner {
                id: ObjectId::new(format!("db:{}", root.display())),
                root,
                poll_interval,
                read_retry: RetryPolicy::default(),
                files: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                watched: Mutex::new(HashMap::new()),
                watcher_started: AtomicBool::new(false),
            }),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Identity used as the source object of key events.
    pub fn object_id(&self) -> &ObjectId {
        &self.inner.id
    }

    /// Event source identity for `key`.
    pub fn reference_id(&self, key: &str) -> ReferenceId {
        ReferenceId::new(&self.inner.id, key)
    }

    /// Map a key to its settings file and entry name.
    fn locate(&self, key: &str) -> Result<(PathBuf, String)> {
        let invalid = || BeamlineError::InvalidKey(key.to_string());
        if key.is_empty()
            || key.contains("..")
            || key.starts_with('/')
            || key.contains(|c| matches!(c, '=' | '\n' | '\r' | '\\'))
        {
            return Err(invalid());
        }
        let (dir, last) = key.rsplit_once('/').unwrap_or(("", key));
        let (name, entry) = last.split_once('.').unwrap_or((last, DEFAULT_ENTRY));
        if name.is_empty() || entry.is_empty() {
            return Err(invalid());
        }
        let path = self
            .inner
            .root
            .join(dir)
            .join(format!("{name}{SETTINGS_SUFFIX}"));
        Ok((path, entry.trim().to_string()))
    }

    fn file(&self, path: &Path) -> Arc<Mutex<FileCache>> {
        self.inner
            .files
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Lock the settings file for `key`, refresh it, and run `f` on it.
    fn with_entries<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Path, &str, &mut FileCache) -> Result<R>,
    ) -> Result<R> {
        let (path, entry) = self.locate(key)?;
        let file = self.file(&path);
        let mut cache = file.lock();
        with_retry(&self.inner.read_retry, "settings read", || cache.refresh(&path))?;
        f(&path, &entry, &mut cache)
    }

    /// Stored value for `key`, or an empty string if absent or unreadable.
    pub fn get(&self, key: &str) -> String {
        match self.with_entries(key, |_, entry, cache| {
            Ok(cache.entries.get(entry).cloned().unwrap_or_default())
        }) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "settings read failed");
                String::new()
            }
        }
    }

    /// Store `value` under `key`. A no-op if the stored value is already equal.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        if value.contains(|c| matches!(c, '\n' | '\r')) {
            return Err(BeamlineError::Validation {
                property: key.to_string(),
                message: "stored values must be single-line literals".into(),
            });
        }
        let changed = self.with_entries(key, |path, entry, cache| {
            if cache.entries.get(entry).map(String::as_str) == Some(value) {
                return Ok(false);
            }
            cache.entries.insert(entry.to_string(), value.to_string());
            cache.store(path)?;
            self.record_baseline(key, value);
            Ok(true)
        })?;
        if changed {
            tracing::debug!(key, value, "stored setting");
            self.emit(key, value);
        }
        Ok(())
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.with_entries(key, |path, entry, cache| {
            if cache.entries.remove(entry).is_none() {
                return Ok(false);
            }
            cache.store(path)?;
            self.record_baseline(key, "");
            Ok(true)
        })?;
        if removed {
            tracing::debug!(key, "deleted setting");
            self.emit(key, "");
        }
        Ok(removed)
    }

    /// Full keys of all entries stored in the settings file named by `prefix`
    /// (e.g. `"domain/BioCARS/camera"`).
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let probe = format!("{prefix}.{DEFAULT_ENTRY}");
        self.with_entries(&probe, |_, _, cache| {
            Ok(cache
                .entries
                .keys()
                .map(|entry| {
                    if entry == DEFAULT_ENTRY {
                        prefix.to_string()
                    } else {
                        format!("{prefix}.{entry}")
                    }
                })
                .collect())
        })
        .unwrap_or_default()
    }

    /// The shared handler set for `key`.
    ///
    /// Adding the first handler starts watching the key; removing the last
    /// stops it.
    pub fn monitors(&self, key: &str) -> MonitorSet {
        self.inner
            .monitors
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                MonitorSet::with_hooks(Arc::new(KeyWatch {
                    db: Arc::downgrade(&self.inner),
                    key: key.to_string(),
                }))
            })
            .clone()
    }

    /// Register `handler` for changes of `key`.
    pub fn subscribe(&self, key: &str, handler: Handler) {
        self.monitors(key).add(handler);
    }

    /// Remove the handler with `handler_key` from `key`.
    pub fn unsubscribe(&self, key: &str, handler_key: &str) {
        self.monitors(key).remove(handler_key);
    }

    fn record_baseline(&self, key: &str, value: &str) {
        if let Some(last) = self.inner.watched.lock().get_mut(key) {
            *last = value.to_string();
        }
    }

    fn emit(&self, key: &str, raw: &str) {
        let monitors = self.inner.monitors.lock().get(key).cloned();
        if let Some(monitors) = monitors {
            monitors.notify(&Event::new(self.reference_id(key), event_value(raw)));
        }
    }

    fn start_watching(&self, key: &str) {
        // Baseline is taken under the file lock so a concurrent put cannot slip between
        let baseline = self.with_entries(key, |_, entry, cache| {
            let current = cache.entries.get(entry).cloned().unwrap_or_default();
            self.inner.watched.lock().insert(key.to_string(), current);
            Ok(())
        });
        if let Err(e) = baseline {
            tracing::warn!(key, error = %e, "cannot watch setting");
            return;
        }
        tracing::trace!(key, "watching setting");
        self.ensure_watcher();
    }

    fn stop_watching(&self, key: &str) {
        self.inner.watched.lock().remove(key);
    }

    /// Compare every watched key with its baseline and emit changes.
    fn check_watched(&self) {
        let keys: Vec<String> = self.inner.watched.lock().keys().cloned().collect();
        for key in keys {
            let changed = self.with_entries(&key, |_, entry, cache| {
                let current = cache.entries.get(entry).cloned().unwrap_or_default();
                let mut watched = self.inner.watched.lock();
                match watched.get_mut(&key) {
                    Some(last) if *last != current => {
                        *last = current.clone();
                        Ok(Some(current))
                    }
                    _ => Ok(None),
                }
            });
            match changed {
                Ok(Some(value)) => {
                    tracing::debug!(key = %key, value = %value, "setting changed on disk");
                    self.emit(&key, &value);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "settings check failed"),
            }
        }
    }

    fn ensure_watcher(&self) {
        if self
            .inner
            .watcher_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let root = self.inner.root.clone();
        let poll_interval = self.inner.poll_interval;
        let spawned = std::thread::Builder::new()
            .name("db-watcher".into())
            .spawn(move || watch_loop(weak, &root, poll_interval));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start settings watcher");
            self.inner.watcher_started.store(false, Ordering::Release);
        }
    }
}

/// Background loop: wake on OS events or the poll interval, then compare.
///
/// Exits once every [`Db`] handle has been dropped.
fn watch_loop(db: Weak<DbInner>, root: &Path, poll_interval: Duration) {
    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let watcher: Option<RecommendedWatcher> =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
    .and_then(|mut w| w.watch(root, RecursiveMode::Recursive).map(|()| w))
    .map_err(|e| {
        tracing::warn!(error = %e, "filesystem events unavailable, polling only");
    })
    .ok();

    loop {
        if watcher.is_some() {
            match rx.recv_timeout(poll_interval) {
                Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(poll_interval),
            }
            while rx.try_recv().is_ok() {}
        } else {
            std::thread::sleep(poll_interval);
        }
        let Some(inner) = db.upgrade() else {
            break;
        };
        Db { inner }.check_watched();
    }
    tracing::debug!(root = %root.display(), "settings watcher stopped");
}

/// Starts and stops watching one key as its monitor set fills and empties.
struct KeyWatch {
    db: Weak<DbInner>,
    key: String,
}

impl ActivationHooks for KeyWatch {
    fn activate(&self) {
        if let Some(inner) = self.db.upgrade() {
            Db { inner }.start_watching(&self.key);
        }
    }

    fn deactivate(&self) {
        if let Some(inner) = self.db.upgrade() {
            Db { inner }.stop_watching(&self.key);
        }
    }
}
