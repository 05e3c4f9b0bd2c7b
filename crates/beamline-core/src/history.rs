//! Time-indexed value histories.
//!
//! An [`EventHistory`] is a bounded buffer of `(time, value)` pairs recorded
//! from one reference's events, kept sorted by time. When full, the oldest
//! entry is dropped. The value the reference had before the first recorded
//! event is kept as `initial_value`, so "what was the value at time t"
//! always has an answer.
//!
//! [`history`] returns the process-wide history for a reference, creating
//! and subscribing it on first use.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::cached::singleton;
use crate::event::{Event, Handler};
use crate::reference::{Reference, ReferenceId};
use crate::value::Value;

/// Capacity used when none is given.
pub const DEFAULT_MAX_COUNT: usize = 100;

/// A bounded, time-sorted record of one reference's values.
pub struct EventHistory {
    source: ReferenceId,
    max_count: usize,
    initial_value: Value,
    entries: Mutex<VecDeque<(f64, Value)>>,
}

impl fmt::Debug for EventHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHistory")
            .field("source", &self.source)
            .field("len", &self.len())
            .field("max_count", &self.max_count)
            .finish()
    }
}

/// The shared history of `reference`.
///
/// The first call for a reference snapshots its current value, subscribes,
/// and fixes the capacity; later calls return the same instance.
pub fn history(reference: &Reference, max_count: usize) -> Arc<EventHistory> {
    singleton::<EventHistory, ReferenceId, _>(reference.id().clone(), || {
        EventHistory::attach(reference, max_count)
    })
}

impl EventHistory {
    /// A detached history; feed it with [`record`](Self::record).
    pub fn new(source: ReferenceId, max_count: usize, initial_value: Value) -> Self {
        Self {
            source,
            max_count: max_count.max(1),
            initial_value,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// A history that records every event of `reference` from now on.
    ///
    /// Prefer [`history`], which shares one instance per reference.
    pub fn attach(reference: &Reference, max_count: usize) -> Arc<Self> {
        let initial_value = reference.value().unwrap_or_else(|e| {
            tracing::debug!(reference = %reference, error = %e, "no initial value");
            Value::Null
        });
        let history = Arc::new(Self::new(reference.id().clone(), max_count, initial_value));
        let weak = Arc::downgrade(&history);
        reference.monitors().add(Handler::new(
            format!("history:{:?}", reference.id()),
            move |event: &Event| {
                if let Some(history) = weak.upgrade() {
                    history.record(event.time, event.value.clone());
                }
            },
        ));
        history
    }

    /// Identity of the recorded reference.
    pub fn source(&self) -> &ReferenceId {
        &self.source
    }

    /// Capacity.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Value before the first recorded event.
    pub fn initial_value(&self) -> &Value {
        &self.initial_value
    }

    /// Insert an entry, keeping times sorted and the buffer within capacity.
    pub fn record(&self, time: f64, value: Value) {
        let mut entries = self.entries.lock();
        let at = entries.partition_point(|(t, _)| *t <= time);
        entries.insert(at, (time, value));
        while entries.len() > self.max_count {
            entries.pop_front();
        }
    }

    /// Drop every entry. `initial_value` is kept.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub fn events(&self) -> Vec<(f64, Value)> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Event times, oldest first.
    pub fn times(&self) -> Vec<f64> {
        self.entries.lock().iter().map(|(t, _)| *t).collect()
    }

    /// The most recent value recorded at or before `t`, else `initial_value`.
    pub fn value_before_or_at(&self, t: f64) -> Value {
        let entries = self.entries.lock();
        match entries.partition_point(|(time, _)| *time <= t) {
            0 => self.initial_value.clone(),
            n => entries[n - 1].1.clone(),
        }
    }

    /// Time of the most recent event at or before `t`, or NaN.
    pub fn last_event_time_before_or_at(&self, t: f64) -> f64 {
        let entries = self.entries.lock();
        match entries.partition_point(|(time, _)| *time <= t) {
            0 => f64::NAN,
            n => entries[n - 1].0,
        }
    }

    /// Time of the event nearest to `t` (the earlier one on a tie), or NaN.
    pub fn closest_event_time(&self, t: f64) -> f64 {
        let entries = self.entries.lock();
        let n = entries.partition_point(|(time, _)| *time < t);
        let before = n.checked_sub(1).map(|i| entries[i].0);
        let after = entries.get(n).map(|(time, _)| *time);
        match (before, after) {
            (Some(b), Some(a)) => {
                if t - b <= a - t {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => f64::NAN,
        }
    }

    /// Entries with `t1 <= time <= t2`.
    ///
    /// Unless an event falls exactly on `t1`, the value live at `t1` is
    /// prepended as a synthetic entry.
    pub fn values(&self, t1: f64, t2: f64) -> Vec<(f64, Value)> {
        if t2 < t1 {
            return Vec::new();
        }
        let live_at_start = self.value_before_or_at(t1);
        let entries = self.entries.lock();
        let start = entries.partition_point(|(time, _)| *time < t1);
        let end = entries.partition_point(|(time, _)| *time <= t2);
        let mut out = Vec::with_capacity(end.saturating_sub(start) + 1);
        let exact = entries.get(start).is_some_and(|(time, _)| *time == t1);
        if !exact {
            out.push((t1, live_at_start));
        }
        out.extend(entries.range(start..end).cloned());
        out
    }

    fn extreme(&self, t1: f64, t2: f64, prefer: impl Fn(f64, f64) -> bool) -> Value {
        self.values(t1, t2)
            .into_iter()
            .filter_map(|(_, v)| v.as_f64().filter(|x| !x.is_nan()).map(|x| (x, v)))
            .reduce(|best, next| if prefer(next.0, best.0) { next } else { best })
            .map(|(_, v)| v)
            .unwrap_or(Value::Null)
    }

    /// Largest numeric value over `[t1, t2]`, or `Null` if none.
    pub fn max_value(&self, t1: f64, t2: f64) -> Value {
        self.extreme(t1, t2, |a, b| a > b)
    }

    /// Smallest numeric value over `[t1, t2]`, or `Null` if none.
    pub fn min_value(&self, t1: f64, t2: f64) -> Value {
        self.extreme(t1, t2, |a, b| a < b)
    }
}
