//! Control-system bus abstraction.
//!
//! ```text
//! Ioc --publish/withdraw--> ControlBus --BusMessage--> broadcast::Receiver (clients)
//! client --request_write--> ControlBus --WriteSink--> local property
//! ```

use beamline_core::{BeamlineError, Value};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::IocError;

/// One published value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusUpdate {
    /// Fully qualified bus name, `<prefix>.<FIELD>`
    pub name: String,
    /// Published value
    pub value: Value,
    /// Seconds since the Unix epoch at which the value changed
    pub timestamp: f64,
}

/// What clients observe on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BusMessage {
    /// A name was published or its value changed.
    Update(BusUpdate),
    /// A name is no longer served.
    Withdrawn(String),
}

/// Callback receiving external writes for one name.
pub type WriteSink = Arc<dyn Fn(&Value) -> Result<(), BeamlineError> + Send + Sync>;

/// Transport used by [`crate::Ioc`].
///
/// Implementations must be callable from any thread; `publish` is invoked
/// from property handlers running on driver threads.
pub trait ControlBus: Send + Sync {
    /// Serve `update.name` with a new value.
    fn publish(&self, update: BusUpdate);

    /// Stop serving `name`.
    fn withdraw(&self, name: &str);

    /// Route client writes for `name` to `sink`. Replaces an earlier sink.
    fn register_writer(&self, name: &str, sink: WriteSink);

    /// Stop routing writes for `name`.
    fn unregister_writer(&self, name: &str);

    /// A client write.
    fn request_write(&self, name: &str, value: &Value) -> Result<(), IocError>;
}

/// Default capacity of the update channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-process bus.
///
/// Keeps the last published value per name and broadcasts every change to
/// subscribers. Slow subscribers lag and miss messages; the periodic scan of
/// the publisher lets them catch up.
pub struct LocalBus {
    published: RwLock<BTreeMap<String, BusUpdate>>,
    writers: RwLock<HashMap<String, WriteSink>>,
    sender: broadcast::Sender<BusMessage>,
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("published", &self.published.read().len())
            .field("writers", &self.writers.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl LocalBus {
    /// Bus whose update channel buffers `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            published: RwLock::new(BTreeMap::new()),
            writers: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Last value served under `name`.
    pub fn get(&self, name: &str) -> Option<BusUpdate> {
        self.published.read().get(name).cloned()
    }

    /// Names currently served, sorted.
    pub fn names(&self) -> Vec<String> {
        self.published.read().keys().cloned().collect()
    }

    /// True if writes to `name` are routed somewhere.
    pub fn has_writer(&self, name: &str) -> bool {
        self.writers.read().contains_key(name)
    }

    fn broadcast(&self, message: BusMessage) {
        // No receivers is not an error for a bus
        let _ = self.sender.send(message);
    }
}

impl ControlBus for LocalBus {
    fn publish(&self, update: BusUpdate) {
        self.published
            .write()
            .insert(update.name.clone(), update.clone());
        self.broadcast(BusMessage::Update(update));
    }

    fn withdraw(&self, name: &str) {
        if self.published.write().remove(name).is_some() {
            self.broadcast(BusMessage::Withdrawn(name.to_string()));
        }
    }

    fn register_writer(&self, name: &str, sink: WriteSink) {
        self.writers.write().insert(name.to_string(), sink);
    }

    fn unregister_writer(&self, name: &str) {
        self.writers.write().remove(name);
    }

    fn request_write(&self, name: &str, value: &Value) -> Result<(), IocError> {
        let sink = self
            .writers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IocError::UnknownName(name.to_string()))?;
        sink(value).map_err(|source| {
            tracing::error!(name, value = %value.to_literal(), error = %source, "bus write rejected");
            IocError::WriteRejected {
                name: name.to_string(),
                source,
            }
        })
    }
}
