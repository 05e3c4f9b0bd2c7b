//! The publisher.
//!
//! Lifecycle:
//!
//! ```text
//! Stopped --start()--> Starting --> Running --stop()--> Stopping --> Stopped
//! ```
//!
//! `start` and `stop` are idempotent. Local change handlers are registered
//! under the key `ioc:<prefix>`, so two IOCs with different prefixes can
//! publish the same property, and restarting never stacks handlers.

use beamline_core::{
    supervised_loop, BeamlineError, Event, Handler, PropertyHost, Reference, ThreadProperty,
    Value,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::bus::{BusUpdate, ControlBus, WriteSink};
use crate::error::IocError;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IocState {
    /// Nothing published.
    Stopped,
    /// Subscribing and publishing initial values.
    Starting,
    /// Serving all configured names.
    Running,
    /// Withdrawing names.
    Stopping,
}

fn default_scan_period() -> Duration {
    Duration::from_secs(10)
}

/// Configuration of one IOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocConfig {
    /// Bus name prefix, e.g. `NIH:CHILLER`
    pub prefix: String,

    /// Property names to publish
    #[serde(default)]
    pub properties: Vec<String>,

    /// Every property is re-published once per period
    #[serde(with = "humantime_serde", default = "default_scan_period")]
    pub scan_period: Duration,
}

impl IocConfig {
    /// Configuration publishing `properties` under `prefix`.
    pub fn new<I, S>(prefix: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            properties: properties.into_iter().map(Into::into).collect(),
            scan_period: default_scan_period(),
        }
    }

    /// Override the re-publish period.
    #[must_use]
    pub fn with_scan_period(mut self, scan_period: Duration) -> Self {
        self.scan_period = scan_period;
        self
    }

    /// Reject prefixes and property lists that cannot form bus names.
    pub fn validate(&self) -> Result<(), IocError> {
        if self.prefix.trim().is_empty() {
            return Err(IocError::Config("prefix must not be empty".into()));
        }
        if self.prefix.ends_with('.') {
            return Err(IocError::Config(format!(
                "prefix '{}' must not end with '.'",
                self.prefix
            )));
        }
        if let Some(bad) = self.properties.iter().find(|p| p.trim().is_empty()) {
            return Err(IocError::Config(format!("invalid property name '{bad}'")));
        }
        if self.scan_period.is_zero() {
            return Err(IocError::Config("scan_period must be positive".into()));
        }
        Ok(())
    }
}

/// Bus name of `property` under `prefix`: `<prefix>.<PROPERTY>`.
pub fn pv_name(prefix: &str, property: &str) -> String {
    format!("{prefix}.{}", property.to_uppercase())
}

struct Published {
    reference: Reference,
    pv: String,
}

struct IocInner {
    config: IocConfig,
    host: Arc<dyn PropertyHost>,
    bus: Arc<dyn ControlBus>,
    state: Mutex<IocState>,
    published: Vec<Published>,
    scan: ThreadProperty,
}

/// Publishes a set of properties of one host on a [`ControlBus`].
pub struct Ioc {
    inner: Arc<IocInner>,
}

impl fmt::Debug for Ioc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ioc")
            .field("prefix", &self.inner.config.prefix)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Ioc {
    /// An IOC in the `Stopped` state.
    pub fn new(
        config: IocConfig,
        host: Arc<dyn PropertyHost>,
        bus: Arc<dyn ControlBus>,
    ) -> Result<Self, IocError> {
        config.validate()?;
        let published = config
            .properties
            .iter()
            .map(|name| Published {
                reference: Reference::new(host.clone(), name),
                pv: pv_name(&config.prefix, name),
            })
            .collect();

        let inner = Arc::new_cyclic(|weak: &Weak<IocInner>| {
            let weak = weak.clone();
            let tick = tick_period(config.scan_period, config.properties.len());
            let name = format!("ioc:{}", config.prefix);
            let scan = ThreadProperty::new(host.object_id(), "ioc_scan", move |cancel| {
                let mut next = 0usize;
                supervised_loop(&name, cancel, tick, || {
                    if let Some(inner) = weak.upgrade() {
                        inner.scan_one(next);
                        next = next.wrapping_add(1);
                    }
                    Ok(())
                });
            });
            IocInner {
                config,
                host,
                bus,
                state: Mutex::new(IocState::Stopped),
                published,
                scan,
            }
        });
        Ok(Self { inner })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IocState {
        *self.inner.state.lock()
    }

    /// Configured prefix.
    pub fn prefix(&self) -> &str {
        &self.inner.config.prefix
    }

    /// Bus names this IOC serves while running.
    pub fn pv_names(&self) -> Vec<String> {
        self.inner.published.iter().map(|p| p.pv.clone()).collect()
    }

    /// Subscribe locally, publish current values and accept writes.
    ///
    /// Fails if a configured property does not exist on the host; nothing
    /// stays published in that case.
    pub fn start(&self) -> Result<(), IocError> {
        {
            let mut state = self.inner.state.lock();
            if *state != IocState::Stopped {
                return Ok(());
            }
            *state = IocState::Starting;
        }
        tracing::info!(prefix = %self.prefix(), "starting IOC");

        let known = self.inner.host.property_names();
        if let Some(missing) = self
            .inner
            .published
            .iter()
            .find(|p| !known.iter().any(|k| k == p.reference.attribute()))
        {
            *self.inner.state.lock() = IocState::Stopped;
            return Err(IocError::Property(BeamlineError::UnknownProperty {
                object: self.inner.host.object_id().to_string(),
                property: missing.reference.attribute().to_string(),
            }));
        }

        let key = self.handler_key();
        for published in &self.inner.published {
            let weak = Arc::downgrade(&self.inner);
            let pv = published.pv.clone();
            published
                .reference
                .monitors()
                .add(Handler::new(key.clone(), move |event: &Event| {
                    if let Some(inner) = weak.upgrade() {
                        inner.bus.publish(BusUpdate {
                            name: pv.clone(),
                            value: event.value.clone(),
                            timestamp: event.time,
                        });
                    }
                }));

            let reference = published.reference.clone();
            let sink: WriteSink = Arc::new(move |value: &Value| reference.set_value(value.clone()));
            self.inner.bus.register_writer(&published.pv, sink);

            self.inner.publish_current(published);
        }

        if let Err(e) = self.inner.scan.start() {
            tracing::warn!(prefix = %self.prefix(), error = %e, "periodic re-publish unavailable");
        }
        *self.inner.state.lock() = IocState::Running;
        Ok(())
    }

    /// Unsubscribe and withdraw every name.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != IocState::Running {
                return;
            }
            *state = IocState::Stopping;
        }
        tracing::info!(prefix = %self.prefix(), "stopping IOC");

        self.inner.scan.stop();
        let key = self.handler_key();
        for published in &self.inner.published {
            published.reference.monitors().remove(&key);
            self.inner.bus.unregister_writer(&published.pv);
            self.inner.bus.withdraw(&published.pv);
        }
        if !self.inner.scan.wait_stopped(self.inner.config.scan_period + Duration::from_secs(1)) {
            tracing::warn!(prefix = %self.prefix(), "re-publish thread still running after stop");
        }
        *self.inner.state.lock() = IocState::Stopped;
    }

    fn handler_key(&self) -> String {
        format!("ioc:{}", self.inner.config.prefix)
    }
}

impl Drop for Ioc {
    fn drop(&mut self) {
        self.stop();
    }
}

impl IocInner {
    fn publish_current(&self, published: &Published) {
        self.bus.publish(BusUpdate {
            name: published.pv.clone(),
            value: published.reference.value_or_nan(),
            timestamp: beamline_core::timestamp::now(),
        });
    }

    fn scan_one(&self, index: usize) {
        if *self.state.lock() != IocState::Running || self.published.is_empty() {
            return;
        }
        let published = &self.published[index % self.published.len()];
        self.publish_current(published);
    }
}

/// Interval between two scan ticks so that `count` properties are refreshed
/// once per `period`.
fn tick_period(period: Duration, count: usize) -> Duration {
    let count = u32::try_from(count.max(1)).unwrap_or(u32::MAX);
    (period / count).max(Duration::from_millis(10))
}
