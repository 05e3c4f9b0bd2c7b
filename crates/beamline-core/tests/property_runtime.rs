//! End-to-end behavior of the property runtime.

use beamline_core::{
    history, BeamlineError, CachedFunction, Db, DbBacked, Event, Handler, MonitorSet,
    MonitoredProperty, Observable, PersistentProperty, PropertyAccess, PropertyHost, PropertySet,
    ThreadProperty, Value,
};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

struct Counter {
    db: Db,
}

impl DbBacked for Counter {
    fn db(&self) -> &Db {
        &self.db
    }

    fn db_name(&self) -> String {
        "tests/counter".into()
    }
}

#[test]
fn persist_round_trip_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let count = PersistentProperty::new("count", 0i64);

    {
        let t = Counter {
            db: Db::open(dir.path(), Duration::from_millis(200)).unwrap(),
        };
        assert_eq!(count.get(&t), 0);
        count.set(&t, &42).unwrap();
    }

    // A new process sees only the files
    let t = Counter {
        db: Db::open(dir.path(), Duration::from_millis(200)).unwrap(),
    };
    assert_eq!(count.get(&t), 42);
}

#[test]
#[traced_test]
fn malformed_setting_is_logged_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let t = Counter {
        db: Db::open(dir.path(), Duration::from_millis(200)).unwrap(),
    };
    std::fs::create_dir_all(dir.path().join("tests")).unwrap();
    std::fs::write(
        dir.path().join("tests/counter_settings.txt"),
        "count = [1, 2\n",
    )
    .unwrap();

    assert_eq!(PersistentProperty::new("count", 9i64).get(&t), 9);
    assert!(logs_contain("malformed setting"));
}

#[test]
fn derived_property_fires_only_on_change() {
    let obj = Arc::new(PropertySet::new("t"));
    let a = Observable::new(obj.owner(), "a", 1i64);
    let b = Observable::new(obj.owner(), "b", 0i64);
    obj.register(Arc::new(a.clone()));
    obj.register(Arc::new(b.clone()));

    let p = MonitoredProperty::builder(obj.owner(), "P")
        .input("a", obj.reference("a"))
        .input("b", obj.reference("b"))
        .build(|i| Ok(Value::Int(i.i64("a")? + i.i64("b")?)));

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    p.monitors().add(Handler::new("H", move |e: &Event| {
        sink.lock().push(e.value.clone());
    }));

    obj.set_property("a", &Value::Int(1)).unwrap();
    obj.set_property("b", &Value::Int(2)).unwrap();
    assert_eq!(fired.lock().as_slice(), &[Value::Int(3)]);

    obj.set_property("a", &Value::Int(1)).unwrap();
    obj.set_property("b", &Value::Int(2)).unwrap();
    assert_eq!(fired.lock().len(), 1);
}

/// A sensor whose readout fails while `online` is false.
struct FlakySensor {
    reading: Observable<f64>,
    online: AtomicBool,
}

impl PropertyAccess for FlakySensor {
    fn name(&self) -> String {
        self.reading.name()
    }

    fn get_value(&self) -> beamline_core::Result<Value> {
        if self.online.load(Ordering::SeqCst) {
            Ok(self.reading.get_value())
        } else {
            Err(BeamlineError::Validation {
                property: self.reading.id().to_string(),
                message: "sensor offline".into(),
            })
        }
    }

    fn set_value(&self, value: &Value) -> beamline_core::Result<()> {
        self.reading.set_value(value)
    }

    fn monitors(&self) -> MonitorSet {
        self.reading.monitors()
    }
}

#[test]
fn derived_property_falls_back_while_upstream_fails() {
    let set = Arc::new(PropertySet::new("cryostream"));
    let sensor = Arc::new(FlakySensor {
        reading: Observable::new(set.owner(), "reading", 100.0),
        online: AtomicBool::new(true),
    });
    set.register(sensor.clone());
    let kelvin = MonitoredProperty::builder(set.owner(), "kelvin")
        .input("reading", set.reference("reading"))
        .build(|i| Ok(Value::Float(i.f64("reading")? + 273.15)));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    kelvin.monitors().add(Handler::new("panel", move |e: &Event| {
        sink.lock().push(e.value.clone());
    }));

    sensor.online.store(false, Ordering::SeqCst);
    sensor.reading.update(101.0);
    assert_eq!(seen.lock().len(), 1);
    assert!(seen.lock()[0].is_nan());
    assert!(kelvin.value().is_nan());

    sensor.online.store(true, Ordering::SeqCst);
    sensor.reading.update(102.0);
    let events = seen.lock().clone();
    assert_eq!(events.len(), 2);
    let recovered = events[1].as_f64().unwrap();
    assert!((recovered - 375.15).abs() < 1e-9);
    assert_eq!(kelvin.value(), events[1]);
}

#[test]
#[serial]
fn history_scenario() {
    let obj = Arc::new(PropertySet::new("history-scenario"));
    let v = Observable::new(obj.owner(), "v", 0i64);
    obj.register(Arc::new(v.clone()));

    let h = history(&obj.reference("v"), 100);
    h.record(0.0, Value::Int(10));
    h.record(1.0, Value::Int(20));
    h.record(2.0, Value::Int(30));

    assert_eq!(h.value_before_or_at(0.5), Value::Int(10));
    assert_eq!(h.value_before_or_at(1.0), Value::Int(20));
    assert_eq!(h.value_before_or_at(-1.0), Value::Int(0));
    assert_eq!(h.min_value(0.5, 2.5), Value::Int(10));
}

#[test]
#[serial]
fn history_times_are_monotonic_under_concurrent_writers() {
    let obj = Arc::new(PropertySet::new("history-concurrent"));
    let v = Observable::new(obj.owner(), "v", 0i64);
    obj.register(Arc::new(v.clone()));
    let h = history(&obj.reference("v"), 50);

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let v = v.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    v.update(w * 100 + i + 1);
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let times = h.times();
    assert!(times.len() <= 50);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn cancellation_within_one_iteration() {
    let obj = Arc::new(PropertySet::new("worker"));
    let iterations = Arc::new(AtomicUsize::new(0));
    let counter = iterations.clone();
    let task = Arc::new(ThreadProperty::new(obj.owner(), "running", move |cancel| {
        while !cancel.is_cancelled() {
            counter.fetch_add(1, Ordering::SeqCst);
            cancel.sleep(Duration::from_millis(200));
        }
    }));
    obj.register_thread(&task);

    obj.set_property("running", &Value::Bool(true)).unwrap();
    assert_eq!(obj.get_property("running").unwrap(), Value::Bool(true));
    std::thread::sleep(Duration::from_millis(50));

    let stop_requested = Instant::now();
    obj.set_property("running", &Value::Bool(false)).unwrap();
    assert_eq!(
        obj.get_property("running_cancelled").unwrap(),
        Value::Bool(true)
    );
    assert!(task.wait_stopped(Duration::from_secs(1)));
    assert!(stop_requested.elapsed() < Duration::from_secs(1));
    assert_eq!(obj.get_property("running").unwrap(), Value::Bool(false));
}

#[test]
fn references_are_equal_and_share_monitors() {
    let obj = Arc::new(PropertySet::new("o"));
    obj.register(Arc::new(Observable::new(obj.owner(), "a", 0.0)));

    let r1 = obj.reference("a");
    let r2 = obj.reference("a");
    assert_eq!(r1, r2);
    assert!(r1.monitors().ptr_eq(&r2.monitors()));
}

#[test]
fn cached_function_returns_same_instance() {
    let make = CachedFunction::new(|name: &String| format!("driver for {name}"));
    let x = make.call("chiller".to_string());
    assert!(Arc::ptr_eq(&x, &make.call("chiller".to_string())));
}

#[test]
fn closed_panel_leaves_no_handlers_behind() {
    let obj = Arc::new(PropertySet::new("camera"));
    let exposure = Observable::new(obj.owner(), "exposure", 0.1);
    let gain = Observable::new(obj.owner(), "gain", 1i64);
    obj.register(Arc::new(exposure.clone()));
    obj.register(Arc::new(gain.clone()));

    let derived = MonitoredProperty::builder(obj.owner(), "signal")
        .input("exposure", obj.reference("exposure"))
        .input("gain", obj.reference("gain"))
        .build(|i| Ok(Value::Float(i.f64("exposure")? * i.f64("gain")?)));

    // A panel subscribes to everything it shows, then is closed
    let panel_key = "panel:camera";
    for monitors in [
        obj.reference("exposure").monitors(),
        obj.reference("gain").monitors(),
        derived.monitors(),
    ] {
        monitors.add(Handler::new(panel_key, |_| {}));
    }
    for monitors in [
        obj.reference("exposure").monitors(),
        obj.reference("gain").monitors(),
        derived.monitors(),
    ] {
        monitors.remove(panel_key);
    }

    assert!(exposure.monitors().is_empty());
    assert!(gain.monitors().is_empty());
    assert!(derived.monitors().is_empty());
}
