//! Fire-and-forget background work.
//!
//! Background work must never take the process down: [`run_async`] and
//! [`supervised_loop`] log errors and panics from the closure they run and
//! carry on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::thread_property::CancelFlag;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `work` once on a new named thread.
///
/// Returns `None` if the thread could not be spawned (logged).
pub fn run_async<F>(name: &str, work: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    let task = name.to_string();
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = %task, error = ?e, "background task failed"),
            Err(payload) => tracing::error!(
                task = %task,
                panic = %panic_message(payload.as_ref()),
                "background task panicked"
            ),
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(task = name, error = %e, "failed to spawn background task");
            None
        }
    }
}

/// Call `iteration` every `period` until `cancel` is set.
///
/// An iteration that returns an error or panics is logged and the loop
/// continues with the next one. Runs on the calling thread; meant to be the
/// body of a [`ThreadProperty`](crate::ThreadProperty) task.
pub fn supervised_loop<F>(name: &str, cancel: &CancelFlag, period: Duration, mut iteration: F)
where
    F: FnMut() -> anyhow::Result<()>,
{
    while !cancel.is_cancelled() {
        let started = Instant::now();
        match catch_unwind(AssertUnwindSafe(&mut iteration)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(task = name, error = ?e, "loop iteration failed"),
            Err(payload) => tracing::error!(
                task = name,
                panic = %panic_message(payload.as_ref()),
                "loop iteration panicked"
            ),
        }
        let elapsed = started.elapsed();
        if elapsed < period && !cancel.sleep(period - elapsed) {
            break;
        }
    }
}
