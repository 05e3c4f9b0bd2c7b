//! Retry policy for transient failures.
//
// Serial timeouts, a settings file being replaced while it is read, a TCP
// read returning zero bytes: these are retried a few times before the caller
// gives up and reports the value as stale.

use std::fmt::Display;
use std::time::Duration;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use beamline_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.backoff_delay, Duration::from_millis(100));
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be `max_attempts + 1` including the initial try.
    /// Set to 0 to disable retries.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Run `op`, retrying on error according to `policy`.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                attempt += 1;
                tracing::debug!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "transient failure, retrying"
                );
                std::thread::sleep(policy.backoff_delay);
            }
            Err(e) => {
                if policy.max_attempts > 0 {
                    tracing::warn!(operation, error = %e, "giving up after retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<u32, String> = with_retry(&policy, "flaky", || {
            calls += 1;
            if calls < 3 {
                Err("timeout".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<(), String> = with_retry(&policy, "dead", || {
            calls += 1;
            Err(format!("attempt {calls}"))
        });
        assert_eq!(result, Err("attempt 4".to_string()));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_none_policy_tries_once() {
        let mut calls = 0;
        let _: Result<(), &str> = with_retry(&RetryPolicy::none(), "once", || {
            calls += 1;
            Err("no")
        });
        assert_eq!(calls, 1);
    }
}
