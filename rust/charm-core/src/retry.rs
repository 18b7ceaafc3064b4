//! Deadline-bounded retries with a fixed delay, driven by the `backoff` crate.
use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use backoff::backoff::Backoff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub delay: Duration,
}

/// Waits `delay` between attempts, shortening the last wait so the final attempt lands on the
/// deadline
struct Deadline {
    policy: RetryPolicy,
    started: Instant,
}

impl Backoff for Deadline {
    fn reset(&mut self) {
        self.started = Instant::now();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let remaining = self.policy.timeout.checked_sub(self.started.elapsed())?;
        (!remaining.is_zero()).then(|| self.policy.delay.min(remaining))
    }
}

impl RetryPolicy {
    /// Budget for calls into the Contrail API while it may still be converging
    pub const PROVISIONING: RetryPolicy = RetryPolicy {
        timeout: Duration::from_secs(300),
        delay: Duration::from_secs(10),
    };

    /// A single attempt
    pub const ONCE: RetryPolicy = RetryPolicy {
        timeout: Duration::ZERO,
        delay: Duration::ZERO,
    };

    fn backoff(&self) -> Deadline {
        Deadline {
            policy: *self,
            started: Instant::now(),
        }
    }

    /// Calls `op` until it succeeds or the deadline passes, returning the last error.
    pub fn with_retry<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut attempt = 1_u32;
        let log_failure = |error: E, wait: Duration| {
            tracing::info!(what, attempt, %error, retry_in = ?wait, "attempt failed, retrying");
            attempt += 1;
        };
        let operation = || op().map_err(backoff::Error::transient);
        match backoff::retry_notify(self.backoff(), operation, log_failure) {
            Ok(value) => Ok(value),
            Err(backoff::Error::Permanent(error) | backoff::Error::Transient { err: error, .. }) => {
                tracing::warn!(what, %error, "giving up");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attempt_without_budget() {
        let mut calls = 0;
        let result: Result<(), String> = RetryPolicy::ONCE.with_retry("test", || {
            calls += 1;
            Err("nope".to_string())
        });
        assert_eq!(result, Err("nope".to_string()));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_until_success() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result = policy.with_retry("test", || {
            calls += 1;
            if calls < 3 {
                Err(format!("attempt {calls}"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn final_attempt_runs_at_the_deadline() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(300),
            delay: Duration::from_millis(200),
        };
        let started = Instant::now();
        let mut calls = 0;
        let result: Result<(), &str> = policy.with_retry("test", || {
            calls += 1;
            Err("still down")
        });
        assert_eq!(result, Err("still down"));
        // attempts at 0ms, 200ms and the clamped one at 300ms
        assert!((2..=3).contains(&calls));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
