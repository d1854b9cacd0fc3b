//! Bounded retry with exponential backoff.
//!
//! Used for infrastructure flakiness only (spawning the test process, reaching
//! the repair oracle). Test-logic failures are never retried here.

use std::fmt::Display;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::backoff::{BackoffConfig, backoff_delay};
use crate::shutdown::Shutdown;

/// Something that can wait between attempts.
pub trait Sleeper {
    /// Wait for `duration`; return `false` if the wait was cut short by shutdown.
    fn sleep(&self, duration: Duration) -> bool;
}

impl Sleeper for Shutdown {
    fn sleep(&self, duration: Duration) -> bool {
        Shutdown::sleep(self, duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Terminal result of a retry loop that never succeeded.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts actually made.
    pub attempts: u32,
    pub last: E,
    /// True when the loop stopped early because shutdown was requested.
    pub interrupted: bool,
}

/// Call `op(attempt)` until it succeeds, returns a non-retryable error, or the
/// attempt ceiling is reached.
///
/// Non-retryable errors are returned immediately as `RetryExhausted` with
/// `attempts` set to the attempts made so far.
pub fn retry_with_backoff<T, E, S, R, C, F>(
    policy: &RetryPolicy,
    sleeper: &S,
    rng: &mut R,
    is_retryable: C,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    E: Display,
    S: Sleeper + ?Sized,
    R: Rng + ?Sized,
    C: Fn(&E) -> bool,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let made = attempt + 1;
                if !is_retryable(&err) {
                    debug!(attempt = made, err = %err, "non-retryable failure");
                    return Err(RetryExhausted {
                        attempts: made,
                        last: err,
                        interrupted: false,
                    });
                }
                warn!(attempt = made, max_attempts, err = %err, "attempt failed");
                if made >= max_attempts {
                    warn!(max_attempts, "all attempts failed");
                    return Err(RetryExhausted {
                        attempts: made,
                        last: err,
                        interrupted: false,
                    });
                }
                let delay = backoff_delay(attempt, &policy.backoff, rng);
                info!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
                if !sleeper.sleep(delay) {
                    return Err(RetryExhausted {
                        attempts: made,
                        last: err,
                        interrupted: true,
                    });
                }
                attempt = made;
            }
        }
    }
}
