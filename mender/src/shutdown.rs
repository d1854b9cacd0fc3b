//! Cooperative shutdown signal with interruptible sleeps.
//!
//! The binary wires Ctrl-C to [`Shutdown::request`]. Long waits (retry backoff,
//! the inter-cycle interval) go through [`Shutdown::sleep`] so a stop request
//! takes effect without waiting out the full delay.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Default)]
struct Inner {
    requested: Mutex<bool>,
    wake: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let mut requested = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*requested {
            info!("shutdown requested");
        }
        *requested = true;
        self.inner.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if interrupted.
    /// A duration past the clock's range sleeps until shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut requested = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *requested {
                return false;
            }
            let Some(deadline) = deadline else {
                requested = self
                    .inner
                    .wake
                    .wait(requested)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return true;
            };
            if remaining.is_zero() {
                return true;
            }
            requested = self
                .inner
                .wake
                .wait_timeout(requested, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Request `shutdown` on Ctrl-C; a second Ctrl-C exits immediately.
///
/// The signal is awaited on a dedicated thread running a current-thread
/// tokio runtime, so the orchestrator itself stays synchronous.
pub fn listen_for_ctrl_c(shutdown: &Shutdown, exit_code: i32) {
    let shutdown = shutdown.clone();
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(%err, "ctrl-c handler unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if shutdown.is_requested() {
                        warn!("second interrupt, exiting without waiting");
                        std::process::exit(exit_code);
                    }
                    info!("interrupt received, finishing in-flight work");
                    shutdown.request();
                }
            });
        });
    if let Err(err) = spawned {
        warn!(%err, "ctrl-c handler thread not started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sleep_completes_without_request() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(10)));
        assert!(!shutdown.is_requested());
    }

    #[test]
    fn request_interrupts_long_sleep() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request();
        });
        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().expect("join");
    }

    #[test]
    fn unbounded_sleep_waits_for_request() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request();
        });
        assert!(!shutdown.sleep(Duration::from_secs(u64::MAX)));
        handle.join().expect("join");
    }

    #[test]
    fn sleep_after_request_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.request();
        assert!(!shutdown.sleep(Duration::from_secs(30)));
    }
}
