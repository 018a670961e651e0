//! Worker liveness.
//!
//! The controller pings each worker every [`HEARTBEAT_INTERVAL`]. A worker
//! that hears nothing for [`WATCHDOG_TIMEOUT`] assumes its controller is
//! gone and exits.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::error::{Error, Result};

use super::Endpoint;

// ============================================================================
// Constants
// ============================================================================

/// Interval between controller pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Silence after which a worker exits.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Shortest time a ping may take before it counts as failed.
const MIN_PING_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Heartbeat
// ============================================================================

/// Controller-side ping task. Stops on drop.
#[derive(Debug)]
pub struct Heartbeat {
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts pinging through `endpoint`.
    ///
    /// Pings bypass the socket lock, so they keep flowing while a long
    /// command is in flight. Failed pings are logged; the task ends once
    /// the endpoint's lock expires.
    #[must_use]
    pub fn spawn(endpoint: Arc<Endpoint>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match endpoint.ping(interval.max(MIN_PING_TIMEOUT)).await {
                    Ok(_) => trace!(instance = %endpoint.lock().instance(), "Heartbeat sent"),
                    Err(Error::ExpiredLock { .. }) => break,
                    Err(e) => warn!(
                        instance = %endpoint.lock().instance(),
                        error = %e,
                        "Heartbeat failed"
                    ),
                }
            }
        });

        Self { task }
    }

    /// Stops pinging.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Watchdog
// ============================================================================

struct WatchdogState {
    last_ping: Instant,
    stopped: bool,
}

struct WatchdogInner {
    state: Mutex<WatchdogState>,
    wake: Condvar,
    timeout: Duration,
}

/// Worker-side timer fed by heartbeats.
///
/// Runs `on_expire` once if no [`feed`](Self::feed) arrives within the
/// timeout. Cloning shares the timer.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// Starts a watchdog that exits the process when it fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the watchdog thread cannot be spawned.
    pub fn exit_process(timeout: Duration) -> Result<Self> {
        Self::spawn(timeout, move || {
            error!(timeout_ms = timeout.as_millis(), "No heartbeat received, exiting");
            std::process::exit(1);
        })
    }

    /// Starts a watchdog running `on_expire` when it fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the watchdog thread cannot be spawned.
    pub fn spawn(timeout: Duration, on_expire: impl FnOnce() + Send + 'static) -> Result<Self> {
        let inner = Arc::new(WatchdogInner {
            state: Mutex::new(WatchdogState {
                last_ping: Instant::now(),
                stopped: false,
            }),
            wake: Condvar::new(),
            timeout,
        });

        let watched = Arc::clone(&inner);
        thread::Builder::new()
            .name("heartbeat-watchdog".into())
            .spawn(move || {
                if watched.wait_for_expiry() {
                    on_expire();
                }
            })
            .map_err(Error::Io)?;

        Ok(Self { inner })
    }

    /// Records a heartbeat.
    pub fn feed(&self) {
        self.inner.state.lock().last_ping = Instant::now();
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn since_last_ping(&self) -> Duration {
        self.inner.state.lock().last_ping.elapsed()
    }

    /// Stops the watchdog without firing.
    pub fn stop(&self) {
        self.inner.state.lock().stopped = true;
        self.inner.wake.notify_all();
    }
}

impl WatchdogInner {
    /// Blocks until the timer expires (`true`) or is stopped (`false`).
    fn wait_for_expiry(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return false;
            }
            let deadline = state.last_ping + self.timeout;
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let _ = self.wake.wait_for(&mut state, deadline - now);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_constants() {
        assert_eq!(HEARTBEAT_INTERVAL.as_secs(), 5);
        assert_eq!(WATCHDOG_TIMEOUT.as_secs(), 60);
    }

    #[test]
    fn test_watchdog_fires_without_pings() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _watchdog = Watchdog::spawn(Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .expect("spawn");

        thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_feeding_keeps_watchdog_quiet() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let watchdog = Watchdog::spawn(Duration::from_millis(150), move || {
            flag.store(true, Ordering::SeqCst);
        })
        .expect("spawn");

        for _ in 0..6 {
            thread::sleep(Duration::from_millis(40));
            watchdog.feed();
        }
        assert!(!fired.load(Ordering::SeqCst));
        assert!(watchdog.since_last_ping() < Duration::from_millis(150));

        watchdog.stop();
        thread::sleep(Duration::from_millis(250));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
