//! Background idle detector.
//!
//! Once armed (a page finished, or an action wants to settle) the detector
//! polls the resource table until it stays empty for enough consecutive
//! polls, or until the maximum wait elapses, and then finalizes the status.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{MonitorInner, Poll, ReadinessConfig};

// ============================================================================
// Constants
// ============================================================================

/// Consecutive empty polls required when the poll interval is non-zero.
const SETTLE_POLLS: u32 = 3;

/// Sleep used instead of a zero interval so a busy table is not spun on.
const MIN_SLEEP: Duration = Duration::from_millis(1);

// ============================================================================
// IdleSignal
// ============================================================================

#[derive(Debug, Default)]
struct SignalState {
    armed: bool,
    shutdown: bool,
}

/// Outcome of an interruptible sleep.
#[derive(Debug, PartialEq, Eq)]
enum Wake {
    Elapsed,
    Rearmed,
    Shutdown,
}

/// Wakeup channel between the monitor and the detector thread.
#[derive(Debug, Default)]
pub(crate) struct IdleSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl IdleSignal {
    /// Requests a new settle round.
    pub(crate) fn arm(&self) {
        self.state.lock().armed = true;
        self.cond.notify_all();
    }

    /// Stops the detector thread.
    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Blocks until armed; returns `false` on shutdown.
    fn wait_armed(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.armed {
                state.armed = false;
                return true;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Sleeps for `duration` unless re-armed or shut down first.
    fn sleep(&self, duration: Duration) -> Wake {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Wake::Shutdown;
            }
            if state.armed {
                return Wake::Rearmed;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Wake::Elapsed;
            }
        }
    }
}

// ============================================================================
// IdleDetector
// ============================================================================

/// Spawns the detector thread for one monitor.
pub(crate) fn spawn(
    monitor: Weak<MonitorInner>,
    signal: Arc<IdleSignal>,
    config: ReadinessConfig,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("idle-detector".into())
        .spawn(move || run(&monitor, &signal, &config))
}

fn run(monitor: &Weak<MonitorInner>, signal: &IdleSignal, config: &ReadinessConfig) {
    debug!("Idle detector started");

    while signal.wait_armed() {
        if !settle_round(monitor, signal, config) {
            break;
        }
    }

    debug!("Idle detector stopped");
}

/// Runs one settle round; returns `false` when the detector must exit.
fn settle_round(monitor: &Weak<MonitorInner>, signal: &IdleSignal, config: &ReadinessConfig) -> bool {
    let Some(generation) = monitor.upgrade().map(|inner| inner.generation()) else {
        return false;
    };

    let interval = config.poll_interval();
    let needed = if interval.is_zero() { 1 } else { SETTLE_POLLS };
    let started = Instant::now();
    let mut empty_polls = 0;

    loop {
        let Some(inner) = monitor.upgrade() else {
            return false;
        };

        match inner.poll_idle(generation) {
            Poll::Stale => {
                trace!(generation, "Settle round superseded");
                return true;
            }
            Poll::Empty => empty_polls += 1,
            Poll::Busy => empty_polls = 0,
        }

        let elapsed = started.elapsed();
        if empty_polls >= needed {
            inner.finalize(generation);
            return true;
        }
        if elapsed >= config.max_wait {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Resources still pending at maximum wait, finalizing status"
            );
            inner.finalize(generation);
            return true;
        }
        drop(inner);

        match signal.sleep(interval.max(MIN_SLEEP)) {
            Wake::Elapsed => {}
            Wake::Rearmed => return true,
            Wake::Shutdown => return false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
