//! The shared navigation status.
//!
//! [`StatusCode`] is a single-writer state machine: only the readiness
//! monitor moves it between phases, everybody else reads it or blocks on
//! its transitions.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

// ============================================================================
// Phase
// ============================================================================

/// Navigation phase of one browser instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No navigation has been started yet.
    Idle,
    /// A navigation or user action is in progress.
    Loading,
    /// The last navigation settled with the given status.
    ///
    /// `0` means an action settled without any navigation starting.
    Settled(i32),
}

impl Phase {
    /// Returns the integer form: `-1` idle, `0` loading, otherwise the status.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Idle => -1,
            Self::Loading => 0,
            Self::Settled(code) => *code,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Loading => f.write_str("loading"),
            Self::Settled(code) => write!(f, "settled({code})"),
        }
    }
}

// ============================================================================
// StatusCode
// ============================================================================

/// Callback invoked after every phase change.
pub type StatusListener = Arc<dyn Fn(Phase) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Cell {
    phase: Phase,
    /// Number of transitions out of [`Phase::Loading`] so far.
    settles: u64,
    /// Code of the most recent of those transitions.
    last_settled: i32,
}

impl Cell {
    fn settled_since(&self, seen: u64) -> Option<i32> {
        if self.settles != seen {
            Some(self.last_settled)
        } else if self.phase != Phase::Loading {
            Some(self.phase.code())
        } else {
            None
        }
    }
}

/// Shared status cell with blocking waits on transitions.
pub struct StatusCode {
    cell: Mutex<Cell>,
    changed: Condvar,
    listeners: Mutex<Vec<StatusListener>>,
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCode")
            .field("phase", &self.cell.lock().phase)
            .finish_non_exhaustive()
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCode {
    /// Creates a status in the [`Phase::Idle`] phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(Cell {
                phase: Phase::Idle,
                settles: 0,
                last_settled: Phase::Idle.code(),
            }),
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.cell.lock().phase
    }

    /// Returns the current integer status.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i32 {
        self.phase().code()
    }

    /// Returns `true` while a navigation is in progress.
    #[inline]
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.phase() == Phase::Loading
    }

    /// Registers a listener called after every phase change.
    pub fn subscribe(&self, listener: StatusListener) {
        self.listeners.lock().push(listener);
    }

    /// Blocks until the status leaves [`Phase::Loading`] or the timeout elapses.
    ///
    /// A settle that happens while waiting is reported even if the status
    /// already went back to loading before this thread woke up.
    ///
    /// Returns the integer status, or `None` on timeout.
    pub fn wait_until_not_loading(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        let seen = cell.settles;
        loop {
            if let Some(code) = cell.settled_since(seen) {
                return Some(code);
            }
            if self.changed.wait_until(&mut cell, deadline).timed_out() {
                return cell.settled_since(seen);
            }
        }
    }

    /// Moves to `next`, waking waiters and listeners when the phase changed.
    pub(crate) fn transition(&self, next: Phase) {
        let previous = {
            let mut cell = self.cell.lock();
            let previous = cell.phase;
            cell.phase = next;
            if previous == Phase::Loading && next != Phase::Loading {
                cell.settles += 1;
                cell.last_settled = next.code();
            }
            previous
        };

        if previous == next {
            return;
        }

        trace!(from = %previous, to = %next, "Status transition");
        self.changed.notify_all();

        let listeners: Vec<StatusListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(next);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_codes() {
        assert_eq!(Phase::Idle.code(), -1);
        assert_eq!(Phase::Loading.code(), 0);
        assert_eq!(Phase::Settled(404).code(), 404);
    }

    #[test]
    fn test_wait_wakes_on_settle() {
        let status = Arc::new(StatusCode::new());
        status.transition(Phase::Loading);

        let writer = Arc::clone(&status);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.transition(Phase::Settled(200));
        });

        assert_eq!(status.wait_until_not_loading(Duration::from_secs(5)), Some(200));
        handle.join().expect("writer thread");
    }

    #[test]
    fn test_wait_times_out_while_loading() {
        let status = StatusCode::new();
        status.transition(Phase::Loading);
        assert_eq!(status.wait_until_not_loading(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_wait_reports_settle_followed_by_new_load() {
        let status = Arc::new(StatusCode::new());
        status.transition(Phase::Loading);

        let writer = Arc::clone(&status);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            // Settle and reload back to back, before the waiter can look.
            writer.transition(Phase::Settled(404));
            writer.transition(Phase::Loading);
        });

        assert_eq!(status.wait_until_not_loading(Duration::from_secs(5)), Some(404));
        handle.join().expect("writer thread");
        assert!(status.is_loading());
    }

    #[test]
    fn test_listeners_only_fire_on_change() {
        let status = StatusCode::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        status.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        status.transition(Phase::Loading);
        status.transition(Phase::Loading);
        status.transition(Phase::Settled(200));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
