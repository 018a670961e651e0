//! Two-level locking for cache files.
//!
//! Threads of one process serialize on [`PathLocks`] first, so the same
//! entry file is never opened twice concurrently inside a process. The OS
//! advisory lock taken afterwards only has to arbitrate between processes
//! sharing a cache directory.

// ============================================================================
// Imports
// ============================================================================

use std::fs::{File, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// PathLocks
// ============================================================================

/// In-process table of entry files currently in use.
#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    held: Mutex<FxHashSet<PathBuf>>,
    released: Condvar,
}

impl PathLocks {
    /// Blocks until no other thread of this process holds `path`.
    pub(crate) fn acquire(&self, path: &Path) -> PathGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(path) {
            self.released.wait(&mut held);
        }
        held.insert(path.to_path_buf());

        PathGuard {
            locks: self,
            path: path.to_path_buf(),
        }
    }

    #[cfg(test)]
    fn is_held(&self, path: &Path) -> bool {
        self.held.lock().contains(path)
    }
}

/// Releases a [`PathLocks`] entry on drop.
#[derive(Debug)]
pub(crate) struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.path);
        self.locks.released.notify_all();
    }
}

// ============================================================================
// OS Advisory Lock
// ============================================================================

/// Kind of OS file lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    /// Readers.
    Shared,
    /// Writers.
    Exclusive,
}

/// Retry schedule for the OS lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            delay: Duration::from_millis(100),
        }
    }
}

/// Takes an OS advisory lock on `file`, retrying on contention.
///
/// The lock is released when `file` is closed.
///
/// # Errors
///
/// - [`Error::CacheLockTimeout`] if the lock is still contended after every attempt
/// - [`Error::Io`] if the platform rejects the lock request
pub(crate) fn lock_file(file: &File, path: &Path, mode: LockMode, retry: RetryPolicy) -> Result<()> {
    let attempts = retry.attempts.max(1);

    for attempt in 1..=attempts {
        let result = match mode {
            LockMode::Shared => file.try_lock_shared(),
            LockMode::Exclusive => file.try_lock(),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(TryLockError::WouldBlock) => {
                trace!(path = %path.display(), attempt, ?mode, "Cache file contended");
                if attempt < attempts {
                    thread::sleep(retry.delay);
                }
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }
    }

    Err(Error::cache_lock_timeout(path, attempts))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::OpenOptions;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_path_guard_releases_on_drop() {
        let locks = PathLocks::default();
        let path = Path::new("/tmp/entry");
        {
            let _guard = locks.acquire(path);
            assert!(locks.is_held(path));
        }
        assert!(!locks.is_held(path));
    }

    #[test]
    fn test_second_thread_waits_for_path() {
        let locks = Arc::new(PathLocks::default());
        let entered = Arc::new(AtomicBool::new(false));
        let guard = locks.acquire(Path::new("/tmp/shared"));

        let waiter = {
            let locks = Arc::clone(&locks);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = locks.acquire(Path::new("/tmp/shared"));
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().expect("waiter thread");
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exclusive_lock_times_out_when_contended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("entry");
        let holder = File::create(&path).expect("create");
        lock_file(&holder, &path, LockMode::Exclusive, RetryPolicy::default()).expect("first lock");

        let contender = OpenOptions::new().read(true).open(&path).expect("open");
        let retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        };
        let err = lock_file(&contender, &path, LockMode::Shared, retry).expect_err("contended");
        assert!(matches!(err, Error::CacheLockTimeout { attempts: 3, .. }));
    }
}
