//! Per-instance socket lock.
//!
//! Root calls from one process to its peer are serialized through the
//! instance's [`SocketLock`]. Once the controller tears an instance down the
//! lock is expired and every later call fails fast.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::InstanceId;

// ============================================================================
// SocketLock
// ============================================================================

/// Serializes root calls on an instance's primary channel.
#[derive(Debug)]
pub struct SocketLock {
    instance: InstanceId,
    gate: Mutex<()>,
    expired: AtomicBool,
}

/// Held for the duration of one root call.
#[derive(Debug)]
pub struct SocketGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl SocketLock {
    /// Creates a lock for an instance.
    #[must_use]
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            gate: Mutex::new(()),
            expired: AtomicBool::new(false),
        }
    }

    /// Returns the owning instance.
    #[inline]
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Waits for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpiredLock`] if the lock is expired before or
    /// while waiting.
    pub async fn acquire(&self) -> Result<SocketGuard<'_>> {
        self.check()?;
        let guard = self.gate.lock().await;
        self.check()?;
        Ok(SocketGuard { _guard: guard })
    }

    /// Fails if the lock is expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpiredLock`] once [`expire`](Self::expire) ran.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::expired_lock(self.instance));
        }
        Ok(())
    }

    /// Marks the lock expired. Idempotent.
    pub fn expire(&self) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            debug!(instance = %self.instance, "Socket lock expired");
        }
    }

    /// Returns `true` once the instance was torn down.
    #[inline]
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
