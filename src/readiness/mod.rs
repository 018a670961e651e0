//! Readiness detection.
//!
//! Infers "navigation finished" and "page is idle" from the stream of
//! [`LoadEvent`]s the engine emits, including script-driven requests that
//! have no explicit completion signal.
//!
//! # State Machine
//!
//! ```text
//!            navigation started / redirected / document available
//!   IDLE(-1) ─────────────────────────────────────────────► LOADING(0)
//!   SETTLED  ─────────────────────────────────────────────►     │
//!      ▲                                                        │ page finished /
//!      │  resource table empty for 3 polls                      │ stopped / failed
//!      └──────────────── idle detector ◄────────────────────────┘
//! ```
//!
//! Every map in this module is keyed by [`canonicalize`]d URLs.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `canonical` | URL canonicalization |
//! | `event` | Engine load events |
//! | `idle` | Background idle detector |
//! | `status` | The shared [`StatusCode`] |
//! | `tables` | Resource, redirect, document and discard tables |

// ============================================================================
// Submodules
// ============================================================================

mod canonical;
mod event;
mod idle;
mod status;
mod tables;

// ============================================================================
// Re-exports
// ============================================================================

pub use canonical::{canonicalize, is_http};
pub use event::LoadEvent;
pub use status::{Phase, StatusCode, StatusListener};
pub use tables::{DiscardedSet, PrimaryDocumentSet, RedirectMap, ResourceTable, StatusTable};

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::identifiers::FrameId;

use idle::IdleSignal;

// ============================================================================
// Constants
// ============================================================================

/// Status reported when no HTTP status was recorded for a URL.
pub const UNKNOWN_STATUS: i32 = 499;

/// Status adopted when a navigation started but produced no explicit code.
const DEFAULT_LOADED_STATUS: i32 = 200;

// ============================================================================
// ReadinessConfig
// ============================================================================

/// Timing knobs of the idle detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Target quiet period after which the page is considered idle.
    pub ajax_wait: Duration,
    /// Resources older than this are assumed abandoned.
    pub ajax_resource_timeout: Duration,
    /// Upper bound of one settle round.
    pub max_wait: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            ajax_wait: Duration::from_millis(150),
            ajax_resource_timeout: Duration::from_millis(2000),
            max_wait: Duration::from_secs(15),
        }
    }
}

impl ReadinessConfig {
    /// Interval between two resource-table polls.
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.ajax_wait / 3
    }
}

impl From<&Settings> for ReadinessConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            ajax_wait: Duration::from_millis(settings.ajax_wait_ms),
            ajax_resource_timeout: Duration::from_millis(settings.ajax_resource_timeout_ms),
            max_wait: Duration::from_millis(settings.max_ajax_wait_ms),
        }
    }
}

// ============================================================================
// Tracker State
// ============================================================================

/// Result of one idle poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    Empty,
    Busy,
    Stale,
}

#[derive(Debug, Default)]
struct TrackerState {
    resources: ResourceTable,
    redirects: RedirectMap,
    documents: PrimaryDocumentSet,
    discarded: DiscardedSet,
    statuses: StatusTable,
    /// Status of the last finished navigation (main frame wins).
    done_code: Option<i32>,
    /// Whether any navigation started since the last reset.
    started: bool,
    /// A main-frame navigation started and has not finished yet.
    navigating: bool,
    /// Bumped on every reset and navigation start; stale settle rounds compare it.
    generation: u64,
}

impl TrackerState {
    fn remove_resource(&mut self, frame: FrameId, key: &str) {
        self.resources.remove(frame, key);
        if let Some(original) = self.redirects.original_of(key).map(str::to_owned) {
            self.resources.remove(frame, &original);
        }
    }

    fn lookup(&self, key: &str) -> Option<i32> {
        let final_url = self.redirects.final_of(key);
        self.statuses
            .exact(&final_url)
            .or_else(|| self.statuses.exact(key))
            .or_else(|| self.statuses.most_recent())
    }
}

// ============================================================================
// ReadinessMonitor
// ============================================================================

/// Per-instance readiness monitor.
///
/// Cheap to clone; all clones share the same state and idle detector.
#[derive(Clone)]
pub struct ReadinessMonitor {
    inner: Arc<MonitorInner>,
}

pub(crate) struct MonitorInner {
    status: Arc<StatusCode>,
    state: Mutex<TrackerState>,
    signal: Arc<IdleSignal>,
    config: ReadinessConfig,
}

impl fmt::Debug for ReadinessMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessMonitor")
            .field("status", &self.inner.status.phase())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ReadinessMonitor {
    /// Creates a monitor and starts its idle detector thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the detector thread cannot be spawned.
    pub fn new(config: ReadinessConfig) -> Result<Self> {
        let signal = Arc::new(IdleSignal::default());
        let inner = Arc::new(MonitorInner {
            status: Arc::new(StatusCode::new()),
            state: Mutex::new(TrackerState::default()),
            signal: Arc::clone(&signal),
            config,
        });

        idle::spawn(Arc::downgrade(&inner), signal, config)?;
        debug!(?config, "Readiness monitor started");

        Ok(Self { inner })
    }

    /// Returns the shared status cell.
    #[inline]
    #[must_use]
    pub fn status(&self) -> &Arc<StatusCode> {
        &self.inner.status
    }

    /// Returns the publicly observable status code.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> i32 {
        self.inner.status.get()
    }

    /// Returns the detector configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> ReadinessConfig {
        self.inner.config
    }

    /// Consumes one engine event.
    pub fn handle(&self, event: LoadEvent) {
        trace!(?event, "Load event");
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        match event {
            LoadEvent::NavigationStarted {
                frame,
                url,
                main_frame,
            }
            | LoadEvent::Redirected {
                frame,
                url,
                main_frame,
            }
            | LoadEvent::DocumentAvailable {
                frame,
                url,
                main_frame,
            } => {
                let key = canonicalize(&url);
                if is_http(&url) {
                    state.resources.insert(frame, key.clone(), now);
                }
                state.documents.mark(key.clone(), main_frame);
                state.statuses.started(key);
                state.started = true;
                if main_frame {
                    state.done_code = None;
                    state.navigating = true;
                }
                state.generation += 1;
                self.inner.status.transition(Phase::Loading);
            }

            LoadEvent::ResourceStarted { frame, url } => {
                if is_http(&url) {
                    state.resources.insert(frame, canonicalize(&url), now);
                }
            }

            LoadEvent::ResourceFinished { frame, url } | LoadEvent::ResourceFailed { frame, url } => {
                state.remove_resource(frame, &canonicalize(&url));
            }

            LoadEvent::PageFinished {
                frame,
                url,
                main_frame,
            }
            | LoadEvent::LoadStopped {
                frame,
                url,
                main_frame,
            } => {
                let key = canonicalize(&url);
                state.remove_resource(frame, &key);
                let code = state.lookup(&key);
                Self::adopt_code(&mut state, code, main_frame);
                drop(state);
                self.inner.signal.arm();
            }

            LoadEvent::LoadFailed {
                frame,
                url,
                main_frame,
            } => {
                let key = canonicalize(&url);
                state.remove_resource(frame, &key);
                let code = state.lookup(&key).or(Some(UNKNOWN_STATUS));
                Self::adopt_code(&mut state, code, main_frame);
                drop(state);
                self.inner.signal.arm();
            }
        }
    }

    /// Main frame always wins; other frames only fill an empty slot.
    fn adopt_code(state: &mut TrackerState, code: Option<i32>, main_frame: bool) {
        if main_frame {
            state.navigating = false;
            if code.is_some() {
                state.done_code = code;
            }
        } else if state.done_code.is_none() {
            state.done_code = code;
        }
    }

    /// Clears all tables and forces the status to loading.
    ///
    /// Called before every user-initiated action so completion signals from a
    /// previous action cannot be misread. Idempotent.
    pub fn reset_status_code(&self) {
        let mut state = self.inner.state.lock();
        state.resources.clear();
        state.redirects.clear();
        state.documents.clear();
        state.discarded.clear();
        state.statuses.clear();
        state.done_code = None;
        state.started = false;
        state.navigating = false;
        state.generation += 1;
        self.inner.status.transition(Phase::Loading);
        trace!(generation = state.generation, "Status reset");
    }

    /// Starts a settle round without waiting for a page-finished event.
    ///
    /// Used after actions that may or may not navigate; if nothing starts the
    /// status settles to `0`.
    pub fn settle_after_action(&self) {
        self.inner.signal.arm();
    }

    /// Blocks until the status leaves the loading phase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the page does not settle in time.
    pub fn wait_ready(&self, timeout: Duration) -> Result<i32> {
        self.inner
            .status
            .wait_until_not_loading(timeout)
            .ok_or_else(|| Error::timeout("page load", timeout.as_millis() as u64))
    }

    /// Records the HTTP status a response for `url` completed with.
    pub fn record_status(&self, url: &str, code: i32) {
        self.inner
            .state
            .lock()
            .statuses
            .record(canonicalize(url), code);
    }

    /// Registers that `original` was redirected to `redirected`.
    ///
    /// A redirected primary document stays a primary document.
    pub fn record_redirect(&self, redirected: &str, original: &str) {
        let redirected = canonicalize(redirected);
        let original = canonicalize(original);
        let mut state = self.inner.state.lock();
        if let Some(main_frame) = state.documents.get(&original) {
            state.documents.mark(redirected.clone(), main_frame);
        }
        trace!(%redirected, %original, "Redirect recorded");
        state.redirects.insert(redirected, original);
    }

    /// Resolves the status for `url`, following redirects.
    ///
    /// Falls back to the most recently started document with a recorded
    /// status, then to [`UNKNOWN_STATUS`].
    #[must_use]
    pub fn status_for(&self, url: &str) -> i32 {
        self.inner
            .state
            .lock()
            .lookup(&canonicalize(url))
            .unwrap_or(UNKNOWN_STATUS)
    }

    /// Returns `Some(is_main_frame)` if `url` is a primary document.
    #[must_use]
    pub fn primary_document(&self, url: &str) -> Option<bool> {
        self.inner.state.lock().documents.get(&canonicalize(url))
    }

    /// Records a URL whose body was dropped.
    pub fn mark_discarded(&self, url: &str) {
        self.inner
            .state
            .lock()
            .discarded
            .insert(canonicalize(url));
    }

    /// Returns `true` if the URL's body was dropped earlier.
    #[must_use]
    pub fn is_discarded(&self, url: &str) -> bool {
        self.inner
            .state
            .lock()
            .discarded
            .contains(&canonicalize(url))
    }

    /// Returns the number of in-flight resources.
    #[must_use]
    pub fn pending_resources(&self) -> usize {
        self.inner.state.lock().resources.len()
    }

    /// Returns `true` when every tracking table is empty.
    #[must_use]
    pub fn tables_empty(&self) -> bool {
        let state = self.inner.state.lock();
        state.resources.is_empty()
            && state.redirects.is_empty()
            && state.documents.is_empty()
            && state.discarded.is_empty()
    }
}

// ============================================================================
// MonitorInner - Idle Detector Hooks
// ============================================================================

impl MonitorInner {
    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub(crate) fn poll_idle(&self, generation: u64) -> Poll {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Poll::Stale;
        }

        let evicted = state
            .resources
            .evict_older_than(self.config.ajax_resource_timeout, Instant::now());
        if evicted > 0 {
            debug!(evicted, "Evicted stale resources");
        }

        if state.resources.is_empty() && !state.navigating {
            Poll::Empty
        } else {
            Poll::Busy
        }
    }

    pub(crate) fn finalize(&self, generation: u64) {
        let state = self.state.lock();
        if state.generation != generation {
            return;
        }

        let code = match state.done_code {
            Some(code) if code > 0 => code,
            _ if state.started => DEFAULT_LOADED_STATUS,
            _ => 0,
        };

        debug!(code, "Navigation settled");
        self.status.transition(Phase::Settled(code));
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
