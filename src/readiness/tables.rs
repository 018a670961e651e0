//! Per-instance tracking tables.
//!
//! All keys are canonical URLs (see [`canonicalize`](super::canonicalize)).
//! The tables are owned by the readiness monitor and mutated only under
//! its lock.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::identifiers::FrameId;

// ============================================================================
// Constants
// ============================================================================

/// Number of started document URLs remembered for the status fallback scan.
const RECENT_LIMIT: usize = 64;

/// Guard against redirect cycles when following the redirect map.
const MAX_REDIRECT_HOPS: usize = 32;

// ============================================================================
// ResourceTable
// ============================================================================

/// In-flight resources: `(frame, url) -> start time`.
#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: FxHashMap<(FrameId, String), Instant>,
}

impl ResourceTable {
    /// Records a resource load start.
    pub fn insert(&mut self, frame: FrameId, url: String, started: Instant) {
        self.entries.insert((frame, url), started);
    }

    /// Removes a resource; returns `true` if it was tracked.
    pub fn remove(&mut self, frame: FrameId, url: &str) -> bool {
        self.entries.remove(&(frame, url.to_string())).is_some()
    }

    /// Drops every entry started more than `timeout` before `now`.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_older_than(&mut self, timeout: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, started| now.saturating_duration_since(*started) <= timeout);
        before - self.entries.len()
    }

    /// Returns `true` when no resource is in flight.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of in-flight resources.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// RedirectMap
// ============================================================================

/// Redirect bookkeeping: `final url -> original url`.
#[derive(Debug, Default)]
pub struct RedirectMap {
    originals: FxHashMap<String, String>,
}

impl RedirectMap {
    /// Registers that `original` redirected to `redirected`.
    pub fn insert(&mut self, redirected: String, original: String) {
        if redirected != original {
            self.originals.insert(redirected, original);
        }
    }

    /// Returns the URL that redirected to `url`, if any.
    #[must_use]
    pub fn original_of(&self, url: &str) -> Option<&str> {
        self.originals.get(url).map(String::as_str)
    }

    /// Follows the redirect chain starting at `url` to its final target.
    #[must_use]
    pub fn final_of(&self, url: &str) -> String {
        let mut current = url.to_string();
        for _ in 0..MAX_REDIRECT_HOPS {
            let next = self
                .originals
                .iter()
                .find(|(_, original)| **original == current)
                .map(|(redirected, _)| redirected.clone());
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.originals.clear();
    }

    /// Returns `true` when no redirect is recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.originals.is_empty()
    }
}

// ============================================================================
// PrimaryDocumentSet
// ============================================================================

/// URLs that represent navigable documents, with their main-frame flag.
#[derive(Debug, Default)]
pub struct PrimaryDocumentSet {
    documents: FxHashMap<String, bool>,
}

impl PrimaryDocumentSet {
    /// Marks `url` as a document; a main-frame mark is never downgraded.
    pub fn mark(&mut self, url: String, main_frame: bool) {
        let entry = self.documents.entry(url).or_insert(main_frame);
        *entry |= main_frame;
    }

    /// Returns `Some(is_main_frame)` for documents, `None` for subresources.
    #[must_use]
    pub fn get(&self, url: &str) -> Option<bool> {
        self.documents.get(url).copied()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.documents.clear();
    }

    /// Returns `true` when no document is recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

// ============================================================================
// DiscardedSet
// ============================================================================

/// URLs whose bodies were deliberately dropped.
#[derive(Debug, Default)]
pub struct DiscardedSet {
    urls: FxHashSet<String>,
}

impl DiscardedSet {
    /// Records a discarded URL.
    pub fn insert(&mut self, url: String) {
        self.urls.insert(url);
    }

    /// Returns `true` if the URL was discarded.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.urls.clear();
    }

    /// Returns `true` when nothing was discarded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

// ============================================================================
// StatusTable
// ============================================================================

/// Last HTTP status per URL plus the recency list used by the lookup fallback.
#[derive(Debug, Default)]
pub struct StatusTable {
    codes: FxHashMap<String, i32>,
    recent: VecDeque<String>,
}

impl StatusTable {
    /// Records the HTTP status of a completed response.
    pub fn record(&mut self, url: String, code: i32) {
        self.codes.insert(url, code);
    }

    /// Notes that a document load started for `url`.
    pub fn started(&mut self, url: String) {
        self.recent.retain(|existing| *existing != url);
        self.recent.push_back(url);
        if self.recent.len() > RECENT_LIMIT {
            self.recent.pop_front();
        }
    }

    /// Returns the exact status recorded for `url`.
    #[must_use]
    pub fn exact(&self, url: &str) -> Option<i32> {
        self.codes.get(url).copied()
    }

    /// Scans recently started URLs, most recent first, for a recorded status.
    #[must_use]
    pub fn most_recent(&self) -> Option<i32> {
        self.recent
            .iter()
            .rev()
            .find_map(|url| self.codes.get(url).copied())
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.codes.clear();
        self.recent.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
