//! Persistent response cache.
//!
//! One JSON file per entry, named by the SHA-256 of the cache key. Access
//! is serialized per file by a two-level lock (see `lock`), so several
//! threads and several processes may share one cache directory. Writes go
//! to a sibling temporary file that is renamed over the entry, so readers
//! never see a partially written entry.
//!
//! # Example
//!
//! ```ignore
//! use engine_webdriver::cache::{CacheConfig, CacheEntry, DiskCache, cache_key};
//!
//! let cache = DiskCache::temporary(CacheConfig::default())?;
//! let key = cache_key("GET", "https://example.com/");
//! cache.put(&key, &CacheEntry::new(&key, 200, vec![], b"hello".to_vec()))?;
//! assert!(cache.get(&key)?.is_some());
//! ```

// ============================================================================
// Submodules
// ============================================================================

mod entry;
mod lock;

// ============================================================================
// Re-exports
// ============================================================================

pub use entry::{CacheControl, CacheEntry, cache_key, is_cacheable_method};
pub use lock::RetryPolicy;

// ============================================================================
// Imports
// ============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, trace, warn};

use crate::driver::Settings;
use crate::error::{Error, Result};

use lock::{LockMode, PathLocks, lock_file};

// ============================================================================
// Constants
// ============================================================================

/// Length of a hex-encoded SHA-256 digest.
const ENTRY_NAME_LEN: usize = 64;

// ============================================================================
// CacheConfig
// ============================================================================

/// Limits and lock behavior of a [`DiskCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entry count above which the oldest entries are evicted (0 = unbounded).
    pub max_entries: usize,
    /// Largest body stored, in bytes.
    pub max_entry_size: usize,
    /// OS lock retry schedule.
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_entry_size: 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Settings> for CacheConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_entries: settings.cache_entries,
            max_entry_size: settings.cache_entry_size,
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// DiskCache
// ============================================================================

/// File-backed response cache.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    config: CacheConfig,
    locks: PathLocks,
    /// Entries known to this process; the directory is rescanned on eviction.
    entries: AtomicUsize,
    /// Keeps a temporary directory alive; removed on drop.
    _temp: Option<TempDir>,
}

impl DiskCache {
    /// Opens (and creates if needed) a persistent cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut cache = Self {
            dir,
            config,
            locks: PathLocks::default(),
            entries: AtomicUsize::new(0),
            _temp: None,
        };
        let existing = cache.entry_files()?.len();
        *cache.entries.get_mut() = existing;

        debug!(dir = %cache.dir.display(), entries = existing, "Disk cache opened");
        Ok(cache)
    }

    /// Creates a cache in a fresh temporary directory, removed on drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn temporary(config: CacheConfig) -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("webcache").tempdir()?;
        let mut cache = Self::open(temp.path(), config)?;
        cache._temp = Some(temp);
        Ok(cache)
    }

    /// Returns the cache directory.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the configured limits.
    #[inline]
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Returns the file an entry for `key` is stored in.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(Sha256::digest(key.as_bytes())))
    }
}

// ============================================================================
// DiskCache - Entry Operations
// ============================================================================

impl DiskCache {
    /// Loads the entry for `key`.
    ///
    /// Unreadable or corrupted entries are reported as misses.
    ///
    /// # Errors
    ///
    /// - [`Error::CacheLockTimeout`] if another process holds the entry too long
    /// - [`Error::Io`] on other file errors
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let _guard = self.locks.acquire(&path);

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        lock_file(&file, &path, LockMode::Shared, self.config.retry)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) if entry.key == key => {
                trace!(key, "Cache hit");
                Ok(Some(entry))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(key, error = %e, "Ignoring corrupted cache entry");
                Ok(None)
            }
        }
    }

    /// Stores `entry` under `key`, replacing any previous entry.
    ///
    /// Returns `false` when the body exceeds the size limit and nothing was
    /// written. Eviction triggered by the write never fails it.
    ///
    /// # Errors
    ///
    /// - [`Error::CacheLockTimeout`] if another process holds the entry too long
    /// - [`Error::Io`] / [`Error::Json`] if the entry cannot be written
    pub fn put(&self, key: &str, entry: &CacheEntry) -> Result<bool> {
        if entry.body.len() > self.config.max_entry_size {
            trace!(key, size = entry.body.len(), "Entry too large for cache");
            return Ok(false);
        }

        let encoded = serde_json::to_vec(entry)?;
        let replaced = {
            let path = self.path_for(key);
            let _guard = self.locks.acquire(&path);

            // Held until the new file is in place.
            let current = match OpenOptions::new().write(true).open(&path) {
                Ok(file) => {
                    lock_file(&file, &path, LockMode::Exclusive, self.config.retry)?;
                    Some(file)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            self.replace_file(&path, &encoded)?;
            current.is_some()
        };

        trace!(key, replaced, "Cache store");
        if !replaced {
            let entries = self.entries.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_entries > 0
                && entries > self.config.max_entries
                && let Err(e) = self.evict_excess()
            {
                warn!(error = %e, "Cache eviction failed");
            }
        }
        Ok(true)
    }

    /// Deletes the entry for `key`; a missing entry is not an error.
    ///
    /// # Errors
    ///
    /// - [`Error::CacheLockTimeout`] if another process holds the entry too long
    /// - [`Error::Io`] on other file errors
    pub fn remove(&self, key: &str) -> Result<()> {
        self.remove_path(&self.path_for(key))?;
        Ok(())
    }

    /// Rewrites the entry for `key` under an exclusive lock.
    ///
    /// Returns the updated entry, or `None` if there was nothing to update.
    ///
    /// # Errors
    ///
    /// - [`Error::CacheLockTimeout`] if another process holds the entry too long
    /// - [`Error::Io`] / [`Error::Json`] if the entry cannot be rewritten
    pub fn update<F>(&self, key: &str, apply: F) -> Result<Option<CacheEntry>>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let path = self.path_for(key);
        let _guard = self.locks.acquire(&path);

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        lock_file(&file, &path, LockMode::Exclusive, self.config.retry)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let Ok(mut entry) = serde_json::from_slice::<CacheEntry>(&raw) else {
            return Ok(None);
        };

        apply(&mut entry);

        let encoded = serde_json::to_vec(&entry)?;
        self.replace_file(&path, &encoded)?;
        drop(file);

        trace!(key, "Cache entry updated");
        Ok(Some(entry))
    }

    /// Removes every entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be listed or an entry
    /// cannot be removed.
    pub fn clear(&self) -> Result<usize> {
        let mut count = 0;
        for (path, _) in self.entry_files()? {
            if self.remove_path(&path)? {
                count += 1;
            }
        }
        self.entries.store(0, Ordering::SeqCst);
        debug!(count, "Disk cache cleared");
        Ok(count)
    }

    /// Returns the number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be listed.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entry_files()?.len())
    }

    /// Returns `true` if no entry is stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be listed.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// DiskCache - Internal
// ============================================================================

impl DiskCache {
    /// Writes `contents` to a sibling temporary file and renames it over `path`.
    fn replace_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_data()?;
        temp.persist(path).map_err(|e| Error::from(e.error))?;
        Ok(())
    }

    /// Returns `true` if this call removed the file.
    fn remove_path(&self, path: &Path) -> Result<bool> {
        let _guard = self.locks.acquire(path);

        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        lock_file(&file, path, LockMode::Exclusive, self.config.retry)?;

        match fs::remove_file(path) {
            Ok(()) => {
                let _ = self
                    .entries
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Lists entry files with their modification time.
    fn entry_files(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let is_entry = name
                .to_str()
                .is_some_and(|n| n.len() == ENTRY_NAME_LEN && n.bytes().all(|b| b.is_ascii_hexdigit()));
            if !is_entry {
                continue;
            }

            // Entries removed concurrently disappear between listing and stat.
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            if metadata.is_file() {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((dir_entry.path(), modified));
            }
        }
        Ok(files)
    }

    /// Trims the directory to the low-water mark, oldest entries first.
    ///
    /// Trimming below the limit keeps directory scans to one per
    /// `max_entries / 10` new entries.
    fn evict_excess(&self) -> Result<()> {
        let mut files = self.entry_files()?;
        self.entries.store(files.len(), Ordering::SeqCst);

        let max = self.config.max_entries;
        if files.len() <= max {
            return Ok(());
        }

        let low_water = max - max / 10;
        files.sort_by_key(|(_, modified)| *modified);
        let excess = files.len() - low_water;

        let mut evicted = 0;
        let mut failure = None;
        for (path, _) in files.into_iter().take(excess) {
            match self.remove_path(&path) {
                Ok(removed) => evicted += usize::from(removed),
                Err(e) => failure = Some(e),
            }
        }

        debug!(evicted, "Evicted oldest cache entries");
        failure.map_or(Ok(()), Err)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sample(key: &str, body: &[u8]) -> CacheEntry {
        CacheEntry::new(
            key,
            200,
            vec![("Content-Type".into(), "text/html".into())],
            body.to_vec(),
        )
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        let key = cache_key("GET", "https://a.test/");
        let entry = sample(&key, &[0, 159, 146, 150, b'x']);

        assert!(cache.put(&key, &entry).expect("put"));
        assert_eq!(cache.get(&key).expect("get"), Some(entry));
        assert_eq!(cache.len().expect("len"), 1);
    }

    #[test]
    fn test_remove_then_get_is_miss() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        let key = cache_key("GET", "https://a.test/gone");
        cache.put(&key, &sample(&key, b"x")).expect("put");

        cache.remove(&key).expect("remove");
        cache.remove(&key).expect("second remove is a no-op");
        assert_eq!(cache.get(&key).expect("get"), None);
    }

    #[test]
    fn test_update_rewrites_entry() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        let key = cache_key("GET", "https://a.test/etag");
        cache.put(&key, &sample(&key, b"long original body")).expect("put");

        let updated = cache
            .update(&key, |entry| entry.set_header("ETag", "\"v2\""))
            .expect("update")
            .expect("entry exists");

        assert_eq!(updated.etag(), Some("\"v2\""));
        assert_eq!(cache.get(&key).expect("get"), Some(updated));
        assert!(cache.update("missing", |_| {}).expect("update").is_none());
    }

    #[test]
    fn test_oversized_bodies_are_skipped() {
        let config = CacheConfig {
            max_entry_size: 4,
            ..CacheConfig::default()
        };
        let cache = DiskCache::temporary(config).expect("cache");
        assert!(!cache.put("k", &sample("k", b"too large")).expect("put"));
        assert_eq!(cache.get("k").expect("get"), None);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = DiskCache::temporary(config).expect("cache");
        for key in ["a", "b", "c"] {
            cache.put(key, &sample(key, b"x")).expect("put");
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(cache.len().expect("len"), 2);
        assert_eq!(cache.get("a").expect("get"), None);
        assert!(cache.get("c").expect("get").is_some());
    }

    #[test]
    fn test_writes_replace_whole_files() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        cache.put("k", &sample("k", b"a much longer first body")).expect("put");
        cache.put("k", &sample("k", b"short")).expect("put");
        cache
            .update("k", |entry| entry.set_header("ETag", "\"v3\""))
            .expect("update");

        let entry = cache.get("k").expect("get").expect("entry");
        assert_eq!(entry.body, b"short");
        assert_eq!(entry.etag(), Some("\"v3\""));

        // Nothing but the entry itself is left behind.
        let names: Vec<_> = fs::read_dir(cache.dir())
            .expect("list")
            .map(|e| e.expect("dir entry").file_name())
            .collect();
        assert_eq!(names, vec![cache.path_for("k").file_name().expect("name").to_owned()]);
    }

    #[test]
    fn test_interrupted_write_leaves_entry_intact() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        let entry = sample("k", b"complete");
        cache.put("k", &entry).expect("put");

        // A writer that died before renaming leaves only its temporary file.
        fs::write(cache.dir().join(".tmpAbC123"), b"{\"key\":\"k\",\"sta").expect("write");

        assert_eq!(cache.get("k").expect("get"), Some(entry));
        assert_eq!(cache.len().expect("len"), 1);
    }

    #[test]
    fn test_eviction_failure_does_not_fail_put() {
        let config = CacheConfig {
            max_entries: 1,
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
            ..CacheConfig::default()
        };
        let cache = DiskCache::temporary(config).expect("cache");
        cache.put("old", &sample("old", b"1")).expect("put");
        thread::sleep(Duration::from_millis(20));

        // Another process holding the oldest entry blocks its eviction.
        let held = File::open(cache.path_for("old")).expect("open");
        held.lock().expect("os lock");

        assert!(cache.put("new", &sample("new", b"2")).expect("put succeeds"));
        assert!(cache.get("new").expect("get").is_some());
        assert_eq!(cache.len().expect("len"), 2);

        held.unlock().expect("unlock");
        thread::sleep(Duration::from_millis(20));
        cache.put("newest", &sample("newest", b"3")).expect("put");
        assert_eq!(cache.len().expect("len"), 1);
        assert!(cache.get("newest").expect("get").is_some());
    }

    #[test]
    fn test_reopen_counts_existing_entries() {
        let dir = tempfile::tempdir().expect("dir");
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        {
            let cache = DiskCache::open(dir.path(), config).expect("cache");
            cache.put("a", &sample("a", b"1")).expect("put");
            thread::sleep(Duration::from_millis(20));
            cache.put("b", &sample("b", b"2")).expect("put");
        }

        thread::sleep(Duration::from_millis(20));
        let cache = DiskCache::open(dir.path(), config).expect("reopen");
        cache.put("c", &sample("c", b"3")).expect("put");
        assert_eq!(cache.len().expect("len"), 2);
        assert_eq!(cache.get("a").expect("get"), None);
    }

    #[test]
    fn test_clear_removes_only_entries() {
        let cache = DiskCache::temporary(CacheConfig::default()).expect("cache");
        fs::write(cache.dir().join("README"), "keep").expect("write");
        cache.put("a", &sample("a", b"1")).expect("put");
        cache.put("b", &sample("b", b"2")).expect("put");

        assert_eq!(cache.clear().expect("clear"), 2);
        assert!(cache.is_empty().expect("empty"));
        assert!(cache.dir().join("README").exists());
    }

    #[test]
    fn test_remove_under_concurrent_writers() {
        let cache = Arc::new(DiskCache::temporary(CacheConfig::default()).expect("cache"));

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..25 {
                        let key = format!("writer-{n}-{i}");
                        cache.put(&key, &sample(&key, b"payload")).expect("put");
                    }
                })
            })
            .collect();

        for _ in 0..25 {
            cache.put("victim", &sample("victim", b"v")).expect("put");
            cache.remove("victim").expect("remove");
            assert_eq!(cache.get("victim").expect("get"), None);
        }

        for writer in writers {
            writer.join().expect("writer thread");
        }
        assert_eq!(cache.len().expect("len"), 100);
    }
}
