//! Ad-host filtering.
//!
//! Accepts hosts-file lines (`0.0.0.0 ads.example.com`) and bare host
//! lines; `#` starts a comment. A host is blocked when it equals a listed
//! host or is a subdomain of one.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;

use rustc_hash::FxHashSet;
use tracing::debug;
use url::Url;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Hosts blocked even without a list file.
const BUILTIN_HOSTS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "googleadservices.com",
    "google-analytics.com",
    "googletagservices.com",
    "adnxs.com",
    "adsrvr.org",
    "advertising.com",
    "amazon-adsystem.com",
    "criteo.com",
    "moatads.com",
    "outbrain.com",
    "pubmatic.com",
    "rubiconproject.com",
    "scorecardresearch.com",
    "taboola.com",
];

/// Addresses that prefix host entries in hosts-file format.
const SINK_ADDRESSES: &[&str] = &["0.0.0.0", "127.0.0.1", "::", "::1"];

// ============================================================================
// AdHosts
// ============================================================================

/// A set of blocked hosts with suffix matching.
#[derive(Debug, Clone, Default)]
pub struct AdHosts {
    hosts: FxHashSet<String>,
}

impl AdHosts {
    /// Returns the built-in list.
    #[must_use]
    pub fn builtin() -> Self {
        let mut hosts = Self::default();
        hosts.extend(BUILTIN_HOSTS.iter().copied());
        hosts
    }

    /// Returns the built-in list extended with the hosts in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut hosts = Self::builtin();
        hosts.extend_from_str(&text);
        debug!(path = %path.display(), count = hosts.len(), "Ad hosts loaded");
        Ok(hosts)
    }

    /// Adds every host listed in hosts-file formatted `text`.
    pub fn extend_from_str(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(first) = fields.next() else {
                continue;
            };

            if SINK_ADDRESSES.contains(&first) {
                self.extend(fields);
            } else {
                self.extend(std::iter::once(first));
            }
        }
    }

    fn extend<'a>(&mut self, hosts: impl IntoIterator<Item = &'a str>) {
        for host in hosts {
            let host = host.trim_end_matches('.').to_ascii_lowercase();
            if !host.is_empty() && host != "localhost" {
                self.hosts.insert(host);
            }
        }
    }

    /// Returns `true` if `host` or one of its parent domains is listed.
    #[must_use]
    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = host.as_str();
        loop {
            if self.hosts.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    /// Returns `true` if the URL's host is blocked.
    #[must_use]
    pub fn blocks_url(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| self.is_blocked(h)))
            .unwrap_or(false)
    }

    /// Returns the number of listed hosts.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Returns `true` if nothing is listed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_matching() {
        let hosts = AdHosts::builtin();
        assert!(hosts.is_blocked("doubleclick.net"));
        assert!(hosts.is_blocked("stats.g.DoubleClick.net."));
        assert!(!hosts.is_blocked("notdoubleclick.net"));
        assert!(!hosts.is_blocked("example.com"));
    }

    #[test]
    fn test_hosts_file_format() {
        let mut hosts = AdHosts::default();
        hosts.extend_from_str(
            "# comment\n\
             127.0.0.1 localhost\n\
             0.0.0.0 ads.example.com tracker.example.org # trailing\n\
             banners.test\n",
        );

        assert_eq!(hosts.len(), 3);
        assert!(hosts.blocks_url("https://ads.example.com/x.js"));
        assert!(hosts.blocks_url("http://cdn.banners.test:8080/"));
        assert!(!hosts.blocks_url("http://localhost/"));
        assert!(!hosts.blocks_url("not a url"));
    }

    #[test]
    fn test_load_adds_to_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts");
        fs::write(&path, "0.0.0.0 extra.test\n").expect("write");

        let hosts = AdHosts::load(&path).expect("load");
        assert!(hosts.is_blocked("extra.test"));
        assert!(hosts.is_blocked("criteo.com"));
    }
}
