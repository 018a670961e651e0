//! Cache entries and HTTP freshness rules.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// Constants
// ============================================================================

/// Statuses that may be stored without explicit freshness information.
const HEURISTIC_STATUSES: [u16; 8] = [200, 203, 204, 300, 301, 308, 404, 410];

/// Share of the `Last-Modified` age used as heuristic lifetime.
const HEURISTIC_FRACTION: i32 = 10;

// ============================================================================
// Cache Key
// ============================================================================

/// Builds the normalized cache key for a request.
///
/// The fragment never reaches the server, so it is not part of the key.
#[must_use]
pub fn cache_key(method: &str, url: &str) -> String {
    let without_fragment = url.split_once('#').map_or(url, |(base, _)| base);
    format!("{} {}", method.to_ascii_uppercase(), without_fragment)
}

/// Returns `true` for methods served through the cache.
#[inline]
#[must_use]
pub fn is_cacheable_method(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}

// ============================================================================
// CacheControl
// ============================================================================

/// The `Cache-Control` directives the cache honors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// Never store the response.
    pub no_store: bool,
    /// Always revalidate before use.
    pub no_cache: bool,
    /// Explicit lifetime in seconds.
    pub max_age: Option<i64>,
}

impl CacheControl {
    /// Parses a `Cache-Control` header value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut control = Self::default();
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = directive
                .split_once('=')
                .map_or((directive, None), |(name, arg)| (name.trim(), Some(arg.trim())));

            match name.to_ascii_lowercase().as_str() {
                "no-store" | "private" => control.no_store = true,
                "no-cache" | "must-revalidate" => control.no_cache = true,
                "max-age" | "s-maxage" => {
                    control.max_age = arg.and_then(|v| v.trim_matches('"').parse().ok());
                }
                _ => {}
            }
        }
        control
    }
}

// ============================================================================
// CacheEntry
// ============================================================================

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalized request key, see [`cache_key`].
    pub key: String,
    /// HTTP status.
    pub status: u16,
    /// Response headers in received order.
    pub headers: Vec<(String, String)>,
    /// Decoded response body.
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Vec<u8>,
    /// When the entry was stored or last revalidated.
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates an entry stored now.
    #[must_use]
    pub fn new(key: impl Into<String>, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Returns the first header value with the given name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every header with the given name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Returns the parsed `Cache-Control` header.
    #[must_use]
    pub fn cache_control(&self) -> CacheControl {
        self.header("cache-control")
            .map(CacheControl::parse)
            .unwrap_or_default()
    }

    /// Returns the `ETag` validator.
    #[inline]
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    /// Returns the `Last-Modified` validator.
    #[inline]
    #[must_use]
    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    /// Returns `true` if the response may be written to the cache.
    #[must_use]
    pub fn is_storable(&self) -> bool {
        let control = self.cache_control();
        if control.no_store {
            return false;
        }
        HEURISTIC_STATUSES.contains(&self.status)
            || control.max_age.is_some()
            || self.header("expires").is_some()
    }

    /// Returns the freshness lifetime, if one can be derived.
    ///
    /// Order: `max-age`, then `Expires` minus `Date`, then a tenth of the
    /// `Last-Modified` age.
    #[must_use]
    pub fn freshness_lifetime(&self) -> Option<Duration> {
        let control = self.cache_control();
        if let Some(max_age) = control.max_age {
            return Some(Duration::try_seconds(max_age).unwrap_or(Duration::MAX));
        }

        let date = self.header("date").and_then(parse_http_date).unwrap_or(self.stored_at);

        if let Some(expires) = self.header("expires") {
            // Invalid Expires values mean "already expired".
            return Some(parse_http_date(expires).map_or(Duration::zero(), |at| at - date));
        }

        self.last_modified()
            .and_then(parse_http_date)
            .map(|modified| (date - modified) / HEURISTIC_FRACTION)
    }

    /// Returns `true` if the entry can be served without revalidation.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.cache_control().no_cache {
            return false;
        }
        self.freshness_lifetime()
            .is_some_and(|lifetime| now - self.stored_at < lifetime)
    }

    /// Returns `true` if a stale entry carries a validator.
    #[must_use]
    pub fn can_revalidate(&self) -> bool {
        self.etag().is_some() || self.last_modified().is_some()
    }

    /// Merges the headers of a `304 Not Modified` response and restarts the
    /// freshness clock.
    pub fn refresh(&mut self, headers: &[(String, String)], now: DateTime<Utc>) {
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            self.set_header(name, value.clone());
        }
        self.stored_at = now;
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn encode_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(headers: &[(&str, &str)]) -> CacheEntry {
        CacheEntry::new(
            "GET https://a.test/",
            200,
            headers
                .iter()
                .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
                .collect(),
            b"body".to_vec(),
        )
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        assert_eq!(cache_key("get", "https://a.test/x#top"), "GET https://a.test/x");
        assert!(is_cacheable_method("HEAD"));
        assert!(!is_cacheable_method("POST"));
    }

    #[test]
    fn test_cache_control_parsing() {
        let control = CacheControl::parse("public, max-age=60, no-cache");
        assert_eq!(control.max_age, Some(60));
        assert!(control.no_cache);
        assert!(!control.no_store);
        assert!(CacheControl::parse("no-store").no_store);
    }

    #[test]
    fn test_max_age_freshness() {
        let e = entry(&[("Cache-Control", "max-age=60")]);
        assert!(e.is_fresh(e.stored_at + Duration::seconds(30)));
        assert!(!e.is_fresh(e.stored_at + Duration::seconds(61)));
    }

    #[test]
    fn test_heuristic_freshness_from_last_modified() {
        let e = entry(&[
            ("Date", "Wed, 21 Oct 2015 07:28:00 GMT"),
            ("Last-Modified", "Wed, 11 Oct 2015 07:28:00 GMT"),
        ]);
        assert_eq!(e.freshness_lifetime(), Some(Duration::days(1)));
        assert!(e.can_revalidate());
    }

    #[test]
    fn test_invalid_expires_is_stale() {
        let e = entry(&[("Expires", "0")]);
        assert!(!e.is_fresh(e.stored_at));
    }

    #[test]
    fn test_no_store_is_not_storable() {
        assert!(!entry(&[("Cache-Control", "no-store")]).is_storable());
        assert!(entry(&[]).is_storable());
    }

    #[test]
    fn test_refresh_merges_headers() {
        let mut e = entry(&[("ETag", "\"v1\""), ("Content-Length", "4")]);
        let later = e.stored_at + Duration::seconds(10);
        e.refresh(
            &[
                ("etag".to_string(), "\"v2\"".to_string()),
                ("Content-Length".to_string(), "0".to_string()),
            ],
            later,
        );
        assert_eq!(e.etag(), Some("\"v2\""));
        assert_eq!(e.header("content-length"), Some("4"));
        assert_eq!(e.stored_at, later);
    }

    #[test]
    fn test_body_serialized_as_base64() {
        let e = entry(&[]);
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["body"], "Ym9keQ==");
        let back: CacheEntry = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, e);
    }
}
