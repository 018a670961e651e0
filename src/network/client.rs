//! Pooled HTTP clients.
//!
//! Two blocking clients share one cookie jar, proxy and pool settings: the
//! plain client for uncacheable requests, and the caching client which
//! consults the [`DiskCache`] and revalidates stale entries.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use reqwest::blocking::Client;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::Method;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, DiskCache, cache_key};
use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::readiness::ReadinessMonitor;

use super::EngineRequest;

// ============================================================================
// Constants
// ============================================================================

/// Redirect hops followed before the request fails.
const MAX_REDIRECTS: usize = 10;

// ============================================================================
// RawResponse
// ============================================================================

/// A decoded response before the transform pipeline.
#[derive(Debug, Clone)]
pub(crate) struct RawResponse {
    pub(crate) url: String,
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) from_cache: bool,
}

impl RawResponse {
    fn from_entry(url: &str, entry: CacheEntry) -> Self {
        Self {
            url: url.to_string(),
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
            from_cache: true,
        }
    }
}

// ============================================================================
// ConnectionLimiter
// ============================================================================

/// Caps the requests in flight, in total and per destination.
///
/// A destination is the `host:port` of the request URL.
#[derive(Debug)]
pub(crate) struct ConnectionLimiter {
    total_limit: usize,
    route_limit: usize,
    state: Mutex<LimiterState>,
    freed: Condvar,
}

#[derive(Debug, Default)]
struct LimiterState {
    total: usize,
    routes: FxHashMap<String, usize>,
}

impl LimiterState {
    fn in_flight(&self, route: &str) -> usize {
        self.routes.get(route).copied().unwrap_or(0)
    }
}

impl ConnectionLimiter {
    /// A limit of `0` disables that cap.
    pub(crate) fn new(total_limit: usize, route_limit: usize) -> Self {
        Self {
            total_limit,
            route_limit,
            state: Mutex::new(LimiterState::default()),
            freed: Condvar::new(),
        }
    }

    /// Blocks until both the total and the destination of `url` have a free slot.
    pub(crate) fn acquire(&self, url: &str) -> ConnectionPermit<'_> {
        let route = destination(url);
        let mut state = self.state.lock();
        while (self.total_limit > 0 && state.total >= self.total_limit)
            || (self.route_limit > 0 && state.in_flight(&route) >= self.route_limit)
        {
            trace!(%route, "Waiting for a connection slot");
            self.freed.wait(&mut state);
        }
        state.total += 1;
        *state.routes.entry(route.clone()).or_insert(0) += 1;
        ConnectionPermit {
            limiter: self,
            route,
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.state.lock().total
    }

    #[cfg(test)]
    fn active_for(&self, url: &str) -> usize {
        self.state.lock().in_flight(&destination(url))
    }
}

/// Returns its slots to the limiter on drop.
pub(crate) struct ConnectionPermit<'a> {
    limiter: &'a ConnectionLimiter,
    route: String,
}

impl Drop for ConnectionPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.state.lock();
        state.total -= 1;
        if let Some(count) = state.routes.get_mut(&self.route) {
            *count -= 1;
            if *count == 0 {
                state.routes.remove(&self.route);
            }
        }
        drop(state);
        // Waiters block on different routes.
        self.limiter.freed.notify_all();
    }
}

/// `host:port` of `url`, or the URL itself when it cannot be parsed.
fn destination(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let host = parsed.host_str()?.to_ascii_lowercase();
            let port = parsed.port_or_known_default()?;
            Some(format!("{host}:{port}"))
        })
        .unwrap_or_else(|| url.to_string())
}

// ============================================================================
// HttpClients
// ============================================================================

/// The plain and caching clients plus shared request policy.
pub(crate) struct HttpClients {
    plain: Client,
    caching: Option<(Client, DiskCache)>,
    header_template: HeaderMap,
    limiter: ConnectionLimiter,
}

impl HttpClients {
    /// Builds both clients from `settings`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the proxy or header template is invalid
    /// - [`Error::Http`] if the TLS backend cannot be initialized
    pub(crate) fn build(
        settings: &Settings,
        monitor: &ReadinessMonitor,
        jar: Arc<Jar>,
        cache: Option<DiskCache>,
    ) -> Result<Self> {
        let plain = build_client(settings, monitor, Arc::clone(&jar))?;
        let caching = match cache {
            Some(cache) => Some((build_client(settings, monitor, jar)?, cache)),
            None => None,
        };

        Ok(Self {
            plain,
            caching,
            header_template: header_map(&settings.request_headers)?,
            limiter: ConnectionLimiter::new(
                settings.max_connections,
                settings.max_route_connections,
            ),
        })
    }

    /// Returns the disk cache, if caching is enabled.
    pub(crate) fn cache(&self) -> Option<&DiskCache> {
        self.caching.as_ref().map(|(_, cache)| cache)
    }

    /// Executes `request` through the appropriate client.
    pub(crate) fn fetch(&self, request: &EngineRequest) -> Result<RawResponse> {
        match &self.caching {
            Some((client, cache)) if request.is_cacheable() => {
                self.fetch_cached(client, cache, request)
            }
            _ => self.send(&self.plain, request, HeaderMap::new()),
        }
    }

    fn fetch_cached(
        &self,
        client: &Client,
        cache: &DiskCache,
        request: &EngineRequest,
    ) -> Result<RawResponse> {
        let key = cache_key(&request.method, &request.url);
        let cached = cache.get(&key).unwrap_or_else(|e| {
            warn!(key, error = %e, "Cache read failed");
            None
        });

        let mut validators = HeaderMap::new();
        if let Some(entry) = cached {
            if entry.is_fresh(Utc::now()) {
                trace!(url = %request.url, "Serving fresh cache entry");
                return Ok(RawResponse::from_entry(&request.url, entry));
            }
            if let Some(etag) = entry.etag().and_then(|v| HeaderValue::from_str(v).ok()) {
                validators.insert(reqwest::header::IF_NONE_MATCH, etag);
            }
            if let Some(date) = entry
                .last_modified()
                .and_then(|v| HeaderValue::from_str(v).ok())
            {
                validators.insert(reqwest::header::IF_MODIFIED_SINCE, date);
            }
        }

        let revalidating = !validators.is_empty();
        let response = self.send(client, request, validators)?;

        if revalidating && response.status == 304 {
            let now = Utc::now();
            match cache.update(&key, |entry| entry.refresh(&response.headers, now)) {
                Ok(Some(entry)) => {
                    debug!(url = %request.url, "Cache entry revalidated");
                    return Ok(RawResponse::from_entry(&request.url, entry));
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "Cache update failed"),
            }
        }

        if request.method.eq_ignore_ascii_case("GET") {
            let entry = CacheEntry::new(
                key.as_str(),
                response.status,
                response.headers.clone(),
                response.body.clone(),
            );
            if entry.is_storable() {
                if let Err(e) = cache.put(&key, &entry) {
                    warn!(key, error = %e, "Cache write failed");
                }
            }
        }

        Ok(response)
    }

    fn send(&self, client: &Client, request: &EngineRequest, extra: HeaderMap) -> Result<RawResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::invalid_argument(format!("Invalid method: {}", request.method)))?;

        let mut headers = self.header_template.clone();
        for (name, value) in header_map(&request.headers)? {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }
        headers.extend(extra);

        let mut builder = client.request(method, &request.url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let _permit = self.limiter.acquire(&request.url);
        let response = builder.send()?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes()?.to_vec();

        trace!(%url, status, size = body.len(), "Response received");

        Ok(RawResponse {
            url,
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn build_client(settings: &Settings, monitor: &ReadinessMonitor, jar: Arc<Jar>) -> Result<Client> {
    let mut builder = Client::builder()
        .cookie_provider(jar)
        .redirect(redirect_policy(monitor.clone()))
        .pool_max_idle_per_host(settings.max_route_connections)
        .danger_accept_invalid_certs(settings.trust_all_certs)
        .gzip(true)
        .deflate(true);

    if settings.connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(settings.connect_timeout_ms));
    }
    builder = builder.timeout(
        (settings.socket_timeout_ms > 0).then(|| Duration::from_millis(settings.socket_timeout_ms)),
    );

    builder = match settings.proxy.to_reqwest()? {
        Some(proxy) => builder.proxy(proxy),
        None => builder.no_proxy(),
    };

    Ok(builder.build()?)
}

/// Follows redirects while recording them for status lookups.
fn redirect_policy(monitor: ReadinessMonitor) -> Policy {
    Policy::custom(move |attempt| {
        let hops = attempt.previous().len();
        if hops > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }

        if let Some(previous) = attempt.previous().last() {
            monitor.record_status(previous.as_str(), i32::from(attempt.status().as_u16()));
            monitor.record_redirect(attempt.url().as_str(), previous.as_str());
        }
        attempt.follow()
    })
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::invalid_argument(format!("Invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::invalid_argument(format!("Invalid value for header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
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
    fn test_limiter_caps_concurrency() {
        let limiter = Arc::new(ConnectionLimiter::new(2, 0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = limiter.acquire("https://example.test/");
                    peak.fetch_max(limiter.active(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker thread");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_limiter_caps_each_destination() {
        let limiter = Arc::new(ConnectionLimiter::new(4, 1));
        let peaks: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let total_peak = Arc::new(AtomicUsize::new(0));
        let hosts = ["https://a.test/x", "https://b.test/y"];

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                let peak = Arc::clone(&peaks[i % 2]);
                let total_peak = Arc::clone(&total_peak);
                let url = hosts[i % 2];
                thread::spawn(move || {
                    let _permit = limiter.acquire(url);
                    peak.fetch_max(limiter.active_for(url), Ordering::SeqCst);
                    total_peak.fetch_max(limiter.active(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker thread");
        }
        assert_eq!(peaks[0].load(Ordering::SeqCst), 1);
        assert_eq!(peaks[1].load(Ordering::SeqCst), 1);
        assert!(total_peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_route_slot_does_not_block_other_hosts() {
        let limiter = ConnectionLimiter::new(0, 1);
        let _a = limiter.acquire("https://a.test/1");
        // Would block forever if routes shared the slot.
        let _b = limiter.acquire("https://b.test/1");
        assert_eq!(limiter.active(), 2);
        assert_eq!(limiter.active_for("https://A.test:443/2"), 1);
    }

    #[test]
    fn test_unlimited_limiter() {
        let limiter = ConnectionLimiter::new(0, 0);
        let _a = limiter.acquire("https://a.test/");
        let _b = limiter.acquire("https://a.test/");
        assert_eq!(limiter.active(), 2);
    }

    #[test]
    fn test_destination_keys() {
        assert_eq!(destination("https://Example.test/a"), "example.test:443");
        assert_eq!(destination("http://example.test:8080/"), "example.test:8080");
        assert_eq!(destination("not a url"), "not a url");
    }

    #[test]
    fn test_header_map_rejects_invalid_names() {
        let ok = header_map(&[("X-Test".into(), "1".into())]).expect("valid");
        assert_eq!(ok.get("x-test").map(|v| v.as_bytes()), Some(&b"1"[..]));
        assert!(header_map(&[("bad header".into(), "1".into())]).is_err());
    }
}
