//! The engine-facing network gateway.
//!
//! Every request the engine issues goes through [`NetworkGateway::open`],
//! which applies the skip policy up front and defers all network I/O until
//! the response is first inspected.

// ============================================================================
// Imports
// ============================================================================

use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheConfig, DiskCache, is_cacheable_method};
use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::identifiers::FrameId;
use crate::readiness::{LoadEvent, ReadinessMonitor, UNKNOWN_STATUS};

use super::adblock::AdHosts;
use super::client::{HttpClients, RawResponse};
use super::dirs::DownloadDirs;
use super::transform::{
    AttachmentSaver, ContentTransform, HeadInjector, MediaDiscarder, ResponseMeta,
};

// ============================================================================
// Constants
// ============================================================================

/// Status reported for skipped requests.
pub const SKIPPED_STATUS: u16 = 204;

// ============================================================================
// EngineRequest
// ============================================================================

/// A request as issued by the rendering engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers set by the engine.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Request body.
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Requesting frame.
    #[serde(default = "FrameId::main")]
    pub frame: FrameId,
}

impl EngineRequest {
    /// Creates a `GET` request from the main frame.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Creates a request with the given method from the main frame.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
            body: None,
            frame: FrameId::main(),
        }
    }

    /// Sets the requesting frame.
    #[must_use]
    pub fn with_frame(mut self, frame: FrameId) -> Self {
        self.frame = frame;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Returns `true` if the request may be served from the cache.
    #[inline]
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        is_cacheable_method(&self.method)
    }
}

// ============================================================================
// GatewayResponse
// ============================================================================

/// A fully processed response handed back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// Final URL after redirects.
    pub url: String,
    /// HTTP status; [`SKIPPED_STATUS`] for skipped requests.
    pub status: u16,
    /// Response headers after transforms.
    pub headers: Vec<(String, String)>,
    /// Response body after transforms.
    pub body: Vec<u8>,
    /// The request never reached the network.
    pub skipped: bool,
    /// The body was deliberately dropped.
    pub discarded: bool,
    /// The response was served from the disk cache.
    pub from_cache: bool,
}

impl GatewayResponse {
    fn skipped(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: SKIPPED_STATUS,
            headers: vec![("Content-Length".into(), "0".into())],
            body: Vec::new(),
            skipped: true,
            discarded: true,
            from_cache: false,
        }
    }

    fn failed(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: UNKNOWN_STATUS as u16,
            headers: vec![("Content-Length".into(), "0".into())],
            body: Vec::new(),
            skipped: false,
            discarded: false,
            from_cache: false,
        }
    }

    /// Returns the first header with the given name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the `Content-Length` header as a number.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    fn set_content_length(&mut self) {
        self.headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("content-length"));
        self.headers
            .push(("Content-Length".into(), self.body.len().to_string()));
    }
}

// ============================================================================
// PendingResponse
// ============================================================================

/// A connected but not yet executed request.
///
/// The network round-trip happens on the first call to [`status`](Self::status),
/// [`body`](Self::body) or [`response`](Self::response).
pub struct PendingResponse<'g> {
    gateway: &'g NetworkGateway,
    request: EngineRequest,
    skip: bool,
    outcome: OnceCell<GatewayResponse>,
}

impl fmt::Debug for PendingResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("url", &self.request.url)
            .field("skip", &self.skip)
            .field("executed", &self.outcome.get().is_some())
            .finish()
    }
}

impl PendingResponse<'_> {
    /// Returns `true` if the request was short-circuited in the connect phase.
    #[inline]
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Returns `true` once the request was executed.
    #[inline]
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Returns the request.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &EngineRequest {
        &self.request
    }

    /// Executes the request if needed and returns the processed response.
    pub fn response(&self) -> &GatewayResponse {
        self.outcome.get_or_init(|| {
            if self.skip {
                GatewayResponse::skipped(&self.request.url)
            } else {
                self.gateway.execute(&self.request)
            }
        })
    }

    /// Returns the response status.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.response().status
    }

    /// Returns the response body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.response().body
    }

    /// Consumes the handle and returns the processed response.
    #[must_use]
    pub fn into_response(self) -> GatewayResponse {
        self.response();
        self.outcome
            .into_inner()
            .unwrap_or_else(|| GatewayResponse::failed(&self.request.url))
    }
}

// ============================================================================
// NetworkGateway
// ============================================================================

/// Substitute for the engine's network stack.
pub struct NetworkGateway {
    monitor: ReadinessMonitor,
    clients: HttpClients,
    ad_hosts: Option<AdHosts>,
    transforms: Vec<Box<dyn ContentTransform>>,
    jar: Arc<Jar>,
    dirs: Arc<DownloadDirs>,
}

impl fmt::Debug for NetworkGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGateway")
            .field("ad_block", &self.ad_hosts.is_some())
            .field("cache", &self.clients.cache().is_some())
            .field(
                "transforms",
                &self.transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl NetworkGateway {
    /// Builds the gateway for one browser instance.
    ///
    /// Must not be called from inside an async runtime; the blocking HTTP
    /// clients own their own.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid proxy, header template or head script
    /// - [`Error::Io`] if download or cache directories cannot be created
    /// - [`Error::Http`] if the HTTP clients cannot be built
    pub fn new(settings: &Settings, monitor: ReadinessMonitor) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let dirs = Arc::new(DownloadDirs::create()?);

        let cache = if settings.cache {
            let config = CacheConfig::from(settings);
            Some(match &settings.cache_dir {
                Some(dir) => DiskCache::open(dir, config)?,
                None => DiskCache::temporary(config)?,
            })
        } else {
            None
        };

        let ad_hosts = if settings.ad_block {
            Some(match &settings.ad_hosts_file {
                Some(path) => AdHosts::load(path)?,
                None => AdHosts::builtin(),
            })
        } else {
            None
        };

        let mut transforms: Vec<Box<dyn ContentTransform>> = Vec::new();
        if settings.save_attachments || settings.save_media {
            transforms.push(Box::new(AttachmentSaver::new(
                Arc::clone(&dirs),
                settings.save_attachments,
                settings.save_media,
            )));
        }
        if let Some(script) = settings.head_script.as_deref().filter(|s| !s.is_empty()) {
            transforms.push(Box::new(HeadInjector::new(script)?));
        }
        if settings.quick_render {
            transforms.push(Box::new(MediaDiscarder::new(monitor.clone())));
        }

        let clients = HttpClients::build(settings, &monitor, Arc::clone(&jar), cache)?;

        info!(
            cache = settings.cache,
            ad_block = settings.ad_block,
            transforms = transforms.len(),
            "Network gateway ready"
        );

        Ok(Self {
            monitor,
            clients,
            ad_hosts,
            transforms,
            jar,
            dirs,
        })
    }

    /// Returns the shared cookie jar.
    #[inline]
    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Returns the download directories.
    #[inline]
    #[must_use]
    pub fn download_dirs(&self) -> &DownloadDirs {
        &self.dirs
    }

    /// Returns the disk cache, if enabled.
    #[inline]
    #[must_use]
    pub fn cache(&self) -> Option<&DiskCache> {
        self.clients.cache()
    }

    /// Connect phase: decides whether the request will be skipped.
    ///
    /// Blocked hosts and previously discarded URLs never reach the network.
    pub fn open(&self, request: EngineRequest) -> PendingResponse<'_> {
        let blocked = self
            .ad_hosts
            .as_ref()
            .is_some_and(|hosts| hosts.blocks_url(&request.url));
        if blocked {
            self.monitor.mark_discarded(&request.url);
        }
        let skip = blocked || self.monitor.is_discarded(&request.url);

        if skip {
            debug!(url = %request.url, blocked, "Request skipped");
        }

        PendingResponse {
            gateway: self,
            request,
            skip,
            outcome: OnceCell::new(),
        }
    }

    /// Adds a cookie as if `url` had set it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `url` is not absolute.
    pub fn add_cookie(&self, url: &str, cookie: &str) -> Result<()> {
        let url = parse_url(url)?;
        self.jar.add_cookie_str(cookie, &url);
        Ok(())
    }

    /// Returns the `Cookie` header that would be sent to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `url` is not absolute.
    pub fn cookie_header(&self, url: &str) -> Result<Option<String>> {
        let url = parse_url(url)?;
        Ok(self
            .jar
            .cookies(&url)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned()))
    }

    /// Removes every cache entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the cache directory cannot be cleared.
    pub fn clear_cache(&self) -> Result<usize> {
        self.clients.cache().map_or(Ok(0), DiskCache::clear)
    }

    fn execute(&self, request: &EngineRequest) -> GatewayResponse {
        match self.clients.fetch(request) {
            Ok(raw) => self.process(raw),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Request failed");
                self.monitor.handle(LoadEvent::ResourceFailed {
                    frame: request.frame,
                    url: request.url.clone(),
                });
                GatewayResponse::failed(&request.url)
            }
        }
    }

    /// Response phase: status bookkeeping and the transform pipeline.
    fn process(&self, raw: RawResponse) -> GatewayResponse {
        self.monitor.record_status(&raw.url, i32::from(raw.status));

        let mut response = GatewayResponse {
            url: raw.url,
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            skipped: false,
            discarded: false,
            from_cache: raw.from_cache,
        };
        response
            .headers
            .retain(|(n, _)| !n.eq_ignore_ascii_case("content-encoding"));
        response.set_content_length();

        let primary = self.monitor.primary_document(&response.url);
        for transform in &self.transforms {
            let replaced = {
                let meta = ResponseMeta {
                    url: &response.url,
                    status: response.status,
                    content_type: response.header("content-type").unwrap_or_default(),
                    disposition: response.header("content-disposition").unwrap_or_default(),
                    primary,
                };
                transform.apply(&meta, &response.body)
            };

            if let Some(body) = replaced {
                trace!(stage = transform.name(), url = %response.url, size = body.len(), "Body replaced");
                response.body = body;
                response.set_content_length();
            }
        }

        response.discarded = self.monitor.is_discarded(&response.url);
        response
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| Error::invalid_argument(format!("Invalid URL {url}: {e}")))
}
