//! Response body transforms.
//!
//! Transforms run in order on every executed response. Each one may
//! replace the body (`Some`) or leave it alone (`None`); the gateway
//! recomputes `Content-Length` after each replacement.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::readiness::ReadinessMonitor;

use super::dirs::DownloadDirs;

// ============================================================================
// Constants
// ============================================================================

/// Content-type prefixes classified as media.
const MEDIA_PREFIXES: [&str; 6] = [
    "image/",
    "video/",
    "audio/",
    "model/",
    "font/",
    "application/octet-stream",
];

/// Content-type fragments classified as media.
const MEDIA_FRAGMENTS: [&str; 3] = ["/font-", "/vnd.", "/x."];

/// Longest file name written for a saved body.
const MAX_FILE_NAME: usize = 128;

// ============================================================================
// Classification
// ============================================================================

/// Returns `true` if a response with this content type counts as media.
///
/// An empty content type is media.
#[must_use]
pub fn is_media(content_type: &str) -> bool {
    let content_type = content_type.trim().to_ascii_lowercase();
    content_type.is_empty()
        || MEDIA_PREFIXES.iter().any(|p| content_type.starts_with(p))
        || MEDIA_FRAGMENTS.iter().any(|f| content_type.contains(f))
}

/// Returns `true` for HTML content types.
#[must_use]
pub fn is_html(content_type: &str) -> bool {
    let content_type = content_type.trim().to_ascii_lowercase();
    content_type.starts_with("text/html") || content_type.starts_with("application/xhtml")
}

// ============================================================================
// ResponseMeta
// ============================================================================

/// What a transform may inspect about the response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMeta<'a> {
    /// Final response URL.
    pub url: &'a str,
    /// HTTP status.
    pub status: u16,
    /// `Content-Type` header, empty if absent.
    pub content_type: &'a str,
    /// `Content-Disposition` header, empty if absent.
    pub disposition: &'a str,
    /// `Some(is_main_frame)` if the URL is a primary document.
    pub primary: Option<bool>,
}

// ============================================================================
// ContentTransform
// ============================================================================

/// One stage of the response pipeline.
pub trait ContentTransform: Send + Sync {
    /// Stage name used in logs.
    fn name(&self) -> &'static str;

    /// Returns a replacement body, or `None` to keep the current one.
    fn apply(&self, response: &ResponseMeta<'_>, body: &[u8]) -> Option<Vec<u8>>;
}

// ============================================================================
// AttachmentSaver
// ============================================================================

/// Persists attachment and media bodies to the download directories.
pub struct AttachmentSaver {
    dirs: Arc<DownloadDirs>,
    attachments: bool,
    media: bool,
}

impl AttachmentSaver {
    /// Creates a saver; each flag enables one directory.
    #[must_use]
    pub fn new(dirs: Arc<DownloadDirs>, attachments: bool, media: bool) -> Self {
        Self {
            dirs,
            attachments,
            media,
        }
    }

    fn save(&self, dir: &Path, response: &ResponseMeta<'_>, body: &[u8]) {
        let name = attachment_file_name(response.disposition, response.url);
        let path = dir.join(name);
        match fs::write(&path, body) {
            Ok(()) => debug!(url = response.url, path = %path.display(), "Saved response body"),
            Err(e) => warn!(url = response.url, error = %e, "Failed to save response body"),
        }
    }
}

impl ContentTransform for AttachmentSaver {
    fn name(&self) -> &'static str {
        "attachment-saver"
    }

    fn apply(&self, response: &ResponseMeta<'_>, body: &[u8]) -> Option<Vec<u8>> {
        let is_attachment = response
            .disposition
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("attachment");

        if is_attachment && self.attachments {
            self.save(self.dirs.attachments(), response, body);
        } else if self.media && is_media(response.content_type) {
            self.save(self.dirs.media(), response, body);
        }
        None
    }
}

/// Picks a file name from `Content-Disposition`, falling back to a URL hash.
#[must_use]
pub fn attachment_file_name(disposition: &str, url: &str) -> String {
    disposition_file_name(disposition)
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| hex::encode(&Sha256::digest(url.as_bytes())[..16]))
}

fn disposition_file_name(disposition: &str) -> Option<String> {
    let mut plain = None;
    for param in disposition.split(';').map(str::trim) {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match name.trim().to_ascii_lowercase().as_str() {
            // RFC 5987: charset'language'percent-encoded
            "filename*" => {
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" => {
                plain = Some(
                    urlencoding::decode(value)
                        .map_or_else(|_| value.to_string(), |d| d.into_owned()),
                );
            }
            _ => {}
        }
    }
    plain
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME)
        .collect::<String>()
        .trim()
        .to_string()
}

// ============================================================================
// HeadInjector
// ============================================================================

/// Injects an HTML fragment at the start of `<head>` of primary documents.
pub struct HeadInjector {
    fragment: Vec<u8>,
    head: Regex,
    html: Regex,
}

impl HeadInjector {
    /// Creates an injector for `fragment`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the tag patterns cannot be compiled.
    pub fn new(fragment: impl Into<String>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::config(format!("Invalid tag pattern: {e}")))
        };

        Ok(Self {
            fragment: fragment.into().into_bytes(),
            head: compile(r"(?i)<head(?:\s[^>]*)?>")?,
            html: compile(r"(?i)<html(?:\s[^>]*)?>")?,
        })
    }

    fn inject(&self, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + self.fragment.len() + 32);

        if let Some(tag) = self.head.find(body) {
            out.extend_from_slice(&body[..tag.end()]);
            out.extend_from_slice(&self.fragment);
            out.extend_from_slice(&body[tag.end()..]);
        } else if let Some(tag) = self.html.find(body) {
            out.extend_from_slice(&body[..tag.end()]);
            out.extend_from_slice(b"<head>");
            out.extend_from_slice(&self.fragment);
            out.extend_from_slice(b"</head>");
            out.extend_from_slice(&body[tag.end()..]);
        } else {
            out.extend_from_slice(b"<html><head>");
            out.extend_from_slice(&self.fragment);
            out.extend_from_slice(b"</head>");
            out.extend_from_slice(body);
            out.extend_from_slice(b"</html>");
        }
        out
    }
}

impl ContentTransform for HeadInjector {
    fn name(&self) -> &'static str {
        "head-injector"
    }

    fn apply(&self, response: &ResponseMeta<'_>, body: &[u8]) -> Option<Vec<u8>> {
        let is_redirect = (300..400).contains(&response.status);
        if self.fragment.is_empty()
            || is_redirect
            || response.primary.is_none()
            || !is_html(response.content_type)
        {
            return None;
        }
        Some(self.inject(body))
    }
}

// ============================================================================
// MediaDiscarder
// ============================================================================

/// Drops media bodies and records their URLs as discarded.
pub struct MediaDiscarder {
    monitor: ReadinessMonitor,
}

impl MediaDiscarder {
    /// Creates a discarder reporting to `monitor`.
    #[must_use]
    pub fn new(monitor: ReadinessMonitor) -> Self {
        Self { monitor }
    }
}

impl ContentTransform for MediaDiscarder {
    fn name(&self) -> &'static str {
        "media-discarder"
    }

    fn apply(&self, response: &ResponseMeta<'_>, body: &[u8]) -> Option<Vec<u8>> {
        if !is_media(response.content_type) {
            return None;
        }
        self.monitor.mark_discarded(response.url);
        (!body.is_empty()).then(Vec::new)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::readiness::ReadinessConfig;

    fn meta<'a>(content_type: &'a str, primary: Option<bool>) -> ResponseMeta<'a> {
        ResponseMeta {
            url: "https://a.test/page",
            status: 200,
            content_type,
            disposition: "",
            primary,
        }
    }

    #[test]
    fn test_media_classification() {
        for media in [
            "",
            "image/png",
            "Video/MP4",
            "application/octet-stream",
            "application/font-woff",
            "application/vnd.ms-fontobject",
            "application/x.custom",
        ] {
            assert!(is_media(media), "{media} should be media");
        }
        for other in ["text/html; charset=utf-8", "application/json", "text/css"] {
            assert!(!is_media(other), "{other} should not be media");
        }
    }

    #[test]
    fn test_inject_into_existing_head() {
        let injector = HeadInjector::new("<script>x()</script>").expect("injector");
        let body = b"<!doctype html><html><HEAD lang=\"en\"><title>t</title></head></html>";
        let out = injector
            .apply(&meta("text/html", Some(true)), body)
            .expect("injected");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "<!doctype html><html><HEAD lang=\"en\"><script>x()</script><title>t</title></head></html>"
        );
    }

    #[test]
    fn test_inject_creates_head_and_html() {
        let injector = HeadInjector::new("<s/>").expect("injector");
        let with_html = injector.inject(b"<html><body>b</body></html>");
        assert_eq!(with_html, b"<html><head><s/></head><body>b</body></html>".to_vec());

        let bare = injector.inject(b"<p>hi</p>");
        assert_eq!(bare, b"<html><head><s/></head><p>hi</p></html>".to_vec());
    }

    #[test]
    fn test_header_tag_is_not_head() {
        let injector = HeadInjector::new("<s/>").expect("injector");
        let out = injector.inject(b"<html><header>h</header></html>");
        assert_eq!(out, b"<html><head><s/></head><header>h</header></html>".to_vec());
    }

    #[test]
    fn test_injection_skips_subresources_and_redirects() {
        let injector = HeadInjector::new("<s/>").expect("injector");
        assert!(injector.apply(&meta("text/html", None), b"<html>").is_none());
        assert!(injector.apply(&meta("application/json", Some(true)), b"{}").is_none());

        let redirect = ResponseMeta {
            status: 302,
            ..meta("text/html", Some(true))
        };
        assert!(injector.apply(&redirect, b"<html>").is_none());
    }

    #[test]
    fn test_discarder_marks_media() {
        let monitor = ReadinessMonitor::new(ReadinessConfig::default()).expect("monitor");
        let discarder = MediaDiscarder::new(monitor.clone());

        let out = discarder.apply(&meta("image/png", None), b"\x89PNG");
        assert_eq!(out, Some(Vec::new()));
        assert!(monitor.is_discarded("https://a.test/page"));
        assert!(discarder.apply(&meta("text/html", None), b"<html>").is_none());
    }

    #[test]
    fn test_attachment_file_names() {
        assert_eq!(
            attachment_file_name("attachment; filename=\"report.pdf\"", "https://a.test/x"),
            "report.pdf"
        );
        assert_eq!(
            attachment_file_name(
                "attachment; filename=\"fallback.txt\"; filename*=UTF-8''na%C3%AFve%20file.txt",
                "https://a.test/x"
            ),
            "naïve file.txt"
        );
        assert_eq!(
            attachment_file_name("attachment; filename=\"../../etc/passwd\"", "https://a.test/x"),
            "passwd"
        );

        let hashed = attachment_file_name("attachment", "https://a.test/x");
        assert_eq!(hashed.len(), 32);
    }

    #[test]
    fn test_saver_writes_attachments() {
        let dirs = Arc::new(DownloadDirs::create().expect("dirs"));
        let saver = AttachmentSaver::new(Arc::clone(&dirs), true, false);
        let response = ResponseMeta {
            disposition: "attachment; filename=data.csv",
            ..meta("text/csv", None)
        };

        assert!(saver.apply(&response, b"a,b").is_none());
        let saved = fs::read(dirs.attachments().join("data.csv")).expect("saved file");
        assert_eq!(saved, b"a,b");
    }
}
