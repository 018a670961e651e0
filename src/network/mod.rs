//! Network mediation for the rendering engine.
//!
//! The engine has no network stack of its own in this driver; every request
//! it issues is funneled through the [`NetworkGateway`].
//!
//! # Request Flow
//!
//! ```text
//! engine ──► open() ──► blocked host / discarded URL? ──► 204, empty body
//!                 │
//!                 ▼ (first status/body access)
//!            plain client  or  caching client ◄──► DiskCache
//!                 │
//!                 ▼
//!   attachment saver ─► head injector ─► media discarder ─► engine
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `adblock` | Ad-host list with suffix matching |
//! | `client` | Pooled HTTP clients, connection cap |
//! | `dirs` | Download directories |
//! | `gateway` | [`NetworkGateway`] and request/response types |
//! | `transform` | Response body transforms |

// ============================================================================
// Submodules
// ============================================================================

mod adblock;
mod client;
mod dirs;
mod gateway;
mod transform;

// ============================================================================
// Re-exports
// ============================================================================

pub use adblock::AdHosts;
pub use dirs::DownloadDirs;
pub use gateway::{EngineRequest, GatewayResponse, NetworkGateway, PendingResponse, SKIPPED_STATUS};
pub use transform::{
    AttachmentSaver, ContentTransform, HeadInjector, MediaDiscarder, ResponseMeta,
    attachment_file_name, is_html, is_media,
};

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::driver::Settings;
    use crate::identifiers::FrameId;
    use crate::readiness::{LoadEvent, ReadinessConfig, ReadinessMonitor};

    type Route = (u16, Vec<(&'static str, String)>, Vec<u8>);

    /// Minimal HTTP/1.1 responder on a loopback port.
    struct Responder {
        base: String,
        hits: Arc<AtomicUsize>,
    }

    impl Responder {
        fn start(route: fn(&str, &str) -> Route) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            let base = format!("http://{}", listener.local_addr().expect("addr"));
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);

            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { continue };
                    counter.fetch_add(1, Ordering::SeqCst);

                    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                    let mut request_line = String::new();
                    if reader.read_line(&mut request_line).is_err() {
                        continue;
                    }
                    let mut validator = String::new();
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                            break;
                        }
                        if line.to_ascii_lowercase().starts_with("if-none-match:") {
                            validator = line.clone();
                        }
                    }

                    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                    let (status, headers, body) = route(path, &validator);
                    let mut head = format!("HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n", body.len());
                    for (name, value) in headers {
                        head.push_str(&format!("{name}: {value}\r\n"));
                    }
                    head.push_str("\r\n");
                    let _ = stream.write_all(head.as_bytes());
                    let _ = stream.write_all(&body);
                }
            });

            Self { base, hits }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    fn routes(path: &str, validator: &str) -> Route {
        match path {
            "/page" => (
                200,
                vec![("Content-Type", "text/html".into())],
                b"<html><head></head><body>hi</body></html>".to_vec(),
            ),
            "/start" => (301, vec![("Location", "/end".into())], Vec::new()),
            "/end" => (200, vec![("Content-Type", "text/plain".into())], b"end".to_vec()),
            "/logo.png" => (200, vec![("Content-Type", "image/png".into())], b"\x89PNG".to_vec()),
            "/fresh" => (
                200,
                vec![
                    ("Content-Type", "text/plain".into()),
                    ("Cache-Control", "max-age=600".into()),
                ],
                b"fresh".to_vec(),
            ),
            "/etag" if validator.contains("\"v1\"") => (304, vec![("ETag", "\"v1\"".into())], Vec::new()),
            "/etag" => (
                200,
                vec![
                    ("Content-Type", "text/plain".into()),
                    ("Cache-Control", "no-cache".into()),
                    ("ETag", "\"v1\"".into()),
                ],
                b"validated".to_vec(),
            ),
            _ => (404, vec![], b"missing".to_vec()),
        }
    }

    fn monitor() -> ReadinessMonitor {
        ReadinessMonitor::new(ReadinessConfig::default()).expect("monitor")
    }

    #[test]
    fn test_blocked_host_is_never_executed() {
        let monitor = monitor();
        let gateway = NetworkGateway::new(&Settings::default(), monitor.clone()).expect("gateway");

        let pending = gateway.open(EngineRequest::get("https://ads.doubleclick.net/pixel.gif"));
        assert!(pending.is_skipped());
        assert!(monitor.is_discarded("https://ads.doubleclick.net/pixel.gif#frag"));
        assert!(!pending.is_executed());

        let response = pending.into_response();
        assert_eq!(response.status, SKIPPED_STATUS);
        assert!(response.body.is_empty());
        assert!(response.discarded);
        assert_eq!(response.content_length(), Some(0));
    }

    #[test]
    fn test_execution_is_lazy() {
        let server = Responder::start(routes);
        let gateway = NetworkGateway::new(&Settings::default(), monitor()).expect("gateway");

        let pending = gateway.open(EngineRequest::get(server.url("/end")));
        assert_eq!(server.hits(), 0);
        assert_eq!(pending.status(), 200);
        assert_eq!(pending.body(), b"end");
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn test_head_injection_for_primary_documents() {
        let server = Responder::start(routes);
        let monitor = monitor();
        let settings = Settings::default().with_head_script("<script>s()</script>");
        let gateway = NetworkGateway::new(&settings, monitor.clone()).expect("gateway");

        monitor.handle(LoadEvent::NavigationStarted {
            frame: FrameId::main(),
            url: server.url("/page"),
            main_frame: true,
        });
        let response = gateway.open(EngineRequest::get(server.url("/page"))).into_response();

        let body = String::from_utf8(response.body.clone()).expect("utf8");
        assert_eq!(body, "<html><head><script>s()</script></head><body>hi</body></html>");
        assert_eq!(response.content_length(), Some(response.body.len()));
    }

    #[test]
    fn test_redirects_resolve_to_final_status() {
        let server = Responder::start(routes);
        let monitor = monitor();
        let gateway = NetworkGateway::new(&Settings::default(), monitor.clone()).expect("gateway");

        let response = gateway.open(EngineRequest::get(server.url("/start"))).into_response();
        assert_eq!(response.status, 200);
        assert_eq!(response.url, server.url("/end"));
        assert_eq!(monitor.status_for(&server.url("/start")), 200);
    }

    #[test]
    fn test_quick_render_discards_media() {
        let server = Responder::start(routes);
        let monitor = monitor();
        let settings = Settings::default().with_quick_render(true);
        let gateway = NetworkGateway::new(&settings, monitor.clone()).expect("gateway");

        let first = gateway.open(EngineRequest::get(server.url("/logo.png"))).into_response();
        assert!(first.body.is_empty());
        assert!(first.discarded);
        assert_eq!(first.content_length(), Some(0));

        let again = gateway.open(EngineRequest::get(server.url("/logo.png")));
        assert!(again.is_skipped());
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn test_network_failure_reports_unknown_status() {
        let monitor = monitor();
        let gateway = NetworkGateway::new(&Settings::default(), monitor.clone()).expect("gateway");
        monitor.handle(LoadEvent::ResourceStarted {
            frame: FrameId::main(),
            url: "http://127.0.0.1:9/".into(),
        });

        let response = gateway.open(EngineRequest::get("http://127.0.0.1:9/")).into_response();
        assert_eq!(response.status, 499);
        assert_eq!(monitor.pending_resources(), 0);
    }

    #[test]
    fn test_fresh_entries_served_from_cache() {
        let server = Responder::start(routes);
        let settings = Settings::default().with_cache(true);
        let gateway = NetworkGateway::new(&settings, monitor()).expect("gateway");

        let first = gateway.open(EngineRequest::get(server.url("/fresh"))).into_response();
        let second = gateway.open(EngineRequest::get(server.url("/fresh"))).into_response();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.body, b"fresh");
        assert_eq!(server.hits(), 1);
    }

    #[test]
    fn test_stale_entries_are_revalidated() {
        let server = Responder::start(routes);
        let settings = Settings::default().with_cache(true);
        let gateway = NetworkGateway::new(&settings, monitor()).expect("gateway");

        let first = gateway.open(EngineRequest::get(server.url("/etag"))).into_response();
        let second = gateway.open(EngineRequest::get(server.url("/etag"))).into_response();

        assert_eq!(first.body, b"validated");
        assert_eq!(second.status, 200);
        assert!(second.from_cache);
        assert_eq!(second.body, b"validated");
        assert_eq!(server.hits(), 2);
    }

    #[test]
    fn test_post_bypasses_cache() {
        let server = Responder::start(routes);
        let settings = Settings::default().with_cache(true);
        let gateway = NetworkGateway::new(&settings, monitor()).expect("gateway");

        for _ in 0..2 {
            let request = EngineRequest::new("POST", server.url("/fresh")).with_body("x");
            assert!(!gateway.open(request).into_response().from_cache);
        }
        assert_eq!(server.hits(), 2);
        assert_eq!(gateway.clear_cache().expect("clear"), 0);
    }

    #[test]
    fn test_cookie_jar_round_trip() {
        let gateway = NetworkGateway::new(&Settings::default(), monitor()).expect("gateway");
        gateway
            .add_cookie("https://a.test/", "session=abc; Path=/")
            .expect("add cookie");

        assert_eq!(
            gateway.cookie_header("https://a.test/page").expect("header").as_deref(),
            Some("session=abc")
        );
        assert!(gateway.cookie_header("not a url").is_err());
    }
}
