//! Worker process host.
//!
//! A worker binary hosts one [`Browser`] and serves it to its controller:
//!
//! ```ignore
//! fn main() -> engine_webdriver::Result<()> {
//!     engine_webdriver::run_worker(|ctx| my_engine::build(ctx))
//! }
//! ```
//!
//! [`run_worker`] installs logging on stdout, reads the requested ports
//! from `--ports` and the settings from the environment, binds the RPC
//! server, prints the ready line and serves until the controller quits.

// ============================================================================
// Imports
// ============================================================================

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::browser::{Browser, Engine, EngineContext};
use crate::driver::handshake::{self, PORTS_FLAG};
use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::identifiers::InstanceId;
use crate::protocol::{
    BrowserCommand, CacheCommand, CallbackCommand, Command, CookieCommand, ScriptCommand,
    SessionCommand,
};
use crate::transport::{
    CallContext, Endpoint, PortGroup, RpcServer, RpcService, SocketLock, WATCHDOG_TIMEOUT,
    Watchdog,
};

// ============================================================================
// Constants
// ============================================================================

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "engine_webdriver=info";

/// Lets the quit response reach the controller before connections close.
const QUIT_LINGER: Duration = Duration::from_millis(100);

// ============================================================================
// Entry Point
// ============================================================================

/// Runs a worker process until its controller quits it.
///
/// # Errors
///
/// - [`Error::Config`] if `--ports` or the settings are missing or invalid
/// - [`Error::PortsUnavailable`] if the child port cannot be bound
/// - Any error building the engine
pub fn run_worker<F>(factory: F) -> Result<()>
where
    F: FnOnce(EngineContext) -> Result<Box<dyn Engine>> + Send + 'static,
{
    init_logging();

    let requested = parse_ports_arg(std::env::args().skip(1))?;
    let settings = Settings::from_env()?;
    settings.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-rpc")
        .build()?;

    runtime.block_on(serve(settings, requested, factory))
}

async fn serve<F>(settings: Settings, requested: PortGroup, factory: F) -> Result<()>
where
    F: FnOnce(EngineContext) -> Result<Box<dyn Engine>> + Send + 'static,
{
    let host = WorkerHost::start(&settings, requested, factory).await?;
    announce(&host.ready_line())?;
    host.run_until_quit().await;
    Ok(())
}

/// Prints the ready line and flushes it past any buffering.
fn announce(line: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Installs the stdout log subscriber the controller forwards from.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

/// Reads the `--ports child/parent/parentAlt` argument.
///
/// # Errors
///
/// [`Error::Config`] if the argument is missing or malformed.
pub fn parse_ports_arg<I>(args: I) -> Result<PortGroup>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let value = if arg == PORTS_FLAG {
            args.next()
        } else {
            arg.strip_prefix(PORTS_FLAG)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_owned)
        };

        if let Some(value) = value {
            return value
                .parse()
                .map_err(|e| Error::config(format!("Invalid {PORTS_FLAG} value {value:?}: {e}")));
        }
    }
    Err(Error::config(format!("Missing {PORTS_FLAG} argument")))
}

// ============================================================================
// WorkerHost
// ============================================================================

/// A browser served to a controller.
pub struct WorkerHost {
    ports: PortGroup,
    browser: Arc<Browser>,
    server: RpcServer,
    callbacks: Arc<Endpoint>,
    watchdog: Option<Watchdog>,
    quit: Arc<Notify>,
}

impl WorkerHost {
    /// Launches the browser and binds the RPC server.
    ///
    /// Port `0` in `requested.child()` binds an ephemeral port; the
    /// effective ports are available from [`ports`](Self::ports).
    ///
    /// # Errors
    ///
    /// - [`Error::PortsUnavailable`] if the child port cannot be bound
    /// - Any error launching the browser
    pub async fn start<F>(settings: &Settings, requested: PortGroup, factory: F) -> Result<Self>
    where
        F: FnOnce(EngineContext) -> Result<Box<dyn Engine>> + Send + 'static,
    {
        let launch_settings = settings.clone();
        let browser = tokio::task::spawn_blocking(move || Browser::launch(&launch_settings, factory))
            .await
            .map_err(|e| Error::engine(format!("Browser launch task failed: {e}")))??;
        let browser = Arc::new(browser);

        let lock = Arc::new(SocketLock::new(InstanceId::next()));
        let callbacks = Arc::new(Endpoint::new(
            lock,
            requested.parent(),
            requested.parent_alt(),
            settings.command_timeout(),
        ));

        let watchdog = if settings.heartbeat {
            Some(Watchdog::exit_process(WATCHDOG_TIMEOUT)?)
        } else {
            None
        };
        let quit = Arc::new(Notify::new());

        let service = Arc::new(WorkerService {
            browser: Arc::clone(&browser),
            callbacks: Arc::clone(&callbacks),
            watchdog: watchdog.clone(),
            quit: Arc::clone(&quit),
        });

        let server = match RpcServer::bind(requested.child(), service).await {
            Ok(server) => server,
            Err(e) => {
                warn!(port = requested.child(), error = %e, "Worker server bind failed");
                if let Some(watchdog) = &watchdog {
                    watchdog.stop();
                }
                browser.quit();
                return Err(Error::ports_unavailable(requested));
            }
        };

        let ports = PortGroup::new(server.port(), requested.parent(), requested.parent_alt());
        callbacks.warm_up();
        info!(ports = %ports, heartbeat = watchdog.is_some(), "Worker started");

        Ok(Self {
            ports,
            browser,
            server,
            callbacks,
            watchdog,
            quit,
        })
    }

    /// Returns the effective ports.
    #[inline]
    #[must_use]
    pub fn ports(&self) -> PortGroup {
        self.ports
    }

    /// Returns the hosted browser.
    #[inline]
    #[must_use]
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// The line announcing the effective ports to the controller.
    #[must_use]
    pub fn ready_line(&self) -> String {
        handshake::ready_line(self.ports)
    }

    /// Serves until the controller sends `session.quit`, then shuts down.
    pub async fn run_until_quit(self) {
        self.quit.notified().await;
        tokio::time::sleep(QUIT_LINGER).await;
        self.shutdown().await;
    }

    /// Stops serving and quits the browser.
    pub async fn shutdown(self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        self.server.shutdown();
        self.callbacks.close().await;

        let browser = Arc::clone(&self.browser);
        if let Err(e) = tokio::task::spawn_blocking(move || browser.quit()).await {
            debug!(error = %e, "Browser quit task failed");
        }
        info!(ports = %self.ports, "Worker stopped");
    }
}

// ============================================================================
// WorkerService
// ============================================================================

/// Maps commands onto the hosted [`Browser`].
struct WorkerService {
    browser: Arc<Browser>,
    callbacks: Arc<Endpoint>,
    watchdog: Option<Watchdog>,
    quit: Arc<Notify>,
}

#[async_trait]
impl RpcService for WorkerService {
    async fn handle(&self, ctx: CallContext, command: Command) -> Result<Value> {
        match command {
            Command::Browser(command) => self.handle_browser(ctx, command).await,

            Command::Script(ScriptCommand::Execute { script, args }) => {
                self.blocking(move |browser| browser.execute_script(&script, args))
                    .await
            }
            Command::Script(ScriptCommand::Action { script, args }) => {
                let value = self
                    .blocking(move |browser| browser.perform(&script, args))
                    .await?;
                self.forward_popups(ctx).await;
                Ok(value)
            }

            Command::Cookies(CookieCommand::Add { url, cookie }) => {
                self.blocking(move |browser| browser.add_cookie(&url, &cookie))
                    .await?;
                Ok(Value::Null)
            }
            Command::Cookies(CookieCommand::Header { url }) => {
                let header = self
                    .blocking(move |browser| browser.cookie_header(&url))
                    .await?;
                Ok(json!(header))
            }

            Command::Cache(CacheCommand::Clear) => {
                let removed = self.blocking(Browser::clear_cache).await?;
                Ok(json!(removed))
            }

            Command::Session(SessionCommand::Heartbeat) => {
                if let Some(watchdog) = &self.watchdog {
                    watchdog.feed();
                }
                Ok(Value::Null)
            }
            Command::Session(SessionCommand::Quit) => {
                info!("Quit requested");
                self.quit.notify_one();
                Ok(Value::Null)
            }

            command @ Command::Callback(CallbackCommand::PopupOpened { .. }) => {
                Err(Error::UnknownCommand {
                    command: command.method(),
                })
            }
        }
    }
}

impl WorkerService {
    async fn handle_browser(&self, ctx: CallContext, command: BrowserCommand) -> Result<Value> {
        match command {
            BrowserCommand::Get { url } => {
                let code = self.blocking(move |browser| browser.get(&url)).await?;
                self.forward_popups(ctx).await;
                Ok(json!(code))
            }
            BrowserCommand::Refresh => {
                let code = self.blocking(Browser::refresh).await?;
                self.forward_popups(ctx).await;
                Ok(json!(code))
            }
            BrowserCommand::Stop => {
                self.blocking(Browser::stop).await?;
                Ok(Value::Null)
            }
            BrowserCommand::CurrentUrl => Ok(json!(self.blocking(Browser::current_url).await?)),
            BrowserCommand::Title => Ok(json!(self.blocking(Browser::title).await?)),
            BrowserCommand::PageSource => Ok(json!(self.blocking(Browser::page_source).await?)),
            BrowserCommand::Screenshot => {
                let png = self.blocking(Browser::screenshot).await?;
                Ok(json!(BASE64.encode(png)))
            }
            BrowserCommand::StatusCode => Ok(json!(self.browser.status_code())),
            BrowserCommand::SetTimeouts {
                page_load_ms,
                script_ms,
            } => {
                self.browser.set_timeouts(
                    page_load_ms.map(Duration::from_millis),
                    script_ms.map(Duration::from_millis),
                )?;
                Ok(Value::Null)
            }
        }
    }

    /// Runs a blocking [`Browser`] call off the async workers.
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&Browser) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let browser = Arc::clone(&self.browser);
        tokio::task::spawn_blocking(move || call(&browser))
            .await
            .map_err(|e| Error::TaskPanicked {
                message: e.to_string(),
            })?
    }

    /// Reports popups to the controller as nested calls of `ctx`.
    async fn forward_popups(&self, ctx: CallContext) {
        let popups = match self.blocking(Browser::take_popups).await {
            Ok(popups) => popups,
            Err(e) => {
                debug!(error = %e, "Could not collect popups");
                return;
            }
        };

        for url in popups {
            let callback = Command::Callback(CallbackCommand::PopupOpened { url: url.clone() });
            if let Err(e) = self.callbacks.call(ctx, callback).await {
                warn!(url = %url, error = %e, "Popup callback failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use parking_lot::Mutex;

    use crate::browser::RemoteBrowser;
    use crate::browser::remote::{Attachment, ControllerCallbacks};
    use crate::identifiers::FrameId;
    use crate::readiness::{LoadEvent, ReadinessMonitor};
    use crate::transport::PortAllocator;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_ports_arg() {
        let expected = PortGroup::new(1, 2, 3);
        assert_eq!(parse_ports_arg(args(&["--ports", "1/2/3"])).expect("split"), expected);
        assert_eq!(
            parse_ports_arg(args(&["--verbose", "--ports=1/2/3"])).expect("joined"),
            expected
        );
        assert!(matches!(parse_ports_arg(args(&[])), Err(Error::Config { .. })));
        assert!(matches!(
            parse_ports_arg(args(&["--ports", "1/2"])),
            Err(Error::Config { .. })
        ));
        assert!(matches!(parse_ports_arg(args(&["--ports"])), Err(Error::Config { .. })));
    }

    /// Loads pages instantly; URLs containing `popup` open one popup.
    struct PageEngine {
        monitor: ReadinessMonitor,
        url: Mutex<String>,
        popups: Mutex<Vec<String>>,
    }

    impl PageEngine {
        fn start(&self, url: &str) {
            *self.url.lock() = url.to_string();
            if url.contains("popup") {
                self.popups.lock().push(format!("{url}#child"));
            }
            self.monitor.handle(LoadEvent::NavigationStarted {
                frame: FrameId::main(),
                url: url.to_string(),
                main_frame: true,
            });
            self.monitor.record_status(url, 200);

            let monitor = self.monitor.clone();
            let url = url.to_string();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                monitor.handle(LoadEvent::PageFinished {
                    frame: FrameId::main(),
                    url,
                    main_frame: true,
                });
            });
        }
    }

    impl Engine for PageEngine {
        fn load(&self, url: &str) -> Result<()> {
            self.start(url);
            Ok(())
        }

        fn reload(&self) -> Result<()> {
            let url = self.url.lock().clone();
            self.start(&url);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn current_url(&self) -> Result<String> {
            Ok(self.url.lock().clone())
        }

        fn title(&self) -> Result<String> {
            Ok("Example Domain".into())
        }

        fn page_source(&self) -> Result<String> {
            Ok("<html><head></head></html>".into())
        }

        fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value> {
            if script == "throw" {
                return Err(Error::script("TypeError: null has no properties"));
            }
            Ok(json!({ "len": args.len() }))
        }

        fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G', 0, 255])
        }

        fn take_popups(&self) -> Vec<String> {
            std::mem::take(&mut *self.popups.lock())
        }
    }

    struct Setup {
        remote: RemoteBrowser,
        worker: tokio::task::JoinHandle<()>,
    }

    async fn setup() -> Setup {
        let settings = Settings::default()
            .with_heartbeat(false)
            .with_ajax_wait_ms(20)
            .with_command_timeout_ms(5_000);

        let callbacks = Arc::new(ControllerCallbacks::default());
        let parent = RpcServer::bind(0, callbacks.clone()).await.expect("parent");
        let parent_alt = RpcServer::bind(0, callbacks.clone()).await.expect("parent alt");
        let requested = PortGroup::new(0, parent.port(), parent_alt.port());

        let host = WorkerHost::start(&settings, requested, |ctx| {
            Ok(Box::new(PageEngine {
                monitor: ctx.monitor,
                url: Mutex::new("about:blank".into()),
                popups: Mutex::new(Vec::new()),
            }) as Box<dyn Engine>)
        })
        .await
        .expect("worker");

        let reported = handshake::parse_ready_line(&host.ready_line()).expect("ready line");
        assert_eq!(reported, host.ports());
        assert_ne!(reported.child(), 0);

        let remote = RemoteBrowser::attach(
            Attachment {
                instance: InstanceId::next(),
                ports: reported,
                reserved: PortGroup::ephemeral(),
                allocator: Arc::new(PortAllocator::default()),
                servers: vec![parent, parent_alt],
                callbacks,
                child: None,
            },
            &settings,
        );
        let worker = tokio::spawn(host.run_until_quit());

        Setup { remote, worker }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_navigation_and_page_state() {
        let Setup { remote, worker } = setup().await;

        assert_eq!(remote.status_code().await.expect("status"), -1);
        assert_eq!(remote.get("https://example.test/").await.expect("get"), 200);
        assert_eq!(remote.current_url().await.expect("url"), "https://example.test/");
        assert_eq!(remote.title().await.expect("title"), "Example Domain");
        assert!(remote.page_source().await.expect("source").starts_with("<html>"));
        assert_eq!(
            remote.screenshot().await.expect("png"),
            vec![0x89, b'P', b'N', b'G', 0, 255]
        );
        assert_eq!(remote.refresh().await.expect("refresh"), 200);

        remote.quit().await.expect("quit");
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker stops")
            .expect("join");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_popups_arrive_before_navigation_returns() {
        let Setup { remote, worker } = setup().await;

        remote.get("https://popup.test/").await.expect("get");
        assert_eq!(remote.take_popups(), vec!["https://popup.test/#child"]);
        assert!(remote.take_popups().is_empty());

        remote.quit().await.expect("quit");
        let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scripts_cookies_and_errors() {
        let Setup { remote, worker } = setup().await;

        let value = remote
            .execute_script("return 1", vec![json!(1), json!(2)])
            .await
            .expect("script");
        assert_eq!(value, json!({ "len": 2 }));

        let err = remote.execute_script("throw", vec![]).await.expect_err("throws");
        assert!(matches!(err, Error::Script { .. }));

        let err = remote.get("not a url").await.expect_err("invalid");
        assert!(matches!(err, Error::InvalidArgument { .. }));

        assert_eq!(remote.perform("click", vec![]).await.expect("action"), json!({ "len": 0 }));

        remote
            .add_cookie("https://example.test/", "token=abc; Path=/")
            .await
            .expect("cookie");
        assert_eq!(
            remote.cookie_header("https://example.test/").await.expect("header"),
            Some("token=abc".to_string())
        );
        assert_eq!(remote.cookie_header("https://other.test/").await.expect("none"), None);
        assert_eq!(remote.clear_cache().await.expect("clear"), 0);

        remote
            .set_timeouts(Some(Duration::from_secs(10)), None)
            .await
            .expect("timeouts");
        let err = remote
            .set_timeouts(None, Some(Duration::ZERO))
            .await
            .expect_err("zero");
        assert!(matches!(err, Error::InvalidArgument { .. }));

        remote.quit().await.expect("quit");
        remote.quit().await.expect("idempotent");
        assert!(remote.is_closed());
        let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
    }
}
