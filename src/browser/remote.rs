//! Controller-side handle of a browser running in a worker process.
//!
//! Each [`RemoteBrowser`] owns:
//! - One worker process (child process)
//! - One [`Endpoint`] into the worker (primary and alternate channel)
//! - Two callback servers the worker calls back into
//! - One [`PortGroup`] reserved from the driver's allocator
//!
//! # Example
//!
//! ```no_run
//! use engine_webdriver::Driver;
//!
//! # async fn example() -> engine_webdriver::Result<()> {
//! let driver = Driver::builder().worker("/usr/local/bin/engine-worker").build()?;
//!
//! let browser = driver.launch().await?;
//! let status = browser.get("https://example.com").await?;
//! println!("{status} {}", browser.title().await?);
//!
//! browser.quit().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::identifiers::InstanceId;
use crate::protocol::{
    BrowserCommand, CacheCommand, CallbackCommand, Command, CookieCommand, ScriptCommand,
    SessionCommand,
};
use crate::transport::{
    CallContext, Endpoint, HEARTBEAT_INTERVAL, Heartbeat, PortAllocator, PortGroup, RpcServer,
    RpcService, SocketLock,
};

// ============================================================================
// Constants
// ============================================================================

/// Added to every call deadline; the worker enforces the real one.
const CALL_MARGIN: Duration = Duration::from_secs(5);

/// Deadline of the quit call.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a quitting worker may take to exit before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(3);

// ============================================================================
// ProcessGuard
// ============================================================================

/// Guards the worker process and kills it when dropped.
struct ProcessGuard {
    child: Option<Child>,
    pid: u32,
}

impl ProcessGuard {
    fn new(child: Option<Child>) -> Self {
        let pid = child.as_ref().and_then(Child::id).unwrap_or(0);
        debug!(pid, "Process guard created");
        Self { child, pid }
    }

    /// Waits up to `grace` for the process to exit, then kills it.
    async fn wait_or_kill(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, %status, "Worker exited");
                return;
            }
            Ok(Err(e)) => debug!(pid = self.pid, error = %e, "Failed to wait for worker"),
            Err(_) => debug!(pid = self.pid, "Worker did not exit in time"),
        }

        if let Err(e) = child.kill().await {
            debug!(pid = self.pid, error = %e, "Failed to kill worker");
        }
        info!(pid = self.pid, "Worker terminated");
    }

    /// Exit status if the process already exited.
    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

// ============================================================================
// ControllerCallbacks
// ============================================================================

/// Serves the calls a worker makes into its controller.
#[derive(Debug, Default)]
pub(crate) struct ControllerCallbacks {
    popups: Mutex<Vec<String>>,
}

impl ControllerCallbacks {
    fn take_popups(&self) -> Vec<String> {
        std::mem::take(&mut *self.popups.lock())
    }
}

#[async_trait]
impl RpcService for ControllerCallbacks {
    async fn handle(&self, ctx: CallContext, command: Command) -> Result<Value> {
        match command {
            Command::Callback(CallbackCommand::PopupOpened { url }) => {
                debug!(url = %url, depth = ctx.depth(), "Popup opened");
                self.popups.lock().push(url);
                Ok(Value::Null)
            }
            other => Err(Error::UnknownCommand {
                command: other.method(),
            }),
        }
    }
}

// ============================================================================
// Attachment
// ============================================================================

/// Everything a launched worker hands over to its [`RemoteBrowser`].
pub(crate) struct Attachment {
    pub instance: InstanceId,
    /// Effective ports reported by the worker.
    pub ports: PortGroup,
    /// Ports reserved from `allocator`.
    pub reserved: PortGroup,
    pub allocator: Arc<PortAllocator>,
    pub servers: Vec<RpcServer>,
    pub callbacks: Arc<ControllerCallbacks>,
    /// `None` when the worker is hosted in this process.
    pub child: Option<Child>,
}

// ============================================================================
// RemoteBrowser
// ============================================================================

/// A browser instance in a worker process.
///
/// Methods mirror [`Browser`](super::Browser). The worker process is killed
/// when the handle is dropped.
pub struct RemoteBrowser {
    instance: InstanceId,
    ports: PortGroup,
    reserved: PortGroup,
    allocator: Arc<PortAllocator>,
    endpoint: Arc<Endpoint>,
    heartbeat: Mutex<Option<Heartbeat>>,
    servers: Mutex<Vec<RpcServer>>,
    callbacks: Arc<ControllerCallbacks>,
    process: tokio::sync::Mutex<ProcessGuard>,
    call_timeout: Mutex<Duration>,
    closed: AtomicBool,
}

// ============================================================================
// RemoteBrowser - Display
// ============================================================================

impl fmt::Debug for RemoteBrowser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBrowser")
            .field("instance", &self.instance)
            .field("ports", &self.ports)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RemoteBrowser - Constructor
// ============================================================================

impl RemoteBrowser {
    /// Connects to a worker that printed its ready line.
    pub(crate) fn attach(attachment: Attachment, settings: &Settings) -> Self {
        let Attachment {
            instance,
            ports,
            reserved,
            allocator,
            servers,
            callbacks,
            child,
        } = attachment;

        let call_timeout = call_timeout(
            settings.command_timeout(),
            settings.page_load_timeout(),
            settings.script_timeout(),
        );
        let lock = Arc::new(SocketLock::new(instance));
        let endpoint = Arc::new(Endpoint::new(lock, ports.child(), ports.child(), call_timeout));
        endpoint.warm_up();

        let heartbeat = settings
            .heartbeat
            .then(|| Heartbeat::spawn(Arc::clone(&endpoint), HEARTBEAT_INTERVAL));

        info!(
            instance = %instance,
            ports = %ports,
            heartbeat = heartbeat.is_some(),
            "Remote browser attached"
        );

        Self {
            instance,
            ports,
            reserved,
            allocator,
            endpoint,
            heartbeat: Mutex::new(heartbeat),
            servers: Mutex::new(servers),
            callbacks,
            process: tokio::sync::Mutex::new(ProcessGuard::new(child)),
            call_timeout: Mutex::new(call_timeout),
            closed: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// RemoteBrowser - Accessors
// ============================================================================

impl RemoteBrowser {
    /// Returns the instance ID.
    #[inline]
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Returns the effective ports.
    #[inline]
    #[must_use]
    pub fn ports(&self) -> PortGroup {
        self.ports
    }

    /// Returns `true` once [`quit`](Self::quit) ran.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drains URLs of popups reported by the worker.
    #[must_use]
    pub fn take_popups(&self) -> Vec<String> {
        self.callbacks.take_popups()
    }
}

// ============================================================================
// RemoteBrowser - Navigation
// ============================================================================

impl RemoteBrowser {
    /// Navigates to `url`; returns the main document's HTTP status.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `url` is not absolute
    /// - [`Error::Timeout`] if the page does not settle in time
    /// - [`Error::WorkerExited`] if the worker is gone
    pub async fn get(&self, url: &str) -> Result<i32> {
        let value = self
            .call(Command::Browser(BrowserCommand::Get { url: url.to_string() }))
            .await?;
        status_from(&value)
    }

    /// Reloads the page.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn refresh(&self) -> Result<i32> {
        let value = self.call(Command::Browser(BrowserCommand::Refresh)).await?;
        status_from(&value)
    }

    /// Stops loading.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn stop(&self) -> Result<()> {
        self.call(Command::Browser(BrowserCommand::Stop)).await?;
        Ok(())
    }

    /// Status of the last navigation.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn status_code(&self) -> Result<i32> {
        let value = self.call(Command::Browser(BrowserCommand::StatusCode)).await?;
        status_from(&value)
    }
}

// ============================================================================
// RemoteBrowser - Page State
// ============================================================================

impl RemoteBrowser {
    /// URL of the main frame.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn current_url(&self) -> Result<String> {
        let value = self.call(Command::Browser(BrowserCommand::CurrentUrl)).await?;
        string_from(value)
    }

    /// Title of the current document.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn title(&self) -> Result<String> {
        let value = self.call(Command::Browser(BrowserCommand::Title)).await?;
        string_from(value)
    }

    /// Serialized DOM of the current document.
    ///
    /// # Errors
    ///
    /// Returns the worker's error.
    pub async fn page_source(&self) -> Result<String> {
        let value = self.call(Command::Browser(BrowserCommand::PageSource)).await?;
        string_from(value)
    }

    /// PNG of the viewport.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the worker sends invalid base64.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let value = self.call(Command::Browser(BrowserCommand::Screenshot)).await?;
        let encoded = string_from(value)?;
        BASE64
            .decode(encoded)
            .map_err(|e| Error::protocol(format!("Invalid screenshot data: {e}")))
    }
}

// ============================================================================
// RemoteBrowser - Scripts & Timeouts
// ============================================================================

impl RemoteBrowser {
    /// Runs a script that does not interact with the page.
    ///
    /// # Errors
    ///
    /// [`Error::Script`] if the script throws.
    pub async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.call(Command::Script(ScriptCommand::Execute {
            script: script.to_string(),
            args,
        }))
        .await
    }

    /// Runs a script that acts on the page and waits for the page to settle.
    ///
    /// # Errors
    ///
    /// [`Error::Script`] if the script throws.
    pub async fn perform(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.call(Command::Script(ScriptCommand::Action {
            script: script.to_string(),
            args,
        }))
        .await
    }

    /// Changes the worker's deadlines; `None` keeps the current value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero deadline.
    pub async fn set_timeouts(&self, page_load: Option<Duration>, script: Option<Duration>) -> Result<()> {
        self.call(Command::Browser(BrowserCommand::SetTimeouts {
            page_load_ms: page_load.map(|d| d.as_millis() as u64),
            script_ms: script.map(|d| d.as_millis() as u64),
        }))
        .await?;

        let mut current = self.call_timeout.lock();
        let longest = page_load.into_iter().chain(script).max().unwrap_or_default();
        *current = (*current).max(longest + CALL_MARGIN);
        Ok(())
    }
}

// ============================================================================
// RemoteBrowser - Cookies & Cache
// ============================================================================

impl RemoteBrowser {
    /// Stores a `Set-Cookie` style cookie for `url`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `url` is invalid.
    pub async fn add_cookie(&self, url: &str, cookie: &str) -> Result<()> {
        self.call(Command::Cookies(CookieCommand::Add {
            url: url.to_string(),
            cookie: cookie.to_string(),
        }))
        .await?;
        Ok(())
    }

    /// The `Cookie` header the worker would send to `url`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `url` is invalid.
    pub async fn cookie_header(&self, url: &str) -> Result<Option<String>> {
        let value = self
            .call(Command::Cookies(CookieCommand::Header { url: url.to_string() }))
            .await?;
        Ok(value.as_str().map(str::to_owned))
    }

    /// Clears the worker's disk cache.
    ///
    /// # Errors
    ///
    /// Returns cache I/O errors.
    pub async fn clear_cache(&self) -> Result<usize> {
        let value = self.call(Command::Cache(CacheCommand::Clear)).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| Error::protocol(format!("Expected entry count, got {value}")))
    }
}

// ============================================================================
// RemoteBrowser - Lifecycle
// ============================================================================

impl RemoteBrowser {
    /// Asks the worker to quit, then tears the instance down.
    ///
    /// The worker is killed if it does not exit in time. Idempotent.
    ///
    /// # Errors
    ///
    /// Currently infallible; teardown problems are logged.
    pub async fn quit(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(instance = %self.instance, "Quitting remote browser");

        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }

        let quit = Command::Session(SessionCommand::Quit);
        if let Err(e) = self
            .endpoint
            .call_with_timeout(CallContext::root(), quit, QUIT_TIMEOUT)
            .await
        {
            debug!(instance = %self.instance, error = %e, "Quit call failed");
        }

        self.endpoint.close().await;
        self.process.lock().await.wait_or_kill(EXIT_GRACE).await;
        self.teardown();

        info!(instance = %self.instance, "Remote browser quit");
        Ok(())
    }

    /// Releases servers and ports. Safe to run twice.
    fn teardown(&self) {
        for server in self.servers.lock().drain(..) {
            server.shutdown();
        }
        if !self.reserved.is_ephemeral() {
            self.allocator.release(self.reserved);
        }
    }
}

impl Drop for RemoteBrowser {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.lock().expire();
        self.teardown();
        debug!(instance = %self.instance, "Remote browser dropped");
    }
}

// ============================================================================
// RemoteBrowser - Internal
// ============================================================================

impl RemoteBrowser {
    async fn call(&self, command: Command) -> Result<Value> {
        let timeout = *self.call_timeout.lock();
        match self
            .endpoint
            .call_with_timeout(CallContext::root(), command, timeout)
            .await
        {
            Err(e @ (Error::Connection { .. } | Error::ConnectionClosed)) => {
                Err(self.diagnose(e).await)
            }
            other => other,
        }
    }

    /// Turns a connection failure into [`Error::WorkerExited`] when the
    /// worker is gone.
    async fn diagnose(&self, error: Error) -> Error {
        match self.process.lock().await.exit_status() {
            Some(status) => {
                warn!(instance = %self.instance, %status, "Worker exited unexpectedly");
                self.endpoint.lock().expire();
                Error::worker_exited(format!("worker exited with {status}"))
            }
            None => error,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn call_timeout(command: Duration, page_load: Duration, script: Duration) -> Duration {
    command.max(page_load).max(script) + CALL_MARGIN
}

fn status_from(value: &Value) -> Result<i32> {
    value
        .as_i64()
        .and_then(|code| i32::try_from(code).ok())
        .ok_or_else(|| Error::protocol(format!("Expected status code, got {value}")))
}

fn string_from(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(Error::protocol(format!("Expected string, got {other}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_call_timeout_covers_longest_deadline() {
        let timeout = call_timeout(
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        assert_eq!(timeout, Duration::from_secs(65));
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(status_from(&json!(404)).expect("code"), 404);
        assert!(status_from(&json!("404")).is_err());
        assert!(status_from(&json!(i64::MAX)).is_err());
        assert_eq!(string_from(json!("t")).expect("string"), "t");
        assert!(matches!(string_from(json!(1)), Err(Error::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_callbacks_collect_popups() {
        let callbacks = ControllerCallbacks::default();
        let ctx = CallContext::serving(0);
        let popup = |url: &str| {
            Command::Callback(CallbackCommand::PopupOpened { url: url.into() })
        };

        callbacks.handle(ctx, popup("https://a.test/")).await.expect("a");
        callbacks.handle(ctx, popup("https://b.test/")).await.expect("b");
        assert_eq!(callbacks.take_popups(), vec!["https://a.test/", "https://b.test/"]);
        assert!(callbacks.take_popups().is_empty());

        let err = callbacks
            .handle(ctx, Command::Session(SessionCommand::Heartbeat))
            .await
            .expect_err("not a callback");
        assert!(matches!(err, Error::UnknownCommand { .. }));
    }

    #[test]
    fn test_remote_browser_is_debug() {
        fn assert_debug<T: fmt::Debug>() {}
        assert_debug::<RemoteBrowser>();
    }
}
