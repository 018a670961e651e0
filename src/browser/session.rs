//! The synchronous automation API of one browser instance.
//!
//! Every method is one or more dispatched tasks. Navigation-like methods
//! reset the readiness status first and return once the page settled.
//!
//! # Example
//!
//! ```ignore
//! use engine_webdriver::{Browser, Settings};
//!
//! let browser = Browser::launch(&Settings::default(), |ctx| my_engine::build(ctx))?;
//! let status = browser.get("https://example.com")?;
//! let title = browser.title()?;
//! browser.quit();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::driver::Settings;
use crate::error::{Error, Result};
use crate::readiness::{ReadinessConfig, ReadinessMonitor};

use super::dispatcher::{CommandDispatcher, ExecOptions};
use super::engine::{Engine, EngineContext};

// ============================================================================
// Timeouts
// ============================================================================

/// Navigation and script deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for a navigation to settle.
    pub page_load: Duration,
    /// Deadline for a script to return.
    pub script: Duration,
}

impl From<&Settings> for Timeouts {
    fn from(settings: &Settings) -> Self {
        Self {
            page_load: settings.page_load_timeout(),
            script: settings.script_timeout(),
        }
    }
}

// ============================================================================
// Browser
// ============================================================================

/// One browser instance driven from arbitrary threads.
pub struct Browser {
    dispatcher: CommandDispatcher,
    monitor: ReadinessMonitor,
    timeouts: Mutex<Timeouts>,
}

impl fmt::Debug for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Browser")
            .field("status", &self.monitor.status().phase())
            .field("timeouts", &*self.timeouts.lock())
            .finish_non_exhaustive()
    }
}

impl Browser {
    /// Starts the engine thread and builds the engine with `factory`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the settings are invalid
    /// - Any error of the gateway or the factory
    pub fn launch<F>(settings: &Settings, factory: F) -> Result<Self>
    where
        F: FnOnce(EngineContext) -> Result<Box<dyn Engine>> + Send + 'static,
    {
        settings.validate()?;
        let monitor = ReadinessMonitor::new(ReadinessConfig::from(settings))?;
        let dispatcher = CommandDispatcher::spawn(settings, monitor.clone(), Box::new(factory))?;

        info!("Browser launched");

        Ok(Self {
            dispatcher,
            monitor,
            timeouts: Mutex::new(Timeouts::from(settings)),
        })
    }

    /// Returns the readiness monitor.
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &ReadinessMonitor {
        &self.monitor
    }

    /// Returns the dispatcher.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }
}

// ============================================================================
// Browser - Navigation
// ============================================================================

impl Browser {
    /// Navigates to `url` and waits until the page settled.
    ///
    /// Returns the HTTP status of the main document.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `url` is not absolute
    /// - [`Error::Timeout`] if the page does not settle within the
    ///   page-load timeout
    pub fn get(&self, url: &str) -> Result<i32> {
        let target = Url::parse(url)
            .map_err(|e| Error::invalid_argument(format!("Invalid URL {url:?}: {e}")))?
            .to_string();
        debug!(url = %target, "Navigating");

        let code = self.navigate("navigate", move |engine| engine.load(&target))?;
        info!(url, code, "Navigation settled");
        Ok(code)
    }

    /// Reloads the page and waits until it settled.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the page does not settle in time.
    pub fn refresh(&self) -> Result<i32> {
        self.navigate("refresh", |engine| engine.reload())
    }

    /// Stops loading.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn stop(&self) -> Result<()> {
        self.dispatcher
            .execute(ExecOptions::immediate("stop"), |host| host.engine().stop())?;
        self.monitor.settle_after_action();
        Ok(())
    }

    /// Status of the last navigation: `-1` before any, `0` while loading.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> i32 {
        self.monitor.status_code()
    }

    fn navigate<F>(&self, label: &'static str, start: F) -> Result<i32>
    where
        F: FnOnce(&dyn Engine) -> Result<()> + Send + 'static,
    {
        let timeout = self.timeouts.lock().page_load;

        self.dispatcher.execute(
            ExecOptions::immediate(label).with_timeout(timeout),
            move |host| {
                let mut settle = SettleGuard::new(host.monitor());
                host.monitor().reset_status_code();
                start(host.engine())?;
                settle.disarm();
                Ok(())
            },
        )?;

        self.monitor.wait_ready(timeout)
    }
}

/// Starts a settle round when dropped unless disarmed.
///
/// Keeps the status from staying in the loading phase after a reset whose
/// engine call failed or panicked.
struct SettleGuard<'a> {
    monitor: &'a ReadinessMonitor,
    armed: bool,
}

impl<'a> SettleGuard<'a> {
    fn new(monitor: &'a ReadinessMonitor) -> Self {
        Self {
            monitor,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.monitor.settle_after_action();
        }
    }
}

// ============================================================================
// Browser - Page State
// ============================================================================

impl Browser {
    /// URL of the main frame.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn current_url(&self) -> Result<String> {
        self.dispatcher
            .execute(ExecOptions::after_load("currentUrl"), |host| {
                host.engine().current_url()
            })
    }

    /// Title of the current document.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn title(&self) -> Result<String> {
        self.dispatcher
            .execute(ExecOptions::after_load("title"), |host| host.engine().title())
    }

    /// Serialized DOM of the current document.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn page_source(&self) -> Result<String> {
        self.dispatcher
            .execute(ExecOptions::after_load("pageSource"), |host| {
                host.engine().page_source()
            })
    }

    /// PNG of the viewport.
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub fn screenshot(&self) -> Result<Vec<u8>> {
        self.dispatcher
            .execute(ExecOptions::after_load("screenshot"), |host| {
                host.engine().screenshot()
            })
    }

    /// Drains URLs of popups the engine opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineShutdown`] once the browser quit.
    pub fn take_popups(&self) -> Result<Vec<String>> {
        self.dispatcher
            .execute(ExecOptions::immediate("popups"), |host| {
                Ok(host.engine().take_popups())
            })
    }
}

// ============================================================================
// Browser - Scripts
// ============================================================================

impl Browser {
    /// Runs a script that does not interact with the page.
    ///
    /// # Errors
    ///
    /// - [`Error::Script`] if the script throws
    /// - [`Error::Timeout`] if it does not return within the script timeout
    pub fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let timeout = self.timeouts.lock().script;
        let script = script.to_string();
        self.dispatcher.execute(
            ExecOptions::after_load("executeScript").with_timeout(timeout),
            move |host| host.engine().execute_script(&script, &args),
        )
    }

    /// Runs a script that acts on the page (click, submit, key press) and
    /// waits until whatever it triggered settled.
    ///
    /// The action is held back while a navigation is loading, and the
    /// readiness tables are only reset once it is about to run.
    ///
    /// # Errors
    ///
    /// - [`Error::Script`] if the script throws
    /// - [`Error::Timeout`] if the action does not run within the larger of
    ///   the script and page-load timeouts, or the load it caused exceeds
    ///   the page-load timeout
    pub fn perform(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let Timeouts { page_load, script: script_timeout } = *self.timeouts.lock();
        let script = script.to_string();

        let value = self.dispatcher.execute(
            ExecOptions::after_load("action")
                .with_timeout(script_timeout.max(page_load))
                .with_settle(),
            move |host| {
                let _settle = SettleGuard::new(host.monitor());
                host.monitor().reset_status_code();
                host.engine().execute_script(&script, &args)
            },
        )?;

        self.monitor.wait_ready(page_load)?;
        Ok(value)
    }
}

// ============================================================================
// Browser - Timeouts
// ============================================================================

impl Browser {
    /// Returns the current deadlines.
    #[inline]
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        *self.timeouts.lock()
    }

    /// Changes the deadlines; `None` keeps the current value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for a zero deadline.
    pub fn set_timeouts(&self, page_load: Option<Duration>, script: Option<Duration>) -> Result<()> {
        if page_load.is_some_and(|d| d.is_zero()) || script.is_some_and(|d| d.is_zero()) {
            return Err(Error::invalid_argument("Timeouts must be greater than zero"));
        }

        let mut timeouts = self.timeouts.lock();
        if let Some(page_load) = page_load {
            timeouts.page_load = page_load;
        }
        if let Some(script) = script {
            timeouts.script = script;
        }
        debug!(?timeouts, "Timeouts updated");
        Ok(())
    }
}

// ============================================================================
// Browser - Cookies & Cache
// ============================================================================

impl Browser {
    /// Stores a `Set-Cookie` style cookie for `url`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `url` is not a valid URL.
    pub fn add_cookie(&self, url: &str, cookie: &str) -> Result<()> {
        let (url, cookie) = (url.to_string(), cookie.to_string());
        self.dispatcher
            .execute(ExecOptions::immediate("addCookie"), move |host| {
                host.gateway().add_cookie(&url, &cookie)
            })
    }

    /// The `Cookie` header that would be sent to `url`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `url` is not a valid URL.
    pub fn cookie_header(&self, url: &str) -> Result<Option<String>> {
        let url = url.to_string();
        self.dispatcher
            .execute(ExecOptions::immediate("cookieHeader"), move |host| {
                host.gateway().cookie_header(&url)
            })
    }

    /// Removes every disk cache entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns cache I/O errors.
    pub fn clear_cache(&self) -> Result<usize> {
        self.dispatcher
            .execute(ExecOptions::immediate("clearCache"), |host| {
                host.gateway().clear_cache()
            })
    }
}

// ============================================================================
// Browser - Lifecycle
// ============================================================================

impl Browser {
    /// Stops the engine thread. Idempotent.
    pub fn quit(&self) {
        self.dispatcher.shutdown();
        info!("Browser quit");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use serde_json::json;

    use crate::identifiers::FrameId;
    use crate::readiness::LoadEvent;

    /// Simulates load events the way an engine reports them.
    struct MockEngine {
        monitor: ReadinessMonitor,
        url: Mutex<String>,
        loads: Arc<AtomicUsize>,
        /// Set once the script of a `slow` page finished loading.
        slow_done: Arc<AtomicBool>,
    }

    impl MockEngine {
        fn status_for(url: &str) -> i32 {
            if url.contains("missing") { 404 } else { 200 }
        }

        fn start(&self, url: &str) {
            *self.url.lock() = url.to_string();
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.monitor.handle(LoadEvent::NavigationStarted {
                frame: FrameId::main(),
                url: url.to_string(),
                main_frame: true,
            });
            self.monitor.record_status(url, Self::status_for(url));

            if url.contains("slow") {
                let script = format!("{url}app.js");
                self.monitor.handle(LoadEvent::ResourceStarted {
                    frame: FrameId::main(),
                    url: script.clone(),
                });

                let monitor = self.monitor.clone();
                let done = Arc::clone(&self.slow_done);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(400));
                    done.store(true, Ordering::SeqCst);
                    monitor.handle(LoadEvent::ResourceFinished {
                        frame: FrameId::main(),
                        url: script,
                    });
                });
            }

            let monitor = self.monitor.clone();
            let url = url.to_string();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                monitor.handle(LoadEvent::PageFinished {
                    frame: FrameId::main(),
                    url,
                    main_frame: true,
                });
            });
        }
    }

    impl Engine for MockEngine {
        fn load(&self, url: &str) -> Result<()> {
            if url.contains("refused") {
                return Err(Error::engine("navigation refused"));
            }
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
            Ok(format!("Title of {}", self.url.lock()))
        }

        fn page_source(&self) -> Result<String> {
            Ok("<html></html>".into())
        }

        fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value> {
            match script {
                "throw" => Err(Error::script("ReferenceError: x is not defined")),
                "click" => {
                    self.start("https://next.test/");
                    Ok(Value::Null)
                }
                "sleep" => {
                    thread::sleep(Duration::from_millis(300));
                    Ok(Value::Null)
                }
                "observe" => Ok(json!(self.slow_done.load(Ordering::SeqCst))),
                "panic" => panic!("engine crashed"),
                _ => Ok(json!({ "script": script, "args": args })),
            }
        }

        fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(b"\x89PNG".to_vec())
        }

        fn take_popups(&self) -> Vec<String> {
            vec!["https://popup.test/".into()]
        }
    }

    fn launch() -> (Browser, Arc<AtomicUsize>) {
        let (browser, loads, _) = launch_observed();
        (browser, loads)
    }

    fn launch_observed() -> (Browser, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let slow_done = Arc::new(AtomicBool::new(false));
        let counter = Arc::clone(&loads);
        let done = Arc::clone(&slow_done);
        let settings = Settings::default()
            .with_ajax_wait_ms(30)
            .with_command_timeout_ms(3_000);

        let browser = Browser::launch(&settings, move |ctx| {
            Ok(Box::new(MockEngine {
                monitor: ctx.monitor,
                url: Mutex::new("about:blank".into()),
                loads: counter,
                slow_done: done,
            }) as Box<dyn Engine>)
        })
        .expect("launch");
        (browser, loads, slow_done)
    }

    #[test]
    fn test_get_returns_main_document_status() {
        let (browser, loads) = launch();
        assert_eq!(browser.status_code(), -1);

        assert_eq!(browser.get("https://example.test/").expect("get"), 200);
        assert_eq!(browser.get("https://example.test/missing").expect("get"), 404);
        assert_eq!(browser.status_code(), 404);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(browser.current_url().expect("url"), "https://example.test/missing");
    }

    #[test]
    fn test_get_rejects_relative_urls() {
        let (browser, loads) = launch();
        let err = browser.get("/relative").expect_err("invalid");
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_navigation_settles() {
        let (browser, _) = launch();
        let err = browser.get("https://refused.test/").expect_err("refused");
        assert!(matches!(err, Error::Engine { .. }));

        // Later commands are not stuck behind the aborted load.
        assert_eq!(browser.title().expect("title"), "Title of about:blank");
    }

    #[test]
    fn test_refresh_reloads_current_page() {
        let (browser, loads) = launch();
        browser.get("https://example.test/").expect("get");
        assert_eq!(browser.refresh().expect("refresh"), 200);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_script_results_and_errors() {
        let (browser, _) = launch();
        let value = browser
            .execute_script("return arguments[0]", vec![json!(7)])
            .expect("script");
        assert_eq!(value, json!({ "script": "return arguments[0]", "args": [7] }));

        let err = browser.execute_script("throw", vec![]).expect_err("throws");
        assert!(matches!(err, Error::Script { .. }));
    }

    #[test]
    fn test_script_timeout() {
        let (browser, _) = launch();
        browser
            .set_timeouts(None, Some(Duration::from_millis(50)))
            .expect("set");
        let err = browser.execute_script("sleep", vec![]).expect_err("too slow");
        assert!(err.is_timeout());
        assert!(browser.set_timeouts(Some(Duration::ZERO), None).is_err());
    }

    #[test]
    fn test_action_waits_for_triggered_navigation() {
        let (browser, loads) = launch();
        browser.perform("click", vec![]).expect("click");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(browser.status_code(), 200);
        assert_eq!(browser.current_url().expect("url"), "https://next.test/");
    }

    #[test]
    fn test_action_is_held_back_until_load_settles() {
        let (browser, loads, slow_done) = launch_observed();
        let browser = Arc::new(browser);

        let navigating = Arc::clone(&browser);
        let navigation = thread::spawn(move || navigating.get("https://slow.test/"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while loads.load(Ordering::SeqCst) == 0 || browser.monitor().pending_resources() == 0 {
            assert!(Instant::now() < deadline, "navigation did not start");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(browser.status_code(), 0);

        let issued = Instant::now();
        let observed = browser.perform("observe", vec![]).expect("action");

        // The action only ran after the page script finished.
        assert_eq!(observed, json!(true));
        assert!(issued.elapsed() >= Duration::from_millis(300));

        // The navigation kept its own tables and settled with its own status.
        let code = navigation.join().expect("navigation thread").expect("get");
        assert_eq!(code, 200);
        assert_eq!(browser.status_code(), 0);
    }

    #[test]
    fn test_panicking_action_does_not_block_later_commands() {
        let (browser, _) = launch();
        let err = browser.perform("panic", vec![]).expect_err("panics");
        assert!(matches!(err, Error::TaskPanicked { .. }));
        assert_eq!(browser.title().expect("title"), "Title of about:blank");
    }

    #[test]
    fn test_action_without_navigation_settles_to_zero() {
        let (browser, _) = launch();
        browser.perform("noop", vec![]).expect("action");
        assert_eq!(browser.status_code(), 0);
    }

    #[test]
    fn test_cookies_and_cache() {
        let (browser, _) = launch();
        browser
            .add_cookie("https://example.test/", "sid=1; Path=/")
            .expect("cookie");
        assert_eq!(
            browser.cookie_header("https://example.test/a").expect("header").as_deref(),
            Some("sid=1")
        );
        assert_eq!(browser.clear_cache().expect("clear"), 0);
    }

    #[test]
    fn test_quit_stops_dispatch() {
        let (browser, _) = launch();
        assert_eq!(browser.screenshot().expect("png"), b"\x89PNG");
        assert_eq!(browser.take_popups().expect("popups"), vec!["https://popup.test/"]);

        browser.quit();
        browser.quit();
        assert!(matches!(browser.title(), Err(Error::EngineShutdown)));
    }
}
