//! The rendering engine boundary.
//!
//! The engine itself is not part of this crate. An embedder implements
//! [`Engine`] for its engine binding and hands a factory to
//! [`Browser::launch`](super::Browser::launch); the factory runs on the
//! engine thread, and the engine never leaves it.
//!
//! The engine reports load progress through
//! [`ReadinessMonitor::handle`](crate::readiness::ReadinessMonitor::handle)
//! and routes every network request through
//! [`NetworkGateway::open`](crate::network::NetworkGateway::open), both
//! available from the [`EngineContext`] it is built with.

// ============================================================================
// Imports
// ============================================================================

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::network::NetworkGateway;
use crate::readiness::ReadinessMonitor;

// ============================================================================
// Engine
// ============================================================================

/// Operations the driver needs from a rendering engine.
///
/// Every method is called on the engine thread only. Methods take `&self`
/// because an engine callback may re-enter the driver while another call
/// is still on the stack.
pub trait Engine {
    /// Starts navigating the main frame to `url`.
    ///
    /// Returns once the navigation was started; completion is reported
    /// through load events.
    ///
    /// # Errors
    ///
    /// Returns an error if the navigation could not be started.
    fn load(&self, url: &str) -> Result<()>;

    /// Reloads the current page.
    ///
    /// # Errors
    ///
    /// Returns an error if the reload could not be started.
    fn reload(&self) -> Result<()>;

    /// Stops any load in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the request.
    fn stop(&self) -> Result<()>;

    /// URL of the main frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot report it.
    fn current_url(&self) -> Result<String>;

    /// Title of the current document.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot report it.
    fn title(&self) -> Result<String>;

    /// Serialized DOM of the current document.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot serialize the document.
    fn page_source(&self) -> Result<String>;

    /// Runs a script with `arguments` bound and returns its JSON result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Script`](crate::Error::Script) if the script throws.
    fn execute_script(&self, script: &str, args: &[Value]) -> Result<Value>;

    /// Renders the viewport as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering fails.
    fn screenshot(&self) -> Result<Vec<u8>>;

    /// Drains URLs of popups opened since the last call.
    fn take_popups(&self) -> Vec<String> {
        Vec::new()
    }

    /// Releases engine resources. Called once, on the engine thread.
    fn shutdown(&self) {}
}

// ============================================================================
// EngineContext
// ============================================================================

/// What an engine is built with.
#[derive(Clone)]
pub struct EngineContext {
    /// Receives the engine's load events.
    pub monitor: ReadinessMonitor,
    /// Serves the engine's network requests.
    pub gateway: Arc<NetworkGateway>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext").finish_non_exhaustive()
    }
}

/// Builds the engine on the engine thread.
pub type EngineFactory = Box<dyn FnOnce(EngineContext) -> Result<Box<dyn Engine>> + Send>;

// ============================================================================
// EngineHost
// ============================================================================

/// Everything a dispatched task may touch, owned by the engine thread.
pub struct EngineHost {
    engine: Box<dyn Engine>,
    gateway: Arc<NetworkGateway>,
    monitor: ReadinessMonitor,
}

impl EngineHost {
    /// Builds the gateway and the engine.
    pub(crate) fn build(
        gateway: Arc<NetworkGateway>,
        monitor: ReadinessMonitor,
        factory: EngineFactory,
    ) -> Result<Self> {
        let engine = factory(EngineContext {
            monitor: monitor.clone(),
            gateway: Arc::clone(&gateway),
        })?;

        Ok(Self {
            engine,
            gateway,
            monitor,
        })
    }

    /// Returns the engine.
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Returns the network gateway.
    #[inline]
    #[must_use]
    pub fn gateway(&self) -> &NetworkGateway {
        &self.gateway
    }

    /// Returns the readiness monitor.
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &ReadinessMonitor {
        &self.monitor
    }
}

impl Drop for EngineHost {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

// ============================================================================
// Thread-local host
// ============================================================================

thread_local! {
    static CURRENT_HOST: RefCell<Option<Rc<EngineHost>>> = const { RefCell::new(None) };
}

/// Installs the engine thread's host.
pub(crate) fn install(host: Rc<EngineHost>) {
    CURRENT_HOST.with(|current| *current.borrow_mut() = Some(host));
}

/// Removes the engine thread's host, returning it.
pub(crate) fn uninstall() -> Option<Rc<EngineHost>> {
    CURRENT_HOST.with(|current| current.borrow_mut().take())
}

/// Returns the host installed on the calling thread.
pub(crate) fn current() -> Option<Rc<EngineHost>> {
    CURRENT_HOST.with(|current| current.borrow().clone())
}
