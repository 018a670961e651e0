//! Browser entities module.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Browser`] | Synchronous API of a browser hosted in this process |
//! | [`RemoteBrowser`] | Async handle of a browser in a worker process |
//! | [`CommandDispatcher`] | Runs tasks on the engine thread |
//! | [`Engine`] | Boundary to the rendering engine |
//!
//! # Example
//!
//! ```ignore
//! use engine_webdriver::{Browser, Settings};
//!
//! let browser = Browser::launch(&Settings::default(), |ctx| my_engine::build(ctx))?;
//! browser.get("https://example.com")?;
//! let value = browser.execute_script("return document.links.length", vec![])?;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Engine thread and task dispatch.
pub mod dispatcher;

/// Rendering engine boundary.
pub mod engine;

/// Proxy configuration types.
pub mod proxy;

/// Controller-side handle of a worker's browser.
pub mod remote;

/// Synchronous automation API.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use dispatcher::{CommandDispatcher, ExecOptions};
pub use engine::{Engine, EngineContext, EngineFactory, EngineHost};
pub use proxy::{ProxyConfig, ProxyType};
pub use remote::RemoteBrowser;
pub use session::{Browser, Timeouts};
