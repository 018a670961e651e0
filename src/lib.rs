//! Engine WebDriver - WebDriver-style automation of an embedded rendering engine.
//!
//! This library is the driver core around an event-driven rendering engine
//! that must be driven from a single thread and reports navigation progress
//! only through asynchronous events.
//!
//! # Architecture
//!
//! The driver follows a controller/worker model:
//!
//! - **Controller**: a [`Driver`] launches worker processes and hands out
//!   [`RemoteBrowser`] handles
//! - **Worker**: hosts one [`Browser`] and serves it over a websocket RPC
//!   channel (see [`run_worker`])
//!
//! Inside a worker:
//!
//! - Every engine call runs on the engine thread through the
//!   [`CommandDispatcher`](browser::CommandDispatcher)
//! - A [`ReadinessMonitor`](readiness::ReadinessMonitor) infers when a page
//!   and its follow-up requests have settled
//! - Every engine request goes through the
//!   [`NetworkGateway`](network::NetworkGateway), which blocks ads, applies
//!   the [`DiskCache`](cache::DiskCache) and rewrites bodies
//!
//! # Quick Start
//!
//! ```no_run
//! use engine_webdriver::{Driver, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let driver = Driver::builder()
//!         .worker("/usr/local/bin/engine-worker")
//!         .build()?;
//!
//!     let browser = driver.launch().await?;
//!     let status = browser.get("https://example.com").await?;
//!     println!("{status}: {}", browser.title().await?);
//!
//!     browser.quit().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`browser`] | [`Browser`], [`RemoteBrowser`], dispatcher, engine boundary |
//! | [`cache`] | Cross-process disk cache |
//! | [`driver`] | [`Driver`], [`Settings`], worker handshake |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`network`] | Request gateway, HTTP clients, body transforms |
//! | [`protocol`] | RPC message types |
//! | [`readiness`] | Page-load readiness detection |
//! | [`transport`] | Controller/worker transport |

// ============================================================================
// Modules
// ============================================================================

/// Browser entities: Browser, RemoteBrowser, dispatcher.
pub mod browser;

/// Cross-process disk cache.
pub mod cache;

/// Driver factory and configuration.
///
/// Use [`Driver::builder()`] to create a configured driver instance.
pub mod driver;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Request gateway between the engine and the network.
pub mod network;

/// RPC message types.
pub mod protocol;

/// Page-load readiness detection.
pub mod readiness;

/// Controller/worker transport.
pub mod transport;

/// Worker process host.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

// Browser types
pub use browser::{
    Browser, CommandDispatcher, Engine, EngineContext, ExecOptions, ProxyConfig, ProxyType,
    RemoteBrowser, Timeouts,
};

// Subsystems
pub use cache::DiskCache;
pub use network::NetworkGateway;
pub use readiness::{LoadEvent, ReadinessMonitor};

// Driver types
pub use driver::{Driver, DriverBuilder, SETTINGS_ENV, Settings};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{FrameId, InstanceId, RequestId};

// Transport types
pub use transport::PortGroup;

// Worker
pub use worker::{WorkerHost, run_worker};
