//! Controller side: configuration and worker process management.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Driver`] | Launches worker processes |
//! | [`DriverBuilder`] | Fluent configuration builder |
//! | [`Settings`] | Configuration threaded through every component |
//!
//! # Example
//!
//! ```no_run
//! use engine_webdriver::{Driver, Result, Settings};
//!
//! # async fn example() -> Result<()> {
//! let driver = Driver::builder()
//!     .worker("/usr/local/bin/engine-worker")
//!     .settings(Settings::default().with_quick_render(true))
//!     .build()?;
//!
//! let browser = driver.launch().await?;
//! browser.get("https://example.com").await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for driver configuration.
pub mod builder;

/// Core driver implementation.
pub mod core;

/// Worker startup handshake.
pub mod handshake;

/// Driver configuration.
pub mod settings;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::{DEFAULT_STARTUP_TIMEOUT, DriverBuilder};
pub use core::Driver;
pub use handshake::{PORTS_FLAG, READY_PREFIX, parse_ready_line, ready_line};
pub use settings::{SETTINGS_ENV, Settings};
