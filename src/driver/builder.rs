//! Builder pattern for driver configuration.
//!
//! Provides a fluent API for configuring and creating [`Driver`] instances.
//!
//! # Example
//!
//! ```no_run
//! use engine_webdriver::{Driver, Settings};
//!
//! # fn example() -> engine_webdriver::Result<()> {
//! let driver = Driver::builder()
//!     .worker("/usr/local/bin/engine-worker")
//!     .settings(Settings::default().with_cache(true))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

use super::core::Driver;
use super::settings::Settings;

// ============================================================================
// Constants
// ============================================================================

/// Default time a worker has to print its ready line.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// DriverBuilder
// ============================================================================

/// Builder for configuring a [`Driver`] instance.
///
/// The worker binary is required; everything else has defaults.
#[derive(Debug, Clone)]
pub struct DriverBuilder {
    /// Path to the worker executable.
    worker: Option<PathBuf>,
    /// Settings handed to every worker.
    settings: Settings,
    /// Extra worker arguments, passed before the port argument.
    args: Vec<String>,
    /// Extra worker environment variables.
    envs: Vec<(String, String)>,
    /// Deadline for the ready line.
    startup_timeout: Duration,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self {
            worker: None,
            settings: Settings::default(),
            args: Vec::new(),
            envs: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

// ============================================================================
// DriverBuilder Implementation
// ============================================================================

impl DriverBuilder {
    /// Creates a new driver builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker executable.
    ///
    /// The executable must call [`run_worker`](crate::run_worker) or an
    /// equivalent that speaks the worker handshake.
    #[inline]
    #[must_use]
    pub fn worker(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker = Some(path.into());
        self
    }

    /// Sets the settings handed to every worker.
    #[inline]
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Adds a worker argument.
    #[inline]
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds a worker environment variable.
    #[inline]
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets how long a worker has to report ready.
    #[inline]
    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Builds the driver.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the worker is missing or the settings are
    ///   invalid
    pub fn build(self) -> Result<Driver> {
        let worker = self.validate_worker()?;
        self.settings.validate()?;
        if self.startup_timeout.is_zero() {
            return Err(Error::config("startup timeout must be greater than zero"));
        }

        Ok(Driver::new(
            worker,
            self.settings,
            self.args,
            self.envs,
            self.startup_timeout,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl DriverBuilder {
    fn validate_worker(&self) -> Result<PathBuf> {
        let worker = self.worker.clone().ok_or_else(|| {
            Error::config(
                "Worker binary path is required. Use .worker() to set it.\n\
                 Example: Driver::builder().worker(\"/usr/local/bin/engine-worker\")",
            )
        })?;

        if !worker.exists() {
            return Err(Error::config(format!(
                "Worker binary not found at: {}",
                worker.display()
            )));
        }

        Ok(worker)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_creates_empty_builder() {
        let builder = DriverBuilder::new();
        assert!(builder.worker.is_none());
        assert_eq!(builder.settings, Settings::default());
        assert_eq!(builder.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
    }

    #[test]
    fn test_fluent_setters() {
        let builder = DriverBuilder::new()
            .worker("/usr/local/bin/engine-worker")
            .arg("--verbose")
            .env("RUST_LOG", "debug")
            .startup_timeout(Duration::from_secs(5));

        assert_eq!(builder.worker, Some(PathBuf::from("/usr/local/bin/engine-worker")));
        assert_eq!(builder.args, vec!["--verbose"]);
        assert_eq!(builder.envs, vec![("RUST_LOG".to_string(), "debug".to_string())]);
        assert_eq!(builder.startup_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_build_fails_without_worker() {
        let err = DriverBuilder::new().build().expect_err("no worker");
        assert!(err.to_string().contains("Worker binary"));
    }

    #[test]
    fn test_build_fails_with_nonexistent_worker() {
        let err = DriverBuilder::new()
            .worker("/nonexistent/engine-worker")
            .build()
            .expect_err("missing");
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let settings = Settings {
            command_timeout_ms: 0,
            ..Settings::default()
        };
        let result = DriverBuilder::new().worker("/bin/sh").settings(settings).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_build_succeeds() {
        let driver = DriverBuilder::new().worker("/bin/sh").build().expect("build");
        assert_eq!(driver.worker(), std::path::Path::new("/bin/sh"));
    }
}
