//! Controller: launches worker processes and attaches to them.
//!
//! The [`Driver`] owns the settings every worker receives and the
//! [`PortAllocator`] that keeps the instances' port groups apart.
//!
//! # Example
//!
//! ```no_run
//! use engine_webdriver::Driver;
//!
//! # async fn example() -> engine_webdriver::Result<()> {
//! let driver = Driver::builder()
//!     .worker("/usr/local/bin/engine-worker")
//!     .build()?;
//!
//! let browser = driver.launch().await?;
//! browser.get("https://example.com").await?;
//! browser.quit().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::browser::RemoteBrowser;
use crate::browser::remote::{Attachment, ControllerCallbacks};
use crate::error::{Error, Result};
use crate::identifiers::InstanceId;
use crate::transport::{PortAllocator, PortGroup, RpcServer, RpcService};

use super::builder::DriverBuilder;
use super::handshake::{self, PORTS_FLAG};
use super::settings::{SETTINGS_ENV, Settings};

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for the driver.
pub(crate) struct DriverInner {
    /// Worker executable.
    pub worker: PathBuf,
    /// Settings handed to every worker.
    pub settings: Settings,
    /// Extra worker arguments.
    pub args: Vec<String>,
    /// Extra worker environment variables.
    pub envs: Vec<(String, String)>,
    /// Deadline for the ready line.
    pub startup_timeout: Duration,
    /// Port groups in use by live instances.
    pub allocator: Arc<PortAllocator>,
}

// ============================================================================
// Driver
// ============================================================================

/// Launches browser instances in worker processes.
///
/// Cloning is cheap and shares the port allocator.
#[derive(Clone)]
pub struct Driver {
    pub(crate) inner: Arc<DriverInner>,
}

// ============================================================================
// Driver - Display
// ============================================================================

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("worker", &self.inner.worker)
            .field("reserved_ports", &self.reserved_ports())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Driver - Public API
// ============================================================================

impl Driver {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    /// Returns the worker executable.
    #[inline]
    #[must_use]
    pub fn worker(&self) -> &Path {
        &self.inner.worker
    }

    /// Returns the settings handed to every worker.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Number of ports reserved by live instances.
    #[inline]
    #[must_use]
    pub fn reserved_ports(&self) -> usize {
        self.inner.allocator.reserved()
    }

    /// Starts a worker process and returns its browser.
    ///
    /// # Errors
    ///
    /// - [`Error::PortsUnavailable`] if no port group can be bound
    /// - [`Error::ProcessLaunchFailed`] if the worker cannot be started
    /// - [`Error::WorkerExited`] if it exits before reporting ready
    /// - [`Error::Timeout`] if it does not report ready in time
    pub async fn launch(&self) -> Result<RemoteBrowser> {
        let instance = InstanceId::next();
        let reserved = self.inner.allocator.allocate()?;
        debug!(instance = %instance, ports = %reserved, "Launching worker");

        match self.launch_instance(instance, reserved).await {
            Ok(browser) => {
                info!(instance = %instance, ports = %browser.ports(), "Worker launched");
                Ok(browser)
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "Worker launch failed");
                if !reserved.is_ephemeral() {
                    self.inner.allocator.release(reserved);
                }
                Err(e)
            }
        }
    }
}

// ============================================================================
// Driver - Internal API
// ============================================================================

impl Driver {
    pub(crate) fn new(
        worker: PathBuf,
        settings: Settings,
        args: Vec<String>,
        envs: Vec<(String, String)>,
        startup_timeout: Duration,
    ) -> Self {
        let allocator = Arc::new(PortAllocator::new(settings.port_range));
        debug!(worker = %worker.display(), range = ?settings.port_range, "Driver created");

        Self {
            inner: Arc::new(DriverInner {
                worker,
                settings,
                args,
                envs,
                startup_timeout,
                allocator,
            }),
        }
    }

    async fn launch_instance(&self, instance: InstanceId, reserved: PortGroup) -> Result<RemoteBrowser> {
        let callbacks = Arc::new(ControllerCallbacks::default());
        let service: Arc<dyn RpcService> = callbacks.clone();

        let parent = bind_callback_server(reserved.parent(), &service, reserved).await?;
        let parent_alt = bind_callback_server(reserved.parent_alt(), &service, reserved).await?;
        let requested = PortGroup::new(reserved.child(), parent.port(), parent_alt.port());

        let mut child = self.spawn_worker(requested)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::protocol("Worker stdout was not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let ports =
            handshake::await_ready(&mut lines, instance, self.inner.startup_timeout).await?;
        if ports.parent() != requested.parent() || ports.parent_alt() != requested.parent_alt() {
            warn!(
                instance = %instance,
                requested = %requested,
                reported = %ports,
                "Worker reported different callback ports"
            );
        }
        let _ = handshake::forward_output(lines, instance);

        Ok(RemoteBrowser::attach(
            Attachment {
                instance,
                ports,
                reserved,
                allocator: Arc::clone(&self.inner.allocator),
                servers: vec![parent, parent_alt],
                callbacks,
                child: Some(child),
            },
            &self.inner.settings,
        ))
    }

    fn spawn_worker(&self, requested: PortGroup) -> Result<Child> {
        let settings = self.inner.settings.to_json()?;

        let mut cmd = Command::new(&self.inner.worker);
        cmd.args(&self.inner.args)
            .arg(PORTS_FLAG)
            .arg(requested.to_string())
            .envs(self.inner.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(SETTINGS_ENV, settings)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(Error::process_launch_failed)?;
        debug!(pid = child.id(), ports = %requested, "Worker process spawned");
        Ok(child)
    }
}

async fn bind_callback_server(
    port: u16,
    service: &Arc<dyn RpcService>,
    reserved: PortGroup,
) -> Result<RpcServer> {
    RpcServer::bind(port, Arc::clone(service)).await.map_err(|e| {
        warn!(port, error = %e, "Callback server bind failed");
        Error::ports_unavailable(reserved)
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(script: &str) -> Driver {
        Driver::builder()
            .worker("/bin/sh")
            .arg("-c")
            .arg(script)
            .settings(Settings::default().with_heartbeat(false))
            .startup_timeout(Duration::from_secs(5))
            .build()
            .expect("build")
    }

    #[test]
    fn test_driver_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<Driver>();
    }

    #[test]
    fn test_driver_is_debug() {
        fn assert_debug<T: std::fmt::Debug>() {}
        assert_debug::<Driver>();
    }

    #[tokio::test]
    async fn test_launch_reads_reported_ports() {
        let driver = driver("echo booting; echo 'ready on ports 40001/40002/40003'; sleep 5");

        let browser = driver.launch().await.expect("launch");
        assert_eq!(browser.ports(), PortGroup::new(40001, 40002, 40003));
        assert!(!browser.is_closed());
        drop(browser);
    }

    #[tokio::test]
    async fn test_launch_fails_when_worker_exits_early() {
        let driver = driver("echo 'something went wrong'; exit 1");

        let err = driver.launch().await.expect_err("no ready line");
        assert!(matches!(err, Error::WorkerExited { .. }));
        assert_eq!(driver.reserved_ports(), 0);
    }

    #[tokio::test]
    async fn test_launch_reports_spawn_failure() {
        let driver = driver("exit 0");
        let broken = Driver::new(
            PathBuf::from("/nonexistent/engine-worker"),
            driver.settings().clone(),
            Vec::new(),
            Vec::new(),
            Duration::from_secs(1),
        );

        let err = broken.launch().await.expect_err("spawn fails");
        assert!(matches!(err, Error::ProcessLaunchFailed { .. }));
    }
}
