//! Worker startup handshake.
//!
//! A worker prints `ready on ports <child>/<parent>/<parentAlt>` once its
//! RPC endpoints are bound. The ports may differ from the requested ones.
//! Every other non-empty output line, before or after, is forwarded to the
//! log with the instance prefix.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::io::{AsyncBufRead, Lines};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::InstanceId;
use crate::transport::PortGroup;

// ============================================================================
// Constants
// ============================================================================

/// Prefix of the worker's ready line.
pub const READY_PREFIX: &str = "ready on ports ";

/// Worker argument carrying the requested `child/parent/parentAlt` ports.
pub const PORTS_FLAG: &str = "--ports";

// ============================================================================
// Ready Line
// ============================================================================

/// Formats the ready line for `ports`.
#[must_use]
pub fn ready_line(ports: PortGroup) -> String {
    format!("{READY_PREFIX}{ports}")
}

/// Parses a ready line; `None` for any other line.
#[must_use]
pub fn parse_ready_line(line: &str) -> Option<PortGroup> {
    line.trim()
        .strip_prefix(READY_PREFIX)
        .and_then(|ports| ports.parse().ok())
}

// ============================================================================
// Output Handling
// ============================================================================

/// Reads worker output until the ready line.
///
/// # Errors
///
/// - [`Error::WorkerExited`] if the output ends first
/// - [`Error::Timeout`] if no ready line arrives within `timeout`
/// - [`Error::Io`] if reading fails
pub async fn await_ready<R>(
    lines: &mut Lines<R>,
    instance: InstanceId,
    timeout: Duration,
) -> Result<PortGroup>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(timeout, read_until_ready(lines, instance))
        .await
        .map_err(|_| Error::timeout("worker startup", timeout.as_millis() as u64))?
}

async fn read_until_ready<R>(lines: &mut Lines<R>, instance: InstanceId) -> Result<PortGroup>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        if let Some(ports) = parse_ready_line(&line) {
            debug!(instance = %instance, ports = %ports, "Worker ready");
            return Ok(ports);
        }
        forward_line(instance, &line);
    }
    Err(Error::worker_exited("output closed before the ready line"))
}

/// Forwards the remaining output until it ends.
pub fn forward_output<R>(mut lines: Lines<R>, instance: InstanceId) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => forward_line(instance, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(instance = %instance, error = %e, "Worker output read failed");
                    break;
                }
            }
        }
        debug!(instance = %instance, "Worker output closed");
    })
}

fn forward_line(instance: InstanceId, line: &str) {
    let line = line.trim_end();
    if !line.is_empty() {
        info!(target: "engine_webdriver::worker", "{} {}", instance.log_prefix(), line);
    }
}

// ============================================================================
// Tests
// ============================================================================
