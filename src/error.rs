//! Error types for the engine driver.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use engine_webdriver::{Browser, Result};
//!
//! fn example(browser: &Browser) -> Result<()> {
//!     let status = browser.get("https://example.com")?;
//!     assert_eq!(status, 200);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Timeout | [`Error::Timeout`], [`Error::RequestTimeout`], [`Error::ConnectionTimeout`] |
//! | Transient I/O | [`Error::Connection`], [`Error::CacheLockTimeout`], [`Error::Io`], [`Error::Http`] |
//! | Protocol/State | [`Error::ExpiredLock`], [`Error::Protocol`], [`Error::UnknownCommand`], [`Error::InvalidArgument`] |
//! | Fatal | [`Error::ProcessLaunchFailed`], [`Error::PortsUnavailable`], [`Error::WorkerExited`], [`Error::EngineShutdown`] |
//! | Execution | [`Error::Script`], [`Error::Engine`], [`Error::TaskPanicked`] |
//! | External | [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{InstanceId, RequestId};
use crate::transport::PortGroup;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when settings are invalid or cannot be loaded.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Fatal Instance Errors
    // ========================================================================
    /// Failed to launch the worker process.
    #[error("Failed to launch worker: {message}")]
    ProcessLaunchFailed {
        /// Description of the launch failure.
        message: String,
    },

    /// The ports of a group could not be bound.
    #[error("Ports unavailable: {ports}")]
    PortsUnavailable {
        /// The port group that could not be bound.
        ports: PortGroup,
    },

    /// The worker process exited or its watchdog fired.
    #[error("Worker exited: {message}")]
    WorkerExited {
        /// Description of the exit.
        message: String,
    },

    /// The engine thread is no longer running.
    #[error("Engine thread has shut down")]
    EngineShutdown,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out establishing a connection.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol / State Errors
    // ========================================================================
    /// A call was made through a socket lock whose instance was torn down.
    #[error("Socket lock expired for instance {instance}")]
    ExpiredLock {
        /// Instance the lock belonged to.
        instance: InstanceId,
    },

    /// Unknown command method.
    #[error("Unknown command: {command}")]
    UnknownCommand {
        /// The unrecognized command method.
        command: String,
    },

    /// Invalid argument in command params.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Protocol violation or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// JavaScript execution error reported by the engine.
    #[error("Script error: {message}")]
    Script {
        /// Error message from script execution.
        message: String,
    },

    /// Error reported by the rendering engine.
    #[error("Engine error: {message}")]
    Engine {
        /// Error message from the engine.
        message: String,
    },

    /// A dispatched task panicked on the engine thread.
    #[error("Task panicked: {message}")]
    TaskPanicked {
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// RPC request timeout.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Error raised in the peer process that has no local category.
    #[error("Remote error ({code}): {message}")]
    Remote {
        /// Wire code sent by the peer.
        code: String,
        /// Message sent by the peer.
        message: String,
    },

    // ========================================================================
    // Cache Errors
    // ========================================================================
    /// A cache file lock could not be acquired after all retries.
    #[error("Could not lock cache file {path} after {attempts} attempts")]
    CacheLockTimeout {
        /// Cache file path.
        path: PathBuf,
        /// Number of attempts made.
        attempts: u32,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a process launch failed error.
    #[inline]
    pub fn process_launch_failed(err: IoError) -> Self {
        Self::ProcessLaunchFailed {
            message: err.to_string(),
        }
    }

    /// Creates a ports unavailable error.
    #[inline]
    pub fn ports_unavailable(ports: PortGroup) -> Self {
        Self::PortsUnavailable { ports }
    }

    /// Creates a worker exited error.
    #[inline]
    pub fn worker_exited(message: impl Into<String>) -> Self {
        Self::WorkerExited {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates an expired lock error.
    #[inline]
    pub fn expired_lock(instance: InstanceId) -> Self {
        Self::ExpiredLock { instance }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a script error.
    #[inline]
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
        }
    }

    /// Creates an engine error.
    #[inline]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a cache lock timeout error.
    #[inline]
    pub fn cache_lock_timeout(path: impl Into<PathBuf>, attempts: u32) -> Self {
        Self::CacheLockTimeout {
            path: path.into(),
            attempts,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` for I/O failures that were retried before surfacing.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::CacheLockTimeout { .. }
                | Self::Io(_)
                | Self::Http(_)
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error terminates the browser instance.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProcessLaunchFailed { .. }
                | Self::PortsUnavailable { .. }
                | Self::WorkerExited { .. }
                | Self::EngineShutdown
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_timeout() || self.is_transient()
    }
}

// ============================================================================
// Wire Codes
// ============================================================================

impl Error {
    /// Returns the stable code used when this error crosses the process boundary.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::ProcessLaunchFailed { .. } => "process launch failed",
            Self::PortsUnavailable { .. } => "ports unavailable",
            Self::WorkerExited { .. } => "worker exited",
            Self::EngineShutdown => "engine shutdown",
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_) => "connection",
            Self::ConnectionTimeout { .. } => "connection timeout",
            Self::ExpiredLock { .. } => "expired lock",
            Self::UnknownCommand { .. } => "unknown command",
            Self::InvalidArgument { .. } => "invalid argument",
            Self::Protocol { .. } | Self::Json(_) => "protocol",
            Self::Script { .. } => "script error",
            Self::Engine { .. } => "engine error",
            Self::TaskPanicked { .. } => "task panicked",
            Self::Timeout { .. } | Self::RequestTimeout { .. } => "timeout",
            Self::CacheLockTimeout { .. } => "cache lock",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::ChannelClosed(_) => "channel closed",
            Self::Remote { .. } => "remote",
        }
    }

    /// Rebuilds an error received from the peer process.
    ///
    /// Codes belonging to the public taxonomy keep their category; anything
    /// else is wrapped in [`Error::Remote`].
    #[must_use]
    pub fn from_remote(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "config" => Self::Config { message },
            "timeout" => Self::Timeout {
                operation: message,
                timeout_ms: 0,
            },
            "connection" => Self::Connection { message },
            "unknown command" => Self::UnknownCommand { command: message },
            "invalid argument" => Self::InvalidArgument { message },
            "protocol" => Self::Protocol { message },
            "script error" => Self::Script { message },
            "engine error" => Self::Engine { message },
            "task panicked" => Self::TaskPanicked { message },
            "worker exited" => Self::WorkerExited { message },
            "engine shutdown" => Self::EngineShutdown,
            _ => Self::Remote {
                code: code.to_string(),
                message,
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("failed to connect");
        assert_eq!(err.to_string(), "Connection failed: failed to connect");
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timeout("navigate", 5000);
        let other_err = Error::connection("test");

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_taxonomy_predicates() {
        assert!(Error::cache_lock_timeout("/tmp/x", 50).is_transient());
        assert!(Error::EngineShutdown.is_fatal());
        assert!(!Error::expired_lock(InstanceId::new(1)).is_recoverable());
        assert!(Error::timeout("x", 1).is_recoverable());
    }

    #[test]
    fn test_remote_round_trip_keeps_category() {
        let err = Error::script("undefined is not a function");
        let rebuilt = Error::from_remote(err.code(), "undefined is not a function");
        assert!(matches!(rebuilt, Error::Script { .. }));

        let rebuilt = Error::from_remote(Error::timeout("get", 10).code(), "get");
        assert!(rebuilt.is_timeout());
    }

    #[test]
    fn test_remote_unknown_code_is_wrapped() {
        let err = Error::from_remote("something new", "boom");
        assert!(matches!(err, Error::Remote { ref code, .. } if code == "something new"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
