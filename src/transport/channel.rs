//! Lazily connected outbound channels.
//!
//! Each direction between controller and worker has two channels, a primary
//! one for root calls and an alternate one for reentrant calls. A channel
//! opens its websocket on first use and retries with exponential backoff.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Request, Response};

use super::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Connection attempts before giving up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 15;

/// Delay after the first failed attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound for the delay between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// ============================================================================
// ChannelKind
// ============================================================================

/// Which of the two channels of a direction this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Carries root calls, serialized by the socket lock.
    Primary,
    /// Carries reentrant calls.
    Alternate,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Alternate => f.write_str("alternate"),
        }
    }
}

// ============================================================================
// ConnectPolicy
// ============================================================================

/// Retry schedule for opening a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Connection attempts before giving up.
    pub attempts: u32,
    /// Delay after the first failed attempt; doubles afterwards.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_CONNECT_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl ConnectPolicy {
    /// Delay after failed attempt number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One outbound websocket channel to a fixed loopback port.
pub struct Channel {
    kind: ChannelKind,
    port: u16,
    policy: ConnectPolicy,
    slot: Mutex<Option<Connection>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates an unconnected channel.
    #[must_use]
    pub fn new(kind: ChannelKind, port: u16, policy: ConnectPolicy) -> Self {
        Self {
            kind,
            port,
            policy,
            slot: Mutex::new(None),
        }
    }

    /// Returns the channel kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns the remote port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the websocket URL of the peer.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Returns the open connection, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] after all attempts failed.
    pub async fn connection(&self) -> Result<Connection> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = slot.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        let connection = self.connect_with_retry().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Connects in the background; failures are only logged.
    pub fn warm_up(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = channel.connection().await {
                warn!(kind = %channel.kind, port = channel.port, error = %e, "Channel warm-up failed");
            }
        })
    }

    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns connection errors and [`Error::RequestTimeout`].
    pub async fn send(&self, request: Request, request_timeout: Duration) -> Result<Response> {
        let connection = self.connection().await?;
        connection.send_with_timeout(request, request_timeout).await
    }

    /// Closes the current connection, if any.
    pub async fn close(&self) {
        if let Some(connection) = self.slot.lock().await.take() {
            connection.shutdown();
        }
    }

    async fn connect_with_retry(&self) -> Result<Connection> {
        let url = self.ws_url();
        let mut last_error = String::new();

        for attempt in 0..self.policy.attempts {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    debug!(kind = %self.kind, port = self.port, attempt, "Channel connected");
                    return Ok(Connection::new(ws_stream));
                }
                Err(e) => {
                    last_error = e.to_string();
                    let delay = self.policy.backoff(attempt);
                    debug!(
                        kind = %self.kind,
                        port = self.port,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Channel connect failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }

        Err(Error::connection(format!(
            "{} channel to port {} failed after {} attempts: {last_error}",
            self.kind, self.port, self.policy.attempts
        )))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    fn quick_policy(attempts: u32) -> ConnectPolicy {
        ConnectPolicy {
            attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ConnectPolicy::default();
        assert_eq!(policy.attempts, 15);
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(80));
        assert_eq!(policy.backoff(14), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_until_peer_listens() {
        let port = free_port().await;
        let channel = Channel::new(ChannelKind::Primary, port, quick_policy(40));

        tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("late bind");
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            while ws.next().await.is_some() {}
        });

        let connection = channel.connection().await.expect("eventually connects");
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let port = free_port().await;
        let channel = Channel::new(ChannelKind::Alternate, port, quick_policy(3));

        let err = channel.connection().await.expect_err("nobody listens");
        assert!(err.is_transient());
        assert!(err.to_string().contains("alternate"));
    }
}
