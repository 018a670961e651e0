//! Outbound side of one direction between controller and worker.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Result;
use crate::protocol::{Command, Request, SessionCommand};

use super::{CallContext, Channel, ChannelKind, ConnectPolicy, SocketLock};

// ============================================================================
// Endpoint
// ============================================================================

/// Routes outbound calls to the primary or alternate channel.
///
/// Root calls hold the instance's [`SocketLock`] and use the primary
/// channel. Reentrant calls skip the lock and use the alternate channel, so
/// they never wait behind the call they are nested in.
#[derive(Debug)]
pub struct Endpoint {
    lock: Arc<SocketLock>,
    primary: Arc<Channel>,
    alternate: Arc<Channel>,
    timeout: Duration,
}

impl Endpoint {
    /// Creates an endpoint with the default connect policy.
    #[must_use]
    pub fn new(lock: Arc<SocketLock>, primary_port: u16, alternate_port: u16, timeout: Duration) -> Self {
        Self::with_policy(lock, primary_port, alternate_port, timeout, ConnectPolicy::default())
    }

    /// Creates an endpoint with a custom connect policy.
    #[must_use]
    pub fn with_policy(
        lock: Arc<SocketLock>,
        primary_port: u16,
        alternate_port: u16,
        timeout: Duration,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            lock,
            primary: Arc::new(Channel::new(ChannelKind::Primary, primary_port, policy)),
            alternate: Arc::new(Channel::new(ChannelKind::Alternate, alternate_port, policy)),
            timeout,
        }
    }

    /// Returns the socket lock.
    #[inline]
    #[must_use]
    pub fn lock(&self) -> &Arc<SocketLock> {
        &self.lock
    }

    /// Returns the default call timeout.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens both channels in the background.
    pub fn warm_up(&self) {
        self.primary.warm_up();
        self.alternate.warm_up();
    }

    /// Calls the peer with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call(&self, ctx: CallContext, command: Command) -> Result<Value> {
        self.call_with_timeout(ctx, command, self.timeout).await
    }

    /// Calls the peer and returns the result value.
    ///
    /// # Errors
    ///
    /// - [`Error::ExpiredLock`](crate::Error::ExpiredLock) if the instance was torn down
    /// - [`Error::Connection`](crate::Error::Connection) if the channel cannot be opened
    /// - [`Error::RequestTimeout`](crate::Error::RequestTimeout) if no response arrives in time
    /// - Any error returned by the peer's handler
    pub async fn call_with_timeout(
        &self,
        ctx: CallContext,
        command: Command,
        call_timeout: Duration,
    ) -> Result<Value> {
        self.lock.check()?;
        let request = Request::new(ctx.depth(), command);
        trace!(id = %request.id, depth = ctx.depth(), "Outbound call");

        if ctx.is_reentrant() {
            debug!(id = %request.id, depth = ctx.depth(), "Reentrant call on alternate channel");
            return self.alternate.send(request, call_timeout).await?.into_result();
        }

        let _guard = self.lock.acquire().await?;
        self.primary.send(request, call_timeout).await?.into_result()
    }

    /// Sends a liveness ping without waiting for the socket lock.
    ///
    /// Pings use the alternate channel, so a long command holding the lock
    /// on the primary channel cannot hold them back.
    ///
    /// # Errors
    ///
    /// - [`Error::ExpiredLock`](crate::Error::ExpiredLock) if the instance was torn down
    /// - [`Error::Connection`](crate::Error::Connection) if the channel cannot be opened
    /// - [`Error::RequestTimeout`](crate::Error::RequestTimeout) if no response arrives in time
    pub async fn ping(&self, call_timeout: Duration) -> Result<Value> {
        self.lock.check()?;
        let request = Request::new(0, Command::Session(SessionCommand::Heartbeat));
        trace!(id = %request.id, "Ping");
        self.alternate.send(request, call_timeout).await?.into_result()
    }

    /// Expires the lock and closes both channels.
    pub async fn close(&self) {
        self.lock.expire();
        self.primary.close().await;
        self.alternate.close().await;
    }
}
