//! Inbound side: a websocket server dispatching requests to a service.
//!
//! # Connection Flow
//!
//! 1. [`RpcServer::bind`] binds `127.0.0.1:{port}` (0 for a random port)
//! 2. The accept loop upgrades each TCP connection to a websocket
//! 3. Every request is handled on its own task, so a handler that calls
//!    back into the peer never blocks the connection it arrived on
//! 4. Responses are written back on the same connection

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, from_str, to_string};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Command, Request, Response};

use super::CallContext;

// ============================================================================
// Constants
// ============================================================================

/// Accept poll interval, bounds how long shutdown takes to be noticed.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// RpcService
// ============================================================================

/// Handles inbound commands.
///
/// `ctx` is the context of the handler: any call the handler makes back to
/// the peer must use it, which makes that call reentrant.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handles one command.
    ///
    /// # Errors
    ///
    /// Errors are sent back to the caller with their wire code.
    async fn handle(&self, ctx: CallContext, command: Command) -> Result<Value>;
}

// ============================================================================
// RpcServer
// ============================================================================

/// A bound websocket server serving an [`RpcService`].
///
/// The accept loop and every connection stop on [`shutdown`](Self::shutdown)
/// or drop.
pub struct RpcServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
}

impl RpcServer {
    /// Binds the server and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(port: u16, service: Arc<dyn RpcService>) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let listener = TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(accept_loop(
            listener,
            service,
            Arc::clone(&shutdown),
            Arc::clone(&connections),
        ));

        info!(port = actual_port, "RPC server bound");

        Ok(Self {
            port: actual_port,
            shutdown,
            connections,
        })
    }

    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the WebSocket URL for this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
        debug!(port = self.port, "RPC server shut down");
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
) {
    debug!("Accept loop started");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Accept with timeout to allow checking shutdown flag
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let service = Arc::clone(&service);
                let task = tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, addr, service).await {
                        warn!(error = %e, ?addr, "Connection handling failed");
                    }
                });

                let mut handles = connections.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(task.abort_handle());
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("Accept loop terminated");
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: Arc<dyn RpcService>,
) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;
    debug!(?addr, "WebSocket connection established");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let json = match to_string(&response) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize response");
                    continue;
                }
            };
            if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                warn!(error = %e, "Failed to send response");
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(message) = ws_read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let request = match from_str::<Request>(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, text = %text, "Unparseable request");
                        continue;
                    }
                };

                let service = Arc::clone(&service);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let id = request.id;
                    let method = request.command.method();
                    let ctx = CallContext::serving(request.depth);
                    trace!(%id, %method, depth = ctx.depth(), "Inbound call");

                    let response = match service.handle(ctx, request.command).await {
                        Ok(value) => Response::success(id, value),
                        Err(e) => {
                            debug!(%id, %method, error = %e, "Handler failed");
                            Response::failure(id, &e)
                        }
                    };
                    let _ = response_tx.send(response);
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, ?addr, "WebSocket read failed");
                break;
            }
        }
    }

    drop(response_tx);
    let _ = writer.await;
    debug!(?addr, "Connection closed");
    Ok(())
}
