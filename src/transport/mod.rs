//! Process transport between controller and worker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐                         ┌──────────────────────┐
//! │      Controller      │                         │        Worker        │
//! │                      │  primary   ──► child    │                      │
//! │  Endpoint ───────────┼─────────────────────────┼──► RpcServer         │
//! │                      │  alternate ──► child    │                      │
//! │                      │                         │                      │
//! │  RpcServer (parent) ◄┼─────────────────────────┼── Endpoint primary   │
//! │  RpcServer (alt)    ◄┼─────────────────────────┼── Endpoint alternate │
//! └──────────────────────┘                         └──────────────────────┘
//! ```
//!
//! Root calls serialize on the instance's [`SocketLock`] and travel on the
//! primary channel. A call made while serving an inbound call carries a
//! nested [`CallContext`] and travels on the alternate channel, so a
//! callback never waits for the call that triggered it.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Lazily connected outbound channel with retry |
//! | `connection` | WebSocket connection and response correlation |
//! | `context` | Call-depth tagging |
//! | `endpoint` | Primary/alternate routing |
//! | `heartbeat` | Controller pings, worker watchdog |
//! | `ports` | Port groups and allocation |
//! | `server` | Inbound websocket server |
//! | `socket_lock` | Per-instance lock with expiry |

// ============================================================================
// Submodules
// ============================================================================

/// Lazily connected outbound channel.
pub mod channel;

/// WebSocket connection and response correlation.
pub mod connection;

/// Call-depth tagging.
pub mod context;

/// Primary/alternate routing.
pub mod endpoint;

/// Controller pings and worker watchdog.
pub mod heartbeat;

/// Port groups and allocation.
pub mod ports;

/// Inbound websocket server.
pub mod server;

/// Per-instance socket lock.
pub mod socket_lock;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Channel, ChannelKind, ConnectPolicy, MAX_CONNECT_ATTEMPTS};
pub use connection::Connection;
pub use context::CallContext;
pub use endpoint::Endpoint;
pub use heartbeat::{HEARTBEAT_INTERVAL, Heartbeat, WATCHDOG_TIMEOUT, Watchdog};
pub use ports::{PortAllocator, PortGroup, PortRange};
pub use server::{RpcServer, RpcService};
pub use socket_lock::{SocketGuard, SocketLock};

// ============================================================================
// Tests
// ============================================================================
