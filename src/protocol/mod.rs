//! RPC message types.
//!
//! This module defines the messages exchanged between the controller and
//! a worker process over the transport channels.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | caller → callee | Command request |
//! | `Response` | callee → caller | Command result or error |
//!
//! Both processes act as caller and callee: the controller drives the
//! browser, the worker calls back while a command is running.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command definitions by module |
//! | `request` | Request and Response types |

// ============================================================================
// Submodules
// ============================================================================

/// Command definitions organized by module.
pub mod command;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{
    BrowserCommand, CacheCommand, CallbackCommand, Command, CookieCommand, ScriptCommand,
    SessionCommand,
};
pub use request::{Request, Response, ResponseType};
