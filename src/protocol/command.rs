//! Command definitions organized by module.
//!
//! Commands follow the `module.methodName` format.
//!
//! # Command Modules
//!
//! | Module | Direction | Commands |
//! |--------|-----------|----------|
//! | `browser` | controller → worker | Navigation, page state, screenshots, timeouts |
//! | `script` | controller → worker | Script execution |
//! | `cookies` | controller → worker | Cookie jar access |
//! | `cache` | controller → worker | Disk cache maintenance |
//! | `session` | controller → worker | Heartbeat, shutdown |
//! | `callback` | worker → controller | Notifications raised while a command runs |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Command Wrapper
// ============================================================================

/// All protocol commands organized by module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// Browser module commands.
    Browser(BrowserCommand),
    /// Script module commands.
    Script(ScriptCommand),
    /// Cookies module commands.
    Cookies(CookieCommand),
    /// Cache module commands.
    Cache(CacheCommand),
    /// Session module commands.
    Session(SessionCommand),
    /// Callback module commands.
    Callback(CallbackCommand),
}

impl Command {
    /// Returns the `module.methodName` of this command.
    #[must_use]
    pub fn method(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default()
    }
}

// ============================================================================
// Browser Commands
// ============================================================================

/// Navigation and page state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum BrowserCommand {
    /// Navigate and wait until the page settles.
    #[serde(rename = "browser.get")]
    Get {
        /// URL to navigate to.
        url: String,
    },

    /// Reload and wait until the page settles.
    #[serde(rename = "browser.refresh")]
    Refresh,

    /// Stop loading.
    #[serde(rename = "browser.stop")]
    Stop,

    /// Get current URL.
    #[serde(rename = "browser.currentUrl")]
    CurrentUrl,

    /// Get page title.
    #[serde(rename = "browser.title")]
    Title,

    /// Get serialized DOM.
    #[serde(rename = "browser.pageSource")]
    PageSource,

    /// Capture the viewport as PNG (base64 in the result).
    #[serde(rename = "browser.screenshot")]
    Screenshot,

    /// Get the status of the last navigation.
    #[serde(rename = "browser.statusCode")]
    StatusCode,

    /// Change navigation and script deadlines.
    #[serde(rename = "browser.setTimeouts")]
    SetTimeouts {
        /// Navigation deadline in milliseconds.
        #[serde(rename = "pageLoadMs", default, skip_serializing_if = "Option::is_none")]
        page_load_ms: Option<u64>,
        /// Script deadline in milliseconds.
        #[serde(rename = "scriptMs", default, skip_serializing_if = "Option::is_none")]
        script_ms: Option<u64>,
    },
}

// ============================================================================
// Script Commands
// ============================================================================

/// JavaScript execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ScriptCommand {
    /// Execute a script synchronously.
    #[serde(rename = "script.execute")]
    Execute {
        /// Script source.
        script: String,
        /// Script arguments.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Execute a script that acts on the page and wait for the page to settle.
    #[serde(rename = "script.executeAction")]
    Action {
        /// Script source.
        script: String,
        /// Script arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
}

// ============================================================================
// Cookie Commands
// ============================================================================

/// Cookie jar access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum CookieCommand {
    /// Store a `Set-Cookie` style cookie for a URL.
    #[serde(rename = "cookies.add")]
    Add {
        /// URL the cookie applies to.
        url: String,
        /// Cookie in `Set-Cookie` syntax.
        cookie: String,
    },

    /// Get the `Cookie` header sent to a URL.
    #[serde(rename = "cookies.header")]
    Header {
        /// Target URL.
        url: String,
    },
}

// ============================================================================
// Cache Commands
// ============================================================================

/// Disk cache maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum CacheCommand {
    /// Remove every entry.
    #[serde(rename = "cache.clear")]
    Clear,
}

// ============================================================================
// Session Commands
// ============================================================================

/// Worker lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum SessionCommand {
    /// Liveness ping.
    #[serde(rename = "session.heartbeat")]
    Heartbeat,

    /// Shut the worker down.
    #[serde(rename = "session.quit")]
    Quit,
}

// ============================================================================
// Callback Commands
// ============================================================================

/// Calls from the worker back into the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum CallbackCommand {
    /// The engine opened a popup window.
    #[serde(rename = "callback.popupOpened")]
    PopupOpened {
        /// Popup URL.
        url: String,
    },
}

// ============================================================================
// Tests
// ============================================================================
