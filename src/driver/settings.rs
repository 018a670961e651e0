//! Driver configuration.
//!
//! One [`Settings`] value is created by the controller and threaded through
//! every component constructor. The worker process receives the same value
//! as JSON in the [`SETTINGS_ENV`] environment variable.
//!
//! # Example
//!
//! ```ignore
//! use engine_webdriver::Settings;
//!
//! let settings = Settings::default()
//!     .with_ajax_wait_ms(300)
//!     .with_cache(true)
//!     .with_quick_render(true);
//! settings.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::browser::ProxyConfig;
use crate::error::{Error, Result};
use crate::transport::PortRange;

// ============================================================================
// Constants
// ============================================================================

/// Environment variable carrying serialized settings to the worker.
pub const SETTINGS_ENV: &str = "EWD_SETTINGS";

/// Prefix of individual setting overrides.
const ENV_PREFIX: &str = "EWD_";

// ============================================================================
// Settings
// ============================================================================

/// Configuration consumed by the driver core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Quiet period after which a page counts as idle.
    pub ajax_wait_ms: u64,
    /// In-flight resources older than this are ignored.
    pub ajax_resource_timeout_ms: u64,
    /// Upper bound of one idle-detection round.
    pub max_ajax_wait_ms: u64,

    /// Default deadline of one dispatched command.
    pub command_timeout_ms: u64,
    /// Navigation deadline; `0` uses the command timeout.
    pub page_load_timeout_ms: u64,
    /// Script deadline; `0` uses the command timeout.
    pub script_timeout_ms: u64,

    /// Enables the disk cache.
    pub cache: bool,
    /// Persistent cache directory; a temporary one is used when unset.
    pub cache_dir: Option<PathBuf>,
    /// Entry count above which the oldest entries are evicted.
    pub cache_entries: usize,
    /// Largest cached body in bytes.
    pub cache_entry_size: usize,

    /// Upstream proxy.
    pub proxy: ProxyConfig,
    /// Enables ad-host filtering.
    pub ad_block: bool,
    /// Extra hosts-file formatted block list.
    pub ad_hosts_file: Option<PathBuf>,
    /// Drops media bodies.
    pub quick_render: bool,
    /// Saves `Content-Disposition: attachment` bodies to disk.
    pub save_attachments: bool,
    /// Saves media bodies to disk.
    pub save_media: bool,
    /// HTML fragment injected into the `<head>` of every document.
    pub head_script: Option<String>,
    /// Headers added to every request.
    pub request_headers: Vec<(String, String)>,

    /// TCP connect timeout; `0` disables it.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout; `0` disables it.
    pub socket_timeout_ms: u64,
    /// Requests in flight across all hosts; `0` is unbounded.
    pub max_connections: usize,
    /// Idle pooled connections kept per host.
    pub max_route_connections: usize,
    /// Accepts invalid TLS certificates.
    pub trust_all_certs: bool,

    /// Ports handed out to worker instances; ephemeral when unset.
    pub port_range: Option<PortRange>,
    /// Pings workers and lets them exit when pings stop.
    pub heartbeat: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ajax_wait_ms: 150,
            ajax_resource_timeout_ms: 2000,
            max_ajax_wait_ms: 15_000,
            command_timeout_ms: 30_000,
            page_load_timeout_ms: 0,
            script_timeout_ms: 0,
            cache: false,
            cache_dir: None,
            cache_entries: 10_000,
            cache_entry_size: 1024 * 1024,
            proxy: ProxyConfig::direct(),
            ad_block: true,
            ad_hosts_file: None,
            quick_render: false,
            save_attachments: false,
            save_media: false,
            head_script: None,
            request_headers: Vec::new(),
            connect_timeout_ms: 30_000,
            socket_timeout_ms: 0,
            max_connections: 3000,
            max_route_connections: 8,
            trust_all_certs: false,
            port_range: None,
            heartbeat: true,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl Settings {
    /// Sets the idle quiet period.
    #[inline]
    #[must_use]
    pub fn with_ajax_wait_ms(mut self, ms: u64) -> Self {
        self.ajax_wait_ms = ms;
        self
    }

    /// Sets the in-flight resource timeout.
    #[inline]
    #[must_use]
    pub fn with_ajax_resource_timeout_ms(mut self, ms: u64) -> Self {
        self.ajax_resource_timeout_ms = ms;
        self
    }

    /// Sets the default command deadline.
    #[inline]
    #[must_use]
    pub fn with_command_timeout_ms(mut self, ms: u64) -> Self {
        self.command_timeout_ms = ms;
        self
    }

    /// Sets the navigation deadline.
    #[inline]
    #[must_use]
    pub fn with_page_load_timeout_ms(mut self, ms: u64) -> Self {
        self.page_load_timeout_ms = ms;
        self
    }

    /// Enables or disables the disk cache.
    #[inline]
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    /// Uses a persistent cache directory.
    #[inline]
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Sets the upstream proxy.
    #[inline]
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Enables or disables ad-host filtering.
    #[inline]
    #[must_use]
    pub fn with_ad_block(mut self, enabled: bool) -> Self {
        self.ad_block = enabled;
        self
    }

    /// Enables or disables media discarding.
    #[inline]
    #[must_use]
    pub fn with_quick_render(mut self, enabled: bool) -> Self {
        self.quick_render = enabled;
        self
    }

    /// Sets the fragment injected into every document head.
    #[inline]
    #[must_use]
    pub fn with_head_script(mut self, script: impl Into<String>) -> Self {
        self.head_script = Some(script.into());
        self
    }

    /// Adds a header sent with every request.
    #[inline]
    #[must_use]
    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Restricts worker ports to a range.
    #[inline]
    #[must_use]
    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = Some(range);
        self
    }

    /// Enables or disables the worker heartbeat.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, enabled: bool) -> Self {
        self.heartbeat = enabled;
        self
    }
}

// ============================================================================
// Derived Values
// ============================================================================

impl Settings {
    /// Default command deadline.
    #[inline]
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Effective navigation deadline.
    #[inline]
    #[must_use]
    pub fn page_load_timeout(&self) -> Duration {
        self.or_command_timeout(self.page_load_timeout_ms)
    }

    /// Effective script deadline.
    #[inline]
    #[must_use]
    pub fn script_timeout(&self) -> Duration {
        self.or_command_timeout(self.script_timeout_ms)
    }

    fn or_command_timeout(&self, ms: u64) -> Duration {
        if ms == 0 {
            self.command_timeout()
        } else {
            Duration::from_millis(ms)
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Settings {
    /// Reads settings from a TOML file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - [`Error::Config`] if it is not valid settings TOML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::config(format!("Invalid settings file {}: {e}", path.display())))
    }

    /// Reads settings from the environment.
    ///
    /// [`SETTINGS_ENV`] holds a complete JSON document; otherwise defaults are
    /// overridden by individual `EWD_*` variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        if let Ok(json) = env::var(SETTINGS_ENV) {
            return Self::from_json(&json);
        }

        let mut settings = Self::default();
        override_from_env("AJAX_WAIT_MS", &mut settings.ajax_wait_ms)?;
        override_from_env("AJAX_RESOURCE_TIMEOUT_MS", &mut settings.ajax_resource_timeout_ms)?;
        override_from_env("MAX_AJAX_WAIT_MS", &mut settings.max_ajax_wait_ms)?;
        override_from_env("COMMAND_TIMEOUT_MS", &mut settings.command_timeout_ms)?;
        override_from_env("PAGE_LOAD_TIMEOUT_MS", &mut settings.page_load_timeout_ms)?;
        override_from_env("SCRIPT_TIMEOUT_MS", &mut settings.script_timeout_ms)?;
        override_from_env("CACHE", &mut settings.cache)?;
        override_from_env("CACHE_ENTRIES", &mut settings.cache_entries)?;
        override_from_env("CACHE_ENTRY_SIZE", &mut settings.cache_entry_size)?;
        override_from_env("AD_BLOCK", &mut settings.ad_block)?;
        override_from_env("QUICK_RENDER", &mut settings.quick_render)?;
        override_from_env("MAX_CONNECTIONS", &mut settings.max_connections)?;
        override_from_env("HEARTBEAT", &mut settings.heartbeat)?;

        if let Ok(dir) = env::var(format!("{ENV_PREFIX}CACHE_DIR")) {
            settings.cache_dir = Some(PathBuf::from(dir));
        }
        Ok(settings)
    }

    /// Parses the JSON form passed to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `json` is not valid settings JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("Invalid settings JSON: {e}")))
    }

    /// Serializes to the JSON form passed to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks the settings for values the driver cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            return Err(Error::config("command_timeout_ms must be greater than zero"));
        }
        if self.max_ajax_wait_ms == 0 {
            return Err(Error::config("max_ajax_wait_ms must be greater than zero"));
        }
        if self.cache && self.cache_entry_size == 0 {
            return Err(Error::config("cache_entry_size must be greater than zero"));
        }
        if !self.proxy.is_direct() && (self.proxy.host.is_empty() || self.proxy.port == 0) {
            return Err(Error::config("proxy requires a host and a port"));
        }
        if let Some(range) = &self.port_range {
            range.validate()?;
        }
        if let Some((name, _)) = self.request_headers.iter().find(|(name, _)| name.trim().is_empty()) {
            return Err(Error::config(format!("Empty request header name: {name:?}")));
        }
        Ok(())
    }
}

fn override_from_env<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Ok(raw) = env::var(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {key}={raw}: {e}")))?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ajax_wait_ms, 150);
        assert_eq!(settings.ajax_resource_timeout_ms, 2000);
        assert_eq!(settings.max_ajax_wait_ms, 15_000);
        assert!(settings.ad_block);
        assert!(!settings.cache);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_fall_back_to_command_timeout() {
        let settings = Settings::default().with_command_timeout_ms(5000);
        assert_eq!(settings.page_load_timeout(), Duration::from_secs(5));
        assert_eq!(settings.script_timeout(), Duration::from_secs(5));

        let settings = settings.with_page_load_timeout_ms(100);
        assert_eq!(settings.page_load_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_json_round_trip_keeps_everything() {
        let settings = Settings::default()
            .with_cache(true)
            .with_cache_dir("/tmp/webcache")
            .with_proxy(ProxyConfig::socks5("p.test", 1080))
            .with_request_header("Accept-Language", "en-US")
            .with_port_range(PortRange::new(20_000, 20_100));

        let json = settings.to_json().expect("serialize");
        assert_eq!(Settings::from_json(&json).expect("parse"), settings);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "ajax_wait_ms = 400\nquick_render = true\n").expect("write");

        let settings = Settings::from_file(&path).expect("load");
        assert_eq!(settings.ajax_wait_ms, 400);
        assert!(settings.quick_render);
        assert_eq!(settings.command_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "ajax_wait_ms = \"soon\"\n").expect("write");

        let err = Settings::from_file(&path).expect_err("invalid");
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_validation_failures() {
        assert!(Settings::default().with_command_timeout_ms(0).validate().is_err());
        assert!(
            Settings::default()
                .with_proxy(ProxyConfig::http("", 0))
                .validate()
                .is_err()
        );
        assert!(
            Settings::default()
                .with_port_range(PortRange::new(9000, 9001))
                .validate()
                .is_err()
        );
    }
}
