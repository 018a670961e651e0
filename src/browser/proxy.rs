//! Upstream proxy configuration.
//!
//! The network gateway routes every engine request through the configured
//! proxy.
//!
//! # Example
//!
//! ```
//! use engine_webdriver::ProxyConfig;
//!
//! let proxy = ProxyConfig::socks5("proxy.example.com", 1080)
//!     .with_credentials("user", "pass")
//!     .with_proxy_dns(true);
//! assert_eq!(proxy.url().as_deref(), Some("socks5h://proxy.example.com:1080"));
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// ProxyType
// ============================================================================

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP proxy (CONNECT for HTTPS targets).
    Http,

    /// HTTP proxying over a TLS connection to the proxy.
    Https,

    /// SOCKS v4 proxy.
    Socks4,

    /// SOCKS v5 proxy.
    #[serde(rename = "socks")]
    Socks5,

    /// Direct connection.
    #[default]
    Direct,
}

impl ProxyType {
    /// Returns the URL scheme for this proxy type.
    ///
    /// `proxy_dns` selects the remote-resolving SOCKS variants.
    #[inline]
    #[must_use]
    pub fn scheme(&self, proxy_dns: bool) -> Option<&'static str> {
        match (self, proxy_dns) {
            (Self::Http, _) => Some("http"),
            (Self::Https, _) => Some("https"),
            (Self::Socks4, false) => Some("socks4"),
            (Self::Socks4, true) => Some("socks4a"),
            (Self::Socks5, false) => Some("socks5"),
            (Self::Socks5, true) => Some("socks5h"),
            (Self::Direct, _) => None,
        }
    }
}

// ============================================================================
// ProxyConfig
// ============================================================================

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy type.
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    /// Proxy hostname.
    pub host: String,

    /// Proxy port.
    pub port: u16,

    /// Username for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Resolve host names through the proxy (SOCKS only).
    #[serde(rename = "proxyDns", default)]
    pub proxy_dns: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::direct()
    }
}

// ============================================================================
// ProxyConfig - Constructors
// ============================================================================

impl ProxyConfig {
    /// Creates a new proxy configuration.
    #[must_use]
    pub fn new(proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type,
            host: host.into(),
            port,
            username: None,
            password: None,
            proxy_dns: false,
        }
    }

    /// Creates an HTTP proxy configuration.
    #[inline]
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Http, host, port)
    }

    /// Creates an HTTPS proxy configuration.
    #[inline]
    #[must_use]
    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Https, host, port)
    }

    /// Creates a SOCKS4 proxy configuration.
    #[inline]
    #[must_use]
    pub fn socks4(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Socks4, host, port)
    }

    /// Creates a SOCKS5 proxy configuration.
    #[inline]
    #[must_use]
    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        Self::new(ProxyType::Socks5, host, port)
    }

    /// Creates a direct (no proxy) configuration.
    #[inline]
    #[must_use]
    pub fn direct() -> Self {
        Self::new(ProxyType::Direct, "", 0)
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Resolves host names through the proxy (SOCKS only).
    #[must_use]
    pub fn with_proxy_dns(mut self, proxy_dns: bool) -> Self {
        self.proxy_dns = proxy_dns;
        self
    }
}

// ============================================================================
// ProxyConfig - Conversion
// ============================================================================

impl ProxyConfig {
    /// Returns `true` if requests bypass any proxy.
    #[inline]
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.proxy_type == ProxyType::Direct
    }

    /// Returns `true` if this proxy has authentication configured.
    #[inline]
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the proxy URL without credentials, or `None` when direct.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        let scheme = self.proxy_type.scheme(self.proxy_dns)?;
        Some(format!("{scheme}://{}:{}", self.host, self.port))
    }

    /// Builds the HTTP client proxy, or `None` when direct.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if host or port are unusable.
    pub fn to_reqwest(&self) -> Result<Option<reqwest::Proxy>> {
        let Some(url) = self.url() else {
            return Ok(None);
        };
        if self.host.is_empty() || self.port == 0 {
            return Err(Error::config(format!("Incomplete proxy address: {url}")));
        }

        let mut proxy = reqwest::Proxy::all(&url)
            .map_err(|e| Error::config(format!("Invalid proxy {url}: {e}")))?;
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            proxy = proxy.basic_auth(username, password);
        }
        Ok(Some(proxy))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::{ProxyConfig, ProxyType};

    #[test]
    fn test_proxy_type_serialization() {
        assert_eq!(
            serde_json::to_string(&ProxyType::Socks5).expect("serialize"),
            r#""socks""#
        );
        assert_eq!(ProxyType::default(), ProxyType::Direct);
    }

    #[test]
    fn test_proxy_urls() {
        assert_eq!(
            ProxyConfig::http("p.test", 8080).url().as_deref(),
            Some("http://p.test:8080")
        );
        assert_eq!(
            ProxyConfig::socks4("p.test", 1080).with_proxy_dns(true).url().as_deref(),
            Some("socks4a://p.test:1080")
        );
        assert_eq!(ProxyConfig::direct().url(), None);
    }

    #[test]
    fn test_direct_builds_no_proxy() {
        assert!(ProxyConfig::direct().to_reqwest().expect("direct").is_none());
    }

    #[test]
    fn test_authenticated_proxy_builds() {
        let proxy = ProxyConfig::http("proxy.example.com", 3128).with_credentials("user", "pass");
        assert!(proxy.has_auth());
        assert!(proxy.to_reqwest().expect("proxy").is_some());
    }

    #[test]
    fn test_incomplete_proxy_is_rejected() {
        let err = ProxyConfig::http("", 0).to_reqwest().expect_err("incomplete");
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_proxy_config_serialization() {
        let proxy = ProxyConfig::http("proxy.example.com", 8080).with_credentials("user", "pass");
        let json = serde_json::to_string(&proxy).expect("serialize");
        assert!(json.contains(r#""type":"http""#));
        assert!(json.contains(r#""username":"user""#));

        let back: ProxyConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, proxy);
    }
}
