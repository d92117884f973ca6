//! Probe configuration
//!
//! A [`ProbeConfig`] names the proxy, the target and the knobs of each
//! phase. It is immutable once built; [`ProbeConfigBuilder::build`] runs
//! [`ProbeConfig::validate`] so a probe never starts from a bad config.

use crate::net::format_authority;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for configuration
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Default proxy endpoint
pub const DEFAULT_PROXY: &str = "localhost:4433";

/// Default probe target
pub const DEFAULT_TARGET: &str = "www.google.com:443";

/// Default `user-agent` request header
pub const DEFAULT_USER_AGENT: &str = "h2-debug-client";

/// A `host:port` pair
///
/// IPv6 literals are written in brackets (`[::1]:443`) and stored without
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// `host:port` with IPv6 literals bracketed
    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    fn check(&self, field: &'static str) -> Result<()> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid {
                field,
                reason: "empty host".to_string(),
            });
        }
        // The host ends up in the CONNECT request line and Host header
        if self
            .host
            .chars()
            .any(|c| c.is_ascii_whitespace() || c.is_ascii_control() || c == '/' || c == '@')
        {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("host {:?} contains forbidden characters", self.host),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field,
                reason: "port must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| invalid("missing ']'"))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be bracketed"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Per-phase deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect to the proxy (or the target in direct mode)
    pub connect: Duration,
    /// Waiting for the CONNECT reply
    pub tunnel: Duration,
    /// TLS handshake
    pub handshake: Duration,
    /// Whole HTTP/2 phase: preface to END_STREAM
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(10),
            tunnel: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            request: Duration::from_secs(30),
        }
    }
}

/// Probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub proxy: Endpoint,
    pub target: Endpoint,
    /// Verify the target certificate and host name
    pub tls_verify: bool,
    /// Extra trust anchors (PEM); system paths are used otherwise
    pub ca_file: Option<PathBuf>,
    /// Offer `http/1.1` after `h2`
    pub alpn_fallback: bool,
    /// Go through the proxy; `false` dials the target directly
    pub use_proxy: bool,
    pub path: String,
    pub user_agent: String,
    pub timeouts: Timeouts,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            proxy: Endpoint::new("localhost", 4433),
            target: Endpoint::new("www.google.com", 443),
            tls_verify: true,
            ca_file: None,
            alpn_fallback: false,
            use_proxy: true,
            path: "/".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ProbeConfig {
    pub fn builder() -> ProbeConfigBuilder {
        ProbeConfigBuilder::new()
    }

    /// ALPN protocols offered, in preference order
    pub fn alpn_protocols(&self) -> Vec<&'static str> {
        if self.alpn_fallback {
            vec!["h2", "http/1.1"]
        } else {
            vec!["h2"]
        }
    }

    /// Check value ranges and header safety
    pub fn validate(&self) -> Result<()> {
        if self.use_proxy {
            self.proxy.check("proxy")?;
        }
        self.target.check("target")?;

        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "path",
                reason: format!("{:?} must start with '/'", self.path),
            });
        }
        if self.path.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
            return Err(ConfigError::Invalid {
                field: "path",
                reason: "contains whitespace or control characters".to_string(),
            });
        }
        if self.user_agent.is_empty() || self.user_agent.chars().any(|c| c == '\r' || c == '\n') {
            return Err(ConfigError::Invalid {
                field: "user_agent",
                reason: "must be a non-empty single line".to_string(),
            });
        }

        let t = &self.timeouts;
        for (field, value) in [
            ("connect timeout", t.connect),
            ("tunnel timeout", t.tunnel),
            ("handshake timeout", t.handshake),
            ("request timeout", t.request),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(path) = &self.ca_file {
            if !path.is_file() {
                return Err(ConfigError::Invalid {
                    field: "ca_file",
                    reason: format!("{} is not a readable file", path.display()),
                });
            }
        }

        Ok(())
    }
}

/// Builder for [`ProbeConfig`]
#[derive(Debug, Clone, Default)]
pub struct ProbeConfigBuilder {
    config: ProbeConfig,
}

impl ProbeConfigBuilder {
    pub fn new() -> Self {
        ProbeConfigBuilder::default()
    }

    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy = Endpoint::new(host, port);
        self
    }

    pub fn target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.target = Endpoint::new(host, port);
        self
    }

    pub fn proxy_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.proxy = endpoint;
        self
    }

    pub fn target_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.target = endpoint;
        self
    }

    /// Disabling verification is logged loudly when the probe runs
    pub fn tls_verify(mut self, verify: bool) -> Self {
        self.config.tls_verify = verify;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    pub fn alpn_fallback(mut self, enable: bool) -> Self {
        self.config.alpn_fallback = enable;
        self
    }

    pub fn use_proxy(mut self, enable: bool) -> Self {
        self.config.use_proxy = enable;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.connect = timeout;
        self
    }

    pub fn tunnel_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.tunnel = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.handshake = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.request = timeout;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ProbeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::builder().build().unwrap();
        assert_eq!(config.proxy.to_string(), DEFAULT_PROXY);
        assert_eq!(config.target.to_string(), DEFAULT_TARGET);
        assert_eq!(config.path, "/");
        assert_eq!(config.user_agent, "h2-debug-client");
        assert!(config.tls_verify);
        assert!(config.use_proxy);
        assert_eq!(config.alpn_protocols(), vec!["h2"]);
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("example.com", 443));

        let endpoint: Endpoint = "[2001:db8::1]:8443".parse().unwrap();
        assert_eq!(endpoint.host, "2001:db8::1");
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        for input in ["example.com", "example.com:", ":443", "host:99999", "host:0", "::1:443", "[::1]443", "[::1"] {
            assert!(
                input.parse::<Endpoint>().is_err(),
                "{} should not parse",
                input
            );
        }
    }

    #[test]
    fn test_validation() {
        assert!(ProbeConfig::builder().path("index.html").build().is_err());
        assert!(ProbeConfig::builder().user_agent("a\r\nb").build().is_err());
        assert!(ProbeConfig::builder().target("bad host", 443).build().is_err());
        assert!(ProbeConfig::builder().request_timeout(Duration::ZERO).build().is_err());
        assert!(ProbeConfig::builder().ca_file("/nonexistent/ca.pem").build().is_err());
    }

    #[test]
    fn test_direct_mode_ignores_proxy() {
        let config = ProbeConfig::builder()
            .proxy("", 0)
            .use_proxy(false)
            .build()
            .unwrap();
        assert!(!config.use_proxy);
    }

    #[test]
    fn test_alpn_fallback() {
        let config = ProbeConfig::builder().alpn_fallback(true).build().unwrap();
        assert_eq!(config.alpn_protocols(), vec!["h2", "http/1.1"]);
    }
}
