//! HTTP/1.x message primitives
//!
//! Version and status types used when parsing a proxy's CONNECT reply.

use super::{Error, Result};
use std::fmt;

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parse version from string
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }

    /// Convert version to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Parse a status code token: exactly three ASCII digits
    pub fn parse(token: &str) -> Result<Self> {
        if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidStatus(format!("Invalid status code: {:?}", token)));
        }
        let code = token
            .parse::<u16>()
            .map_err(|_| Error::InvalidStatus(format!("Invalid status code: {:?}", token)))?;
        Status::new(code)
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for the codes proxies answer CONNECT with
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            200 => "Connection Established",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::from_str("HTTP/1.1").unwrap(), Version::Http11);
        assert_eq!(Version::from_str("HTTP/1.0").unwrap(), Version::Http10);
        assert!(Version::from_str("HTTP/2").is_err());
        assert!(Version::from_str("http/1.1").is_err());
    }

    #[test]
    fn test_status_parse_strict() {
        assert_eq!(Status::parse("200").unwrap(), Status::OK);
        assert_eq!(Status::parse("407").unwrap().code(), 407);

        assert!(Status::parse("200OK").is_err());
        assert!(Status::parse("20").is_err());
        assert!(Status::parse("+20").is_err());
        assert!(Status::parse("099").is_err());
        assert!(Status::parse("600").is_err());
    }

    #[test]
    fn test_reason_phrase() {
        assert_eq!(Status::OK.reason_phrase(), "Connection Established");
        assert_eq!(Status::new(407).unwrap().reason_phrase(), "Proxy Authentication Required");
        assert!(Status::OK.is_success());
        assert!(!Status::new(502).unwrap().is_success());
    }
}
