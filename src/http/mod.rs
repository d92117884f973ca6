//! HTTP layers used by the probe
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction that lets the same
//! read/write code run over a plain TCP socket or a TLS session:
//!
//! - `SessionOps` trait defines operations (poll, read, write, flush, close)
//! - `HttpSession` wraps a `SessionOps` and enforces timeouts and deadlines
//! - `connect` speaks HTTP/1.1 CONNECT on the plain socket
//! - `tls` upgrades the tunnelled socket to TLS with ALPN
//! - `h2` runs an HTTP/2 client over the TLS session
//!
//! Each layer takes ownership of the transport below it, so a socket is
//! never read by two layers at once.
//!
//! # Examples
//!
//! ```no_run
//! use h2probe::http::connect::{establish_tunnel, TunnelRequest};
//! use h2probe::http::tls::TlsConfig;
//! use h2probe::http::h2::H2ClientBuilder;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = TunnelRequest::new("localhost", 4433, "example.com", 443);
//! let proxy = h2probe::net::connect("localhost", 4433, Duration::from_secs(5))?;
//! let (tunnel, _response) = establish_tunnel(proxy, &request, Duration::from_secs(5))?;
//!
//! let tls_config = TlsConfig::client()
//!     .servername("example.com")
//!     .alpn(&["h2"])?
//!     .build()?;
//! let tls_session = tls_config.connect(tunnel)?;
//!
//! let mut client = H2ClientBuilder::new()
//!     .authority("example.com")
//!     .build(tls_session)?;
//! client.connect()?;
//! let response = client.get("/")?;
//! println!("Status: {}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod connect;
pub mod headers;
pub mod message;
pub mod parser;
pub mod session;
pub mod tls;
pub mod h2;

pub use connect::{establish_tunnel, TunnelRequest, TunnelResponse};
pub use headers::Headers;
pub use message::{Status, Version};
pub use parser::ResponseHeadParser;
pub use session::{SessionOps, HttpSession, FdSessionOps, PollEvents};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Header block exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Tunnel rejected by proxy: {status} {reason}")]
    TunnelRejected { status: u16, reason: String },

    #[error("Unexpected {0} bytes after CONNECT response")]
    TrailingData(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// Maximum size of a response header block
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
