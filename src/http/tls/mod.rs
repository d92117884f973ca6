//! TLS support over an existing socket
//!
//! The probe never dials a new connection for TLS: the handshake runs on the
//! socket that already carries the CONNECT tunnel, with SNI set to the
//! target host and ALPN offering `h2`.
//!
//! # Architecture
//!
//! 1. `TlsConfig` defines TLS settings (versions, ALPN, trust, timeouts)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. `TlsInfo` records what the handshake negotiated
//!
//! # Examples
//!
//! ## Client with TLS
//!
//! ```no_run
//! use h2probe::http::tls::{TlsConfig, TlsVersion};
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .servername("example.com")
//!     .alpn(&["h2"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let tls_session = tls_config.connect(tcp_stream).unwrap();
//! assert_eq!(tls_session.negotiated_protocol(), Some("h2"));
//! ```
//!
//! ## Loopback server
//!
//! ```no_run
//! use h2probe::http::tls::TlsConfig;
//! use std::net::TcpListener;
//!
//! // Built-in self-signed certificate for example.com
//! let tls_config = TlsConfig::server()
//!     .alpn(&["h2"])
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! let (tcp_stream, _) = listener.accept().unwrap();
//! let tls_session = tls_config.accept(tcp_stream).unwrap();
//! ```

pub mod builtin_cert;
pub mod cert;
pub mod config;
pub mod handshake;
pub mod info;
pub mod session;

pub use cert::CertInfo;
pub use config::{ClientConfigBuilder, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use handshake::DEFAULT_HANDSHAKE_TIMEOUT;
pub use info::TlsInfo;
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
