//! HTTP/2 client over an established transport
//!
//! This module implements the client side of RFC 7540 on top of any
//! [`SessionOps`](crate::http::SessionOps), normally a TLS session that
//! negotiated `h2` through ALPN.
//!
//! # Architecture
//!
//! - **frames / codec**: frame structs and their wire encoding, with padding,
//!   priority blocks and CONTINUATION handled on both sides
//! - **settings**: SETTINGS parameters, validation and encoding
//! - **flow_control**: send and receive windows for the connection and each
//!   stream, including WINDOW_UPDATE replenishment
//! - **stream**: stream states and the per-stream event queue
//! - **client**: connection preface, request sending, frame dispatch
//!
//! HPACK is provided by the `hpack` crate.
//!
//! # Examples
//!
//! ```no_run
//! use h2probe::http::h2::{H2ClientBuilder, H2Request};
//! use h2probe::http::tls::TlsConfig;
//! use std::net::TcpStream;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tls_config = TlsConfig::client()
//!     .servername("example.com")
//!     .alpn(&["h2"])?
//!     .build()?;
//!
//! let tcp_stream = TcpStream::connect("example.com:443")?;
//! let tls_session = tls_config.connect(tcp_stream)?;
//!
//! let mut client = H2ClientBuilder::new()
//!     .authority("example.com")
//!     .build(tls_session)?;
//!
//! let stream_id = client.send_request(&H2Request::get("/").header("user-agent", "h2probe"))?;
//! let head = client.recv_response_head(stream_id)?;
//! println!("Status: {}", head.status());
//! while let Some(chunk) = client.recv_data(stream_id)? {
//!     println!("{} bytes", chunk.len());
//! }
//! client.close()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod settings;
pub mod stream;

pub use client::{H2Client, H2ClientBuilder, H2Request, H2Response};
pub use codec::FrameCodec;
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameHeader, FrameType};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{H2ResponseHead, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
