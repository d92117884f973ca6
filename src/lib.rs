//! h2probe - tunneled HTTP/2 probing client
//!
//! This crate drives a single HTTP/2 request through an HTTP CONNECT proxy:
//! a raw TCP connection to the proxy is turned into a tunnel, upgraded to
//! TLS with ALPN `h2`, and finally carries one HTTP/2 stream. Every phase
//! is reported separately so an operator can tell a proxy that rejects the
//! tunnel from one that strips ALPN or resets the connection.

pub mod config;
pub mod http;
pub mod net;
pub mod probe;

pub use config::{Endpoint, ProbeConfig, ProbeConfigBuilder, Timeouts};
pub use probe::{
    Phase, ProbeError, ProbeFailure, ProbeMetrics, ProbeReport, Transition, TunnelProbe,
};
