//! TCP connection establishment
//!
//! Resolves a host name and dials each resolved address in turn, all
//! under one connect deadline. Errors keep the underlying `io::Error` so the
//! probe can classify a refused port, an injected reset or a silent drop.

use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("DNS resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),
}

impl Error {
    /// Classify the failure for operator-facing output
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Resolve { .. } | Error::NoAddresses(_) => FailureKind::Dns,
            Error::Connect { source, .. } | Error::Socket(source) => FailureKind::from_io(source),
        }
    }
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Nothing listening, or a middlebox answered SYN with RST
    Refused,
    /// Established connection torn down with RST
    Reset,
    /// Connection aborted locally or broken pipe
    Aborted,
    /// No answer within the deadline
    TimedOut,
    /// Name could not be resolved
    Dns,
    /// Orderly close (FIN) where data was expected
    Closed,
    /// Anything else
    Other,
}

impl FailureKind {
    /// Classify an I/O error
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => FailureKind::Refused,
            io::ErrorKind::ConnectionReset => FailureKind::Reset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => FailureKind::Aborted,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::TimedOut,
            io::ErrorKind::UnexpectedEof => FailureKind::Closed,
            _ => FailureKind::Other,
        }
    }

    /// Get the label
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Refused => "connection refused",
            FailureKind::Reset => "connection reset (TCP RST)",
            FailureKind::Aborted => "connection aborted",
            FailureKind::TimedOut => "timed out",
            FailureKind::Dns => "DNS failure",
            FailureKind::Closed => "connection closed",
            FailureKind::Other => "other",
        }
    }

    /// True for failures that look like an injected or peer RST
    pub fn is_reset(&self) -> bool {
        matches!(self, FailureKind::Reset | FailureKind::Aborted)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format `host:port`, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Connect to `host:port`, trying each resolved address within one
/// overall `timeout`
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(Error::NoAddresses(format_authority(host, port)));
    }

    connect_any(&addrs, timeout)
}

/// Dial `addrs` in order until one answers; each attempt gets whatever is
/// left of `timeout`
pub fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;

    let mut last_err = None;
    for &addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_err.get_or_insert(Error::Connect {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect deadline exceeded"),
            });
            break;
        }

        debug!(%addr, remaining_ms = remaining.as_millis() as u64, "dialing");
        match connect_addr(addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "dial failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::NoAddresses("empty address list".to_string())))
}

/// Connect to a single socket address
pub fn connect_addr(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|source| Error::Connect { addr, source })?;
    socket.set_nodelay(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(format_authority("::1", 443), "[::1]:443");
    }

    #[test]
    fn test_failure_kind_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(FailureKind::from_io(&refused), FailureKind::Refused);

        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(FailureKind::from_io(&reset), FailureKind::Reset);
        assert!(FailureKind::from_io(&reset).is_reset());

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(FailureKind::from_io(&timeout), FailureKind::TimedOut);
        assert!(!FailureKind::TimedOut.is_reset());
    }

    #[test]
    fn test_connect_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_addresses_share_one_deadline() {
        // Unroutable, so each dial either hangs or fails at once
        let blackhole: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let addrs = [blackhole; 4];

        let start = Instant::now();
        let err = connect_any(&addrs, Duration::from_millis(300)).unwrap_err();
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(matches!(err, Error::Connect { .. }));
    }

    #[test]
    fn test_later_address_used_after_refusal() {
        let refused = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap();

        let stream = connect_any(&[refused, open], Duration::from_secs(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), open);
    }

    #[test]
    fn test_empty_address_list() {
        let err = connect_any(&[], Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Dns);
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = connect("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Refused);
    }
}
