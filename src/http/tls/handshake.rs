//! TLS handshake helpers
//!
//! The handshake runs in blocking mode through `Ssl::connect()` and
//! `Ssl::accept()`. It is bounded by arming socket read/write timeouts for
//! its duration; a timed-out socket read surfaces from OpenSSL as a
//! would-block condition, which is reported as `HandshakeTimeout`.

use super::config::TlsError;
use openssl::ssl::{HandshakeError, MidHandshakeSslStream};
use openssl::x509::X509VerifyResult;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

/// Default handshake timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound blocking socket I/O for the duration of a handshake
pub(crate) fn arm(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    // A zero duration is rejected by set_read_timeout
    let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}

/// Return the socket to unbounded blocking I/O
pub(crate) fn disarm(stream: &TcpStream) -> io::Result<()> {
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn describe_failure(mid: &MidHandshakeSslStream<TcpStream>) -> String {
    let verify = mid.ssl().verify_result();
    if verify != X509VerifyResult::OK {
        format!("{} (certificate verify: {})", mid.error(), verify.error_string())
    } else {
        mid.error().to_string()
    }
}

/// Map an OpenSSL handshake error, shutting the socket down
pub(crate) fn map_handshake_error(
    err: HandshakeError<TcpStream>,
    timeout: Option<Duration>,
) -> TlsError {
    let timed_out = TlsError::HandshakeTimeout(timeout.unwrap_or_default());

    match err {
        HandshakeError::SetupFailure(stack) => TlsError::OpenSsl(stack),
        HandshakeError::WouldBlock(mid) => {
            let _ = mid.get_ref().shutdown(std::net::Shutdown::Both);
            timed_out
        }
        HandshakeError::Failure(mid) => {
            let _ = mid.get_ref().shutdown(std::net::Shutdown::Both);
            match mid.error().io_error() {
                Some(io_err) if is_timeout(io_err) => timed_out,
                _ => TlsError::HandshakeFailed(describe_failure(&mid)),
            }
        }
    }
}
