//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections, so the
//! HTTP/2 client runs over TLS the same way it would over a plain socket.

use super::config::{TlsConfig, TlsError};
use super::handshake;
use super::info::TlsInfo;
use crate::http::session::{poll_fd, shutdown_socket, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{Read, Write};
use std::net::{IpAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing::debug;

/// TLS session operations
///
/// Wraps an OpenSSL SslStream that owns the socket it was handshaken on.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    info: TlsInfo,
    failed: bool,
}

impl TlsSessionOps {
    /// Run the client handshake on a connected socket
    pub fn connect(tcp_stream: TcpStream, config: TlsConfig) -> Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        if let Some(ref servername) = config.servername {
            match servername.parse::<IpAddr>() {
                // IP literals are not valid SNI names
                Ok(ip) => {
                    if config.verify_peer {
                        ssl.param_mut().set_ip(ip)?;
                    }
                }
                Err(_) => {
                    ssl.set_hostname(servername)?;
                    if config.verify_peer {
                        ssl.param_mut().set_host(servername)?;
                    }
                }
            }
        }

        handshake::arm(&tcp_stream, config.handshake_timeout)?;
        let ssl_stream = ssl
            .connect(tcp_stream)
            .map_err(|e| handshake::map_handshake_error(e, config.handshake_timeout))?;
        handshake::disarm(ssl_stream.get_ref())?;

        let info = TlsInfo::from_ssl(ssl_stream.ssl());
        debug!(
            version = %info.version,
            cipher = %info.cipher,
            alpn = ?info.alpn,
            "TLS handshake complete"
        );

        Ok(TlsSessionOps {
            stream: ssl_stream,
            info,
            failed: false,
        })
    }

    /// Run the server handshake on an accepted socket
    pub fn accept(tcp_stream: TcpStream, config: TlsConfig) -> Result<Self, TlsError> {
        let ssl = Ssl::new(&config.ctx)?;

        handshake::arm(&tcp_stream, config.handshake_timeout)?;
        let ssl_stream = ssl
            .accept(tcp_stream)
            .map_err(|e| handshake::map_handshake_error(e, config.handshake_timeout))?;
        handshake::disarm(ssl_stream.get_ref())?;

        let info = TlsInfo::from_ssl(ssl_stream.ssl());

        Ok(TlsSessionOps {
            stream: ssl_stream,
            info,
            failed: false,
        })
    }

    /// Details negotiated by the handshake
    pub fn info(&self) -> &TlsInfo {
        &self.info
    }

    /// Protocol selected through ALPN, if any
    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.info.negotiated_protocol()
    }

    /// Check if an I/O operation failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Bound blocking reads on the socket
    ///
    /// `poll` only knows that bytes arrived, not that a whole TLS record
    /// did; this keeps a truncated record from blocking forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.stream.get_ref().set_read_timeout(timeout)
    }

    fn fail(&mut self, err: std::io::Error) -> Error {
        self.failed = true;
        Error::Io(err)
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes already buffered by OpenSSL
        if matches!(events, PollEvents::Read | PollEvents::Both) && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn flush(&mut self) -> HttpResult<()> {
        match self.stream.flush() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        // close_notify is only meaningful on a healthy session
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        shutdown_socket(self.stream.get_ref())
    }
}
