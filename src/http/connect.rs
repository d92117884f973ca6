//! HTTP/1.1 CONNECT tunnel establishment
//!
//! Issues `CONNECT host:port` on an already-connected proxy socket and reads
//! the reply until the blank line. Only a `200` reply opens the tunnel; the
//! socket is then handed back untouched so the TLS layer can run over it.

use super::parser::{ResponseHead, ResponseHeadParser};
use super::session::{FdSessionOps, HttpSession};
use super::{Error, Headers, Result, Status, CRLF};
use crate::net::format_authority;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A CONNECT request for one target through one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    proxy_host: String,
    proxy_port: u16,
    target_host: String,
    target_port: u16,
}

impl TunnelRequest {
    pub fn new(
        proxy_host: impl Into<String>,
        proxy_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        TunnelRequest {
            proxy_host: proxy_host.into(),
            proxy_port,
            target_host: target_host.into(),
            target_port,
        }
    }

    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// The `host:port` authority of the target
    pub fn authority(&self) -> String {
        format_authority(&self.target_host, self.target_port)
    }

    /// Render the request exactly as it goes on the wire
    pub fn to_wire(&self) -> Vec<u8> {
        let authority = self.authority();
        format!(
            "CONNECT {authority} HTTP/1.1{CRLF}Host: {authority}{CRLF}{CRLF}"
        )
        .into_bytes()
    }
}

/// The proxy's reply to a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResponse {
    head: ResponseHead,
}

impl TunnelResponse {
    /// The raw status line, without CRLF
    pub fn status_line(&self) -> &str {
        &self.head.status_line
    }

    pub fn status(&self) -> Status {
        self.head.status
    }

    pub fn status_code(&self) -> u16 {
        self.head.status.code()
    }

    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Bytes taken by the reply head on the wire
    pub fn wire_len(&self) -> usize {
        self.head.wire_len
    }

    /// Whether the tunnel is open
    pub fn is_established(&self) -> bool {
        self.head.status == Status::OK
    }
}

impl From<ResponseHead> for TunnelResponse {
    fn from(head: ResponseHead) -> Self {
        TunnelResponse { head }
    }
}

/// Read a CONNECT reply head from a session
///
/// Returns the head and any bytes that followed it.
pub fn read_tunnel_response(
    session: &mut HttpSession<FdSessionOps>,
) -> Result<(TunnelResponse, Vec<u8>)> {
    let mut parser = ResponseHeadParser::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = session.read(&mut buf)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        debug!(bytes = n, "read from proxy");

        if let Some(head) = parser.parse(&buf[..n])? {
            return Ok((TunnelResponse::from(head), parser.remaining().to_vec()));
        }
    }
}

/// Establish a CONNECT tunnel on a connected proxy socket
///
/// The whole exchange, write and reply, must complete within `timeout`.
/// On success the socket is returned ready for the TLS handshake. On any
/// failure the socket is shut down before the error is returned.
pub fn establish_tunnel(
    stream: TcpStream,
    request: &TunnelRequest,
    timeout: Duration,
) -> Result<(TcpStream, TunnelResponse)> {
    let mut session = HttpSession::new(FdSessionOps::new(stream));
    session.set_timeout(Some(timeout));
    session.set_deadline(Some(Instant::now() + timeout));

    match exchange(&mut session, request) {
        Ok(response) => Ok((session.into_inner().into_stream(), response)),
        Err(e) => {
            let _ = session.close();
            Err(e)
        }
    }
}

fn exchange(
    session: &mut HttpSession<FdSessionOps>,
    request: &TunnelRequest,
) -> Result<TunnelResponse> {
    debug!(authority = %request.authority(), "sending CONNECT");
    session.write_all(&request.to_wire())?;

    let (response, leftover) = read_tunnel_response(session)?;
    debug!(status_line = response.status_line(), "proxy replied");

    if !response.is_established() {
        return Err(Error::TunnelRejected {
            status: response.status_code(),
            reason: response.reason().to_string(),
        });
    }

    // The server has not seen our ClientHello yet, so anything here came
    // from the proxy and would corrupt the TLS stream.
    if !leftover.is_empty() {
        warn!(bytes = leftover.len(), "proxy sent data after CONNECT reply");
        return Err(Error::TrailingData(leftover.len()));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn proxy_replying(chunks: Vec<&'static [u8]>) -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            for chunk in chunks {
                stream.write_all(chunk).unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            request
        });

        (port, handle)
    }

    #[test]
    fn test_request_wire_format() {
        let request = TunnelRequest::new("proxy", 4433, "www.google.com", 443);
        assert_eq!(
            request.to_wire(),
            b"CONNECT www.google.com:443 HTTP/1.1\r\nHost: www.google.com:443\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_request_ipv6_authority() {
        let request = TunnelRequest::new("proxy", 3128, "2001:db8::1", 8443);
        assert_eq!(request.authority(), "[2001:db8::1]:8443");
        assert!(request.to_wire().starts_with(b"CONNECT [2001:db8::1]:8443 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_establish_tunnel() {
        let (port, handle) =
            proxy_replying(vec![b"HTTP/1.1 200 Connection Established\r\n\r\n"]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (_stream, response) =
            establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap();

        assert_eq!(response.status_code(), 200);
        assert!(response.is_established());

        let sent = handle.join().unwrap();
        assert_eq!(sent, request.to_wire());
    }

    #[test]
    fn test_establish_tunnel_fragmented() {
        let (port, _handle) = proxy_replying(vec![
            b"HTTP/1.1 200 Connection",
            b" Established\r\nProxy-Agent: frag\r\n",
            b"\r\n",
        ]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (_stream, response) =
            establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.headers().get("proxy-agent"), Some("frag"));
    }

    #[test]
    fn test_establish_tunnel_rejected() {
        let (port, _handle) = proxy_replying(vec![b"HTTP/1.1 403 Forbidden\r\n\r\n"]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let err = establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap_err();

        match err {
            Error::TunnelRejected { status, reason } => {
                assert_eq!(status, 403);
                assert_eq!(reason, "Forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_establish_tunnel_other_2xx_rejected() {
        let (port, _handle) = proxy_replying(vec![b"HTTP/1.1 204 No Content\r\n\r\n"]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let err = establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::TunnelRejected { status: 204, .. }));
    }

    #[test]
    fn test_establish_tunnel_trailing_data() {
        let (port, _handle) = proxy_replying(vec![b"HTTP/1.1 200 OK\r\n\r\nsurprise"]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let err = establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::TrailingData(8)));
    }

    #[test]
    fn test_establish_tunnel_eof() {
        let (port, _handle) = proxy_replying(vec![b"HTTP/1.1 200 Conn"]);
        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);

        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let err = establish_tunnel(stream, &request, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_establish_tunnel_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _handle = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
        });

        let request = TunnelRequest::new("127.0.0.1", port, "example.com", 443);
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let start = Instant::now();
        let err = establish_tunnel(stream, &request, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
