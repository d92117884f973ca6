//! Loopback fixtures shared by the integration tests
//!
//! - a CONNECT proxy thread with scripted replies
//! - a TLS target speaking just enough HTTP/2 to answer one GET

#![allow(dead_code)]

use bytes::Bytes;
use h2probe::http::h2::frames::{DataFrame, HeadersFrame, RstStreamFrame, SettingsFrame};
use h2probe::http::h2::{ErrorCode, Frame, FrameCodec, FrameType, Settings, CONNECTION_PREFACE};
use h2probe::http::tls::TlsConfig;
use h2probe::http::HttpSession;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// How the proxy answers a CONNECT request
#[derive(Debug, Clone)]
pub enum ProxyMode {
    /// 200, then relay to the requested authority
    Tunnel,
    /// 200 split over several segments, then relay
    Fragmented,
    /// Raw reply bytes, then wait for the client to hang up
    Reply(&'static [u8]),
    /// Read the request and never answer
    Stall,
}

/// Start a one-shot proxy; the handle yields the CONNECT head it received
pub fn spawn_proxy(mode: ProxyMode) -> (SocketAddr, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();
        let head = read_head(&mut client);
        let authority = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string();

        match mode {
            ProxyMode::Tunnel => {
                let upstream = TcpStream::connect(authority.as_str()).unwrap();
                client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .unwrap();
                relay(client, upstream);
            }
            ProxyMode::Fragmented => {
                let upstream = TcpStream::connect(authority.as_str()).unwrap();
                for part in [&b"HTTP/1.1 20"[..], b"0 Connection estab", b"lished\r\n", b"\r\n"] {
                    client.write_all(part).unwrap();
                    client.flush().unwrap();
                    thread::sleep(Duration::from_millis(30));
                }
                relay(client, upstream);
            }
            ProxyMode::Reply(reply) => {
                client.write_all(reply).unwrap();
                drain(&mut client);
            }
            ProxyMode::Stall => drain(&mut client),
        }

        head
    });

    (addr, handle)
}

/// Read a request head byte by byte so nothing past it is consumed
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn relay(client: TcpStream, upstream: TcpStream) {
    let mut client_rx = client.try_clone().unwrap();
    let mut upstream_tx = upstream.try_clone().unwrap();

    let outbound = thread::spawn(move || {
        let _ = io::copy(&mut client_rx, &mut upstream_tx);
        let _ = upstream_tx.shutdown(Shutdown::Write);
    });

    let (mut client_tx, mut upstream_rx) = (client, upstream);
    let _ = io::copy(&mut upstream_rx, &mut client_tx);
    let _ = client_tx.shutdown(Shutdown::Write);
    let _ = outbound.join();
}

/// Read until the peer hangs up so unread bytes never turn into a reset
pub fn drain(stream: &mut TcpStream) {
    let mut buf = [0u8; 4096];
    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
}

/// How the HTTP/2 target answers the request on stream 1
#[derive(Debug, Clone)]
pub enum TargetMode {
    Respond { status: u16, body: Vec<u8> },
    Reset(ErrorCode),
}

/// What the target saw
#[derive(Debug, Clone, Default)]
pub struct SeenRequest {
    pub alpn: Option<String>,
    pub servername: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl SeenRequest {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Start a one-shot TLS target using the built-in certificate
///
/// `alpn` is the server's preference list; when the client ends up
/// without `h2` the target just waits for it to hang up.
pub fn spawn_h2_target(
    alpn: &'static [&'static str],
    mode: TargetMode,
) -> (SocketAddr, thread::JoinHandle<SeenRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = TlsConfig::server().alpn(alpn).unwrap().build().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let tls = match config.accept(stream) {
            Ok(tls) => tls,
            Err(_) => return SeenRequest::default(),
        };

        let mut seen = SeenRequest {
            alpn: tls.info().alpn.clone(),
            servername: tls.info().servername.clone(),
            fields: Vec::new(),
        };

        let mut session = HttpSession::new(tls);
        session.set_timeout(Some(Duration::from_secs(5)));

        if seen.alpn.as_deref() != Some("h2") {
            let mut buf = [0u8; 1024];
            while matches!(session.read(&mut buf), Ok(n) if n > 0) {}
            return seen;
        }

        let mut preface = [0u8; 24];
        session.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        let mut target = H2Target::new(session);
        seen.fields = target.handshake_and_read_request();
        target.answer(mode);
        target.wait_for_goaway();
        seen
    });

    (addr, handle)
}

struct H2Target {
    session: HttpSession<h2probe::http::tls::TlsSessionOps>,
    conn_window: i64,
    stream_window: i64,
    initial_window: i64,
}

impl H2Target {
    fn new(session: HttpSession<h2probe::http::tls::TlsSessionOps>) -> Self {
        H2Target {
            session,
            conn_window: 65535,
            stream_window: 65535,
            initial_window: 65535,
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.session.write_all(bytes).unwrap();
    }

    fn read(&mut self) -> Frame {
        FrameCodec::read_frame_from_session(&mut self.session, 1 << 20).unwrap()
    }

    /// Apply a control frame from the client
    fn handle_control(&mut self, frame: &Frame) {
        match frame.frame_type() {
            Some(FrameType::Settings) => {
                let settings = FrameCodec::decode_settings_frame(frame).unwrap();
                if !settings.ack {
                    let window = settings.settings.get_initial_window_size() as i64;
                    self.stream_window += window - self.initial_window;
                    self.initial_window = window;
                    self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
                }
            }
            Some(FrameType::WindowUpdate) => {
                let update = FrameCodec::decode_window_update_frame(frame).unwrap();
                if update.stream_id == 0 {
                    self.conn_window += update.size_increment as i64;
                } else {
                    self.stream_window += update.size_increment as i64;
                }
            }
            _ => {}
        }
    }

    fn handshake_and_read_request(&mut self) -> Vec<(String, String)> {
        self.send(&FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new())));

        loop {
            let frame = self.read();
            if frame.frame_type() == Some(FrameType::Headers) {
                let headers = FrameCodec::decode_headers_frame(&frame).unwrap();
                assert!(headers.end_headers, "request fits one HEADERS frame");
                assert_eq!(headers.stream_id, 1);
                return hpack::Decoder::new()
                    .decode(&headers.header_block)
                    .unwrap()
                    .into_iter()
                    .map(|(n, v)| {
                        (
                            String::from_utf8_lossy(&n).into_owned(),
                            String::from_utf8_lossy(&v).into_owned(),
                        )
                    })
                    .collect();
            }
            self.handle_control(&frame);
        }
    }

    fn answer(&mut self, mode: TargetMode) {
        match mode {
            TargetMode::Reset(code) => {
                let rst = RstStreamFrame {
                    stream_id: 1,
                    error_code: code,
                };
                self.send(&FrameCodec::encode_rst_stream_frame(&rst));
            }
            TargetMode::Respond { status, body } => {
                let status = status.to_string();
                let length = body.len().to_string();
                let block = hpack::Encoder::new().encode(vec![
                    (&b":status"[..], status.as_bytes()),
                    (&b"content-type"[..], &b"text/plain"[..]),
                    (&b"content-length"[..], length.as_bytes()),
                ]);
                let head = HeadersFrame::new(1, Bytes::from(block), body.is_empty(), true);
                self.send(&FrameCodec::encode_headers_frame(&head));

                let mut sent = 0;
                while sent < body.len() {
                    let window = self.conn_window.min(self.stream_window);
                    if window <= 0 {
                        let frame = self.read();
                        self.handle_control(&frame);
                        continue;
                    }
                    let n = (body.len() - sent).min(16384).min(window as usize);
                    let end = sent + n == body.len();
                    let data = DataFrame::new(1, Bytes::copy_from_slice(&body[sent..sent + n]), end);
                    self.send(&FrameCodec::encode_data_frame(&data));
                    self.conn_window -= n as i64;
                    self.stream_window -= n as i64;
                    sent += n;
                }
            }
        }
    }

    /// Consume client frames until its GOAWAY or hang-up
    fn wait_for_goaway(&mut self) {
        while let Ok(frame) = FrameCodec::read_frame_from_session(&mut self.session, 1 << 20) {
            if frame.frame_type() == Some(FrameType::Goaway) {
                break;
            }
            self.handle_control(&frame);
        }
        let _ = self.session.close();
    }
}

/// A body of `len` printable bytes
pub fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

