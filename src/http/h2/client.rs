//! HTTP/2 client
//!
//! Runs one HTTP/2 connection over an already established transport (in
//! practice a TLS session that negotiated `h2`). The client never dials or
//! negotiates anything itself.
//!
//! Frames are read only when the caller waits for something: the response
//! head, the next body chunk, or send-window capacity. Connection-level
//! frames (SETTINGS, PING, WINDOW_UPDATE, GOAWAY) are handled inline while
//! waiting, and stream frames are queued as events on their stream.

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use super::frames::*;
use super::settings::{Settings, SettingsBuilder};
use super::stream::{H2ResponseHead, StreamEvent, StreamId, StreamManager};
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::{Headers, HttpSession, SessionOps};
use bytes::{Bytes, BytesMut};
use hpack::Encoder as HpackEncoder;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on a reassembled HEADERS + CONTINUATION block
pub const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

/// Connection-specific fields that are forbidden in HTTP/2 (RFC 7540 Section 8.1.2.2)
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// HTTP/2 request
#[derive(Debug, Clone)]
pub struct H2Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl H2Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        H2Request {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// GET request for `path`
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    /// Add a regular header; the name is sent lower-cased
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn validate(&self) -> Result<()> {
        if self.method.is_empty() {
            return Err(Error::InvalidHeader("empty :method".to_string()));
        }
        if !self.path.starts_with('/') && self.path != "*" {
            return Err(Error::InvalidHeader(format!(
                ":path must start with '/': {:?}",
                self.path
            )));
        }

        for (name, value) in &self.headers {
            if name.is_empty() || name.starts_with(':') {
                return Err(Error::InvalidHeader(format!("invalid header name {:?}", name)));
            }
            if CONNECTION_HEADERS.contains(&name.as_str()) {
                return Err(Error::InvalidHeader(format!(
                    "connection-specific header {:?} is not allowed",
                    name
                )));
            }
            if name == "te" && !value.eq_ignore_ascii_case("trailers") {
                return Err(Error::InvalidHeader("te must be \"trailers\"".to_string()));
            }
        }
        Ok(())
    }
}

/// A complete HTTP/2 response
#[derive(Debug, Clone)]
pub struct H2Response {
    pub stream_id: StreamId,
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    pub trailers: Option<Headers>,
}

impl H2Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Get header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }
}

/// HTTP/2 client
pub struct H2Client<S: SessionOps> {
    session: HttpSession<S>,
    authority: String,
    stream_manager: StreamManager,
    /// Connection-level flow control
    flow_control: FlowControl,
    hpack_encoder: HpackEncoder<'static>,
    hpack_decoder: hpack::Decoder<'static>,
    local_settings: Settings,
    remote_settings: Settings,
    settings_acked: bool,
    goaway: Option<GoawayFrame>,
    connected: bool,
    closed: bool,
}

impl<S: SessionOps> H2Client<S> {
    /// Perform the connection preface and settings exchange
    ///
    /// The server's first frame must be a non-ACK SETTINGS frame.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        match self.handshake() {
            Ok(()) => {
                self.connected = true;
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn handshake(&mut self) -> Result<()> {
        // RFC 7540 Section 3.5
        let mut preface = BytesMut::from(CONNECTION_PREFACE);
        preface.extend_from_slice(&FrameCodec::encode_settings_frame(&SettingsFrame::new(
            self.local_settings.clone(),
        )));

        // Connection receive window starts at 65535 regardless of SETTINGS
        let local_window = self.local_settings.get_initial_window_size();
        if local_window > DEFAULT_INITIAL_WINDOW_SIZE {
            let increment = local_window - DEFAULT_INITIAL_WINDOW_SIZE;
            preface.extend_from_slice(&FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment),
            ));
            self.flow_control = FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, local_window);
        }
        self.session.write_all(&preface)?;

        let frame = self.recv_frame()?;
        if frame.frame_type() != Some(FrameType::Settings) {
            return Err(Error::Protocol(format!(
                "Expected SETTINGS as first server frame, got {}",
                frame
            )));
        }

        let settings = FrameCodec::decode_settings_frame(&frame)?;
        if settings.ack {
            return Err(Error::Protocol(
                "First server SETTINGS frame must not be an ACK".to_string(),
            ));
        }
        self.apply_remote_settings(&settings.settings)?;

        debug!(
            "HTTP/2 connection open (max_frame_size={}, initial_window={})",
            self.remote_settings.get_max_frame_size(),
            self.remote_settings.get_initial_window_size()
        );
        Ok(())
    }

    /// Apply peer SETTINGS and acknowledge them
    fn apply_remote_settings(&mut self, settings: &Settings) -> Result<()> {
        if let Some(new_size) = settings.initial_window_size {
            for stream in self.stream_manager.streams_mut() {
                stream
                    .flow_control_mut()
                    .send_window_mut()
                    .update_initial_size(new_size)?;
            }
        }
        if settings.max_concurrent_streams.is_some() {
            self.stream_manager
                .set_max_concurrent_streams(settings.max_concurrent_streams);
        }
        if let Some(size) = settings.header_table_size {
            if size < super::DEFAULT_HEADER_TABLE_SIZE {
                warn!(
                    "Peer header table size {} is below the encoder's fixed 4096",
                    size
                );
            }
        }

        self.remote_settings.merge(settings);
        self.write_frame(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()))
    }

    /// Open a stream and send the request headers (and body, if any)
    pub fn send_request(&mut self, request: &H2Request) -> Result<StreamId> {
        self.connect()?;
        request.validate()?;

        if let Some(goaway) = &self.goaway {
            return Err(Error::GoAway {
                last_stream_id: goaway.last_stream_id,
                code: goaway.error_code,
                debug_data: String::from_utf8_lossy(&goaway.debug_data).into_owned(),
            });
        }

        let stream_id = self.stream_manager.create_stream(
            self.remote_settings.get_initial_window_size(),
            self.local_settings.get_initial_window_size(),
        )?;

        let mut fields: Vec<(&[u8], &[u8])> = vec![
            (&b":method"[..], request.method.as_bytes()),
            (&b":scheme"[..], &b"https"[..]),
            (&b":authority"[..], self.authority.as_bytes()),
            (&b":path"[..], request.path.as_bytes()),
        ];
        fields.extend(
            request
                .headers
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        );

        let mut block = Vec::new();
        self.hpack_encoder
            .encode_into(fields, &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;

        let end_stream = request.body.is_empty();
        if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
            stream.send_headers(end_stream)?;
        }

        let encoded = FrameCodec::encode_header_block(
            stream_id,
            &block,
            end_stream,
            self.remote_settings.get_max_frame_size() as usize,
        );
        self.write_frame(&encoded)?;
        debug!(
            "stream {}: {} {} sent ({} byte header block)",
            stream_id,
            request.method,
            request.path,
            block.len()
        );

        if !end_stream {
            self.send_body(stream_id, request.body.clone())?;
        }

        Ok(stream_id)
    }

    /// Send a request body as DATA frames within the send windows
    fn send_body(&mut self, stream_id: StreamId, mut body: Bytes) -> Result<()> {
        while !body.is_empty() {
            let stream_available = self
                .stream_manager
                .get_stream(stream_id)
                .map(|s| s.flow_control().send_available())
                .ok_or(Error::StreamClosed(stream_id))?;

            let sendable = body
                .len()
                .min(stream_available)
                .min(self.flow_control.send_available())
                .min(self.remote_settings.get_max_frame_size() as usize);

            if sendable == 0 {
                // Wait for WINDOW_UPDATE (or a reset)
                self.pump()?;
                self.check_stream_alive(stream_id)?;
                continue;
            }

            let chunk = body.split_to(sendable);
            let end_stream = body.is_empty();

            self.flow_control.consume_send(sendable);
            if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
                stream.flow_control_mut().consume_send(sendable);
                stream.send_data(end_stream)?;
            }

            let frame = DataFrame::new(stream_id, chunk, end_stream);
            self.write_frame(&FrameCodec::encode_data_frame(&frame))?;
        }
        Ok(())
    }

    fn check_stream_alive(&self, stream_id: StreamId) -> Result<()> {
        match self.stream_manager.get_stream(stream_id) {
            Some(stream) if stream.state().can_send() => Ok(()),
            _ => Err(Error::StreamClosed(stream_id)),
        }
    }

    /// Wait for the final response head of a stream
    ///
    /// Informational (1xx) heads are skipped.
    pub fn recv_response_head(&mut self, stream_id: StreamId) -> Result<H2ResponseHead> {
        match self.next_event(stream_id)? {
            StreamEvent::Head(head) => Ok(head),
            StreamEvent::Reset(code) => Err(Error::StreamReset { stream_id, code }),
            StreamEvent::Refused(code) => Err(self.refused_error(code)),
            other => Err(Error::Protocol(format!(
                "stream {}: expected response head, got {:?}",
                stream_id, other
            ))),
        }
    }

    /// Next body chunk in arrival order, or `None` once the stream ended
    pub fn recv_data(&mut self, stream_id: StreamId) -> Result<Option<Bytes>> {
        loop {
            if self
                .stream_manager
                .get_stream(stream_id)
                .is_some_and(|s| s.is_finished())
            {
                return Ok(None);
            }

            match self.next_event(stream_id)? {
                StreamEvent::Data(chunk) => return Ok(Some(chunk)),
                StreamEvent::Trailers(trailers) => {
                    if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
                        stream.set_trailers(trailers);
                    }
                }
                StreamEvent::End => {
                    if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
                        stream.set_finished();
                    }
                    return Ok(None);
                }
                StreamEvent::Reset(code) => return Err(Error::StreamReset { stream_id, code }),
                StreamEvent::Refused(code) => return Err(self.refused_error(code)),
                StreamEvent::Head(_) => {
                    return Err(Error::Protocol(format!(
                        "stream {}: response head not consumed",
                        stream_id
                    )))
                }
            }
        }
    }

    /// Trailers of a stream, available once `recv_data` returned `None`
    pub fn trailers(&self, stream_id: StreamId) -> Option<&Headers> {
        self.stream_manager
            .get_stream(stream_id)
            .and_then(|s| s.trailers())
    }

    /// Send a request and collect the whole response
    pub fn request(&mut self, request: &H2Request) -> Result<H2Response> {
        let stream_id = self.send_request(request)?;
        let head = self.recv_response_head(stream_id)?;

        let mut body = BytesMut::new();
        while let Some(chunk) = self.recv_data(stream_id)? {
            body.extend_from_slice(&chunk);
        }

        let trailers = self
            .stream_manager
            .remove_stream(stream_id)
            .and_then(|s| s.trailers().cloned());

        Ok(H2Response {
            stream_id,
            status: head.status,
            headers: head.headers,
            body: body.freeze(),
            trailers,
        })
    }

    /// Send a simple GET request
    pub fn get(&mut self, path: &str) -> Result<H2Response> {
        self.request(&H2Request::get(path))
    }

    /// Per-read/write timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    /// Absolute deadline for every subsequent read/write
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.session.set_deadline(deadline);
    }

    /// Send GOAWAY(NO_ERROR) and close the transport
    ///
    /// Calling it more than once is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let goaway = if self.connected {
            self.send_goaway(ErrorCode::NoError, "")
        } else {
            Ok(())
        };
        let closed = self.session.close().map_err(Error::from);
        debug!("HTTP/2 connection closed");

        goaway.and(closed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.closed
    }

    /// The `:authority` sent with every request
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Whether the peer acknowledged our SETTINGS
    pub fn settings_acked(&self) -> bool {
        self.settings_acked
    }

    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    fn refused_error(&self, code: ErrorCode) -> Error {
        match &self.goaway {
            Some(goaway) => Error::GoAway {
                last_stream_id: goaway.last_stream_id,
                code,
                debug_data: String::from_utf8_lossy(&goaway.debug_data).into_owned(),
            },
            None => Error::GoAway {
                last_stream_id: 0,
                code,
                debug_data: String::new(),
            },
        }
    }

    /// Next queued event of a stream, reading frames until one arrives
    fn next_event(&mut self, stream_id: StreamId) -> Result<StreamEvent> {
        loop {
            match self.stream_manager.get_stream_mut(stream_id) {
                Some(stream) => {
                    if let Some(event) = stream.pop_event() {
                        return Ok(event);
                    }
                }
                None => return Err(Error::StreamClosed(stream_id)),
            }
            self.pump()?;
        }
    }

    /// Process one frame; session-level failures end the connection
    fn pump(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        match self.process_next_frame() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Best-effort GOAWAY for errors we detected, then mark the session dead
    fn abort(&mut self, err: Error) -> Error {
        if err.is_stream_error() {
            return err;
        }

        let detected_locally = matches!(
            err,
            Error::Protocol(_)
                | Error::FlowControl(_)
                | Error::FrameSize(_)
                | Error::Compression(_)
                | Error::InvalidSettings(_)
        );
        if detected_locally && !self.closed {
            warn!("HTTP/2 session error: {}", err);
            if let Err(e) = self.send_goaway(err.goaway_code(), &err.to_string()) {
                debug!("GOAWAY not delivered: {}", e);
            }
        }

        self.closed = true;
        let _ = self.session.close();
        err
    }

    fn recv_frame(&mut self) -> Result<Frame> {
        let max = self.local_settings.get_max_frame_size() as usize;
        let frame = FrameCodec::read_frame_from_session(&mut self.session, max)?;
        debug!("recv {}", frame);
        Ok(frame)
    }

    fn write_frame(&mut self, encoded: &[u8]) -> Result<()> {
        self.session.write_all(encoded)?;
        Ok(())
    }

    fn send_goaway(&mut self, code: ErrorCode, debug_data: &str) -> Result<()> {
        // No server-initiated streams are ever accepted
        let frame = GoawayFrame::new(0, code, Bytes::copy_from_slice(debug_data.as_bytes()));
        self.write_frame(&FrameCodec::encode_goaway_frame(&frame))
    }

    fn send_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        let frame = RstStreamFrame { stream_id, error_code };
        self.write_frame(&FrameCodec::encode_rst_stream_frame(&frame))
    }

    /// Reset one stream after a stream-scoped error and queue the reset
    /// for its reader; the session stays open
    fn reset_stream(&mut self, stream_id: StreamId, err: Error) -> Result<()> {
        let code = err.goaway_code();
        warn!("stream {} error: {}", stream_id, err);
        if let Some(stream) = self.stream_manager.get_stream_mut(stream_id) {
            stream.recv_reset(code);
        }
        self.send_rst_stream(stream_id, code)
    }

    fn send_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<()> {
        let frame = WindowUpdateFrame::new(stream_id, increment);
        self.write_frame(&FrameCodec::encode_window_update_frame(&frame))
    }

    /// Read one frame and dispatch it
    fn process_next_frame(&mut self) -> Result<()> {
        let frame = self.recv_frame()?;

        let frame_type = match frame.frame_type() {
            Some(t) => t,
            None => {
                // RFC 7540 Section 4.1: unknown types are ignored
                return Ok(());
            }
        };

        match frame_type {
            FrameType::Data => self.handle_data(&frame),
            FrameType::Headers => self.handle_headers(&frame),
            FrameType::Continuation => Err(Error::Protocol(
                "CONTINUATION without preceding HEADERS".to_string(),
            )),
            FrameType::Priority => Ok(()),
            FrameType::RstStream => {
                let rst = FrameCodec::decode_rst_stream_frame(&frame)?;
                if self.known_stream(rst.stream_id, "RST_STREAM")? {
                    if let Some(stream) = self.stream_manager.get_stream_mut(rst.stream_id) {
                        debug!("stream {} reset: {}", rst.stream_id, rst.error_code);
                        stream.recv_reset(rst.error_code);
                    }
                }
                Ok(())
            }
            FrameType::Settings => {
                let settings = FrameCodec::decode_settings_frame(&frame)?;
                if settings.ack {
                    self.settings_acked = true;
                    Ok(())
                } else {
                    self.apply_remote_settings(&settings.settings)
                }
            }
            FrameType::PushPromise => Err(Error::Protocol(
                "PUSH_PROMISE received but push is disabled".to_string(),
            )),
            FrameType::Ping => {
                let ping = FrameCodec::decode_ping_frame(&frame)?;
                if ping.ack {
                    Ok(())
                } else {
                    self.write_frame(&FrameCodec::encode_ping_frame(&PingFrame::ack(ping.data)))
                }
            }
            FrameType::Goaway => self.handle_goaway(&frame),
            FrameType::WindowUpdate => {
                let update = FrameCodec::decode_window_update_frame(&frame)?;
                if update.stream_id == CONNECTION_STREAM_ID {
                    self.flow_control.on_window_update(update.size_increment)?;
                } else if self.known_stream(update.stream_id, "WINDOW_UPDATE")? {
                    let result = match self.stream_manager.get_stream_mut(update.stream_id) {
                        Some(stream) => stream
                            .flow_control_mut()
                            .on_window_update(update.size_increment)
                            .map(|_| ()),
                        None => Ok(()),
                    };
                    // RFC 7540 Section 6.9: a bad stream increment only ends that stream
                    if let Err(e) = result {
                        self.reset_stream(update.stream_id, e)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Whether a frame's stream is tracked; frames for streams the client
    /// never opened are a connection error, frames for forgotten streams
    /// are dropped
    fn known_stream(&self, stream_id: StreamId, what: &str) -> Result<bool> {
        if self.stream_manager.get_stream(stream_id).is_some() {
            return Ok(true);
        }
        if stream_id % 2 == 0 || self.stream_manager.is_idle(stream_id) {
            return Err(Error::Protocol(format!(
                "{} on stream {} not opened by the client",
                what, stream_id
            )));
        }
        Ok(false)
    }

    fn handle_data(&mut self, frame: &Frame) -> Result<()> {
        let data = FrameCodec::decode_data_frame(frame)?;
        let stream_id = data.stream_id;
        let flow_len = frame.payload.len();

        // The whole payload counts, padding included
        self.flow_control.on_data(flow_len)?;
        if let Some(increment) = self.flow_control.take_recv_update()? {
            self.send_window_update(CONNECTION_STREAM_ID, increment)?;
        }

        if !self.known_stream(stream_id, "DATA")? {
            return Ok(());
        }
        let stream = self
            .stream_manager
            .get_stream_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;

        if !stream.state().can_receive() {
            return self.send_rst_stream(stream_id, ErrorCode::StreamClosed);
        }

        if let Err(e) = stream.flow_control_mut().on_data(flow_len) {
            return self.reset_stream(stream_id, e);
        }
        stream.recv_data(data.data, data.end_stream)?;

        let update = if data.end_stream {
            None
        } else {
            stream.flow_control_mut().take_recv_update()?
        };
        if let Some(increment) = update {
            self.send_window_update(stream_id, increment)?;
        }
        Ok(())
    }

    fn handle_headers(&mut self, frame: &Frame) -> Result<()> {
        let headers = FrameCodec::decode_headers_frame(frame)?;
        let stream_id = headers.stream_id;
        let end_stream = headers.end_stream;

        let mut block = BytesMut::from(&headers.header_block[..]);
        let mut end_headers = headers.end_headers;
        while !end_headers {
            let next = self.recv_frame()?;
            if next.frame_type() != Some(FrameType::Continuation) || next.stream_id() != stream_id {
                return Err(Error::Protocol(format!(
                    "Expected CONTINUATION for stream {}, got {}",
                    stream_id, next
                )));
            }
            if block.len() + next.payload.len() > MAX_HEADER_BLOCK_SIZE {
                return Err(Error::Protocol(format!(
                    "Header block on stream {} exceeds {} bytes",
                    stream_id, MAX_HEADER_BLOCK_SIZE
                )));
            }
            block.extend_from_slice(&next.payload);
            end_headers = next.flags().is_end_headers();
        }

        // Always decode so the HPACK table stays in sync
        let fields = self
            .hpack_decoder
            .decode(&block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        if !self.known_stream(stream_id, "HEADERS")? {
            return Ok(());
        }
        let stream = self
            .stream_manager
            .get_stream_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;

        if !stream.state().can_receive() {
            return self.send_rst_stream(stream_id, ErrorCode::StreamClosed);
        }

        let (status, fields) = split_fields(fields)?;
        if stream.head_received() {
            if status.is_some() {
                return Err(Error::Protocol(format!(
                    "Pseudo-header in trailers on stream {}",
                    stream_id
                )));
            }
            return stream.recv_trailers(fields, end_stream);
        }

        let status = status.ok_or_else(|| {
            Error::Protocol(format!("Response on stream {} without :status", stream_id))
        })?;

        if (100..200).contains(&status) {
            if end_stream {
                return Err(Error::Protocol(format!(
                    "Informational response ends stream {}",
                    stream_id
                )));
            }
            debug!("stream {}: skipping informational {}", stream_id, status);
            return Ok(());
        }

        stream.recv_head(H2ResponseHead { status, headers: fields }, end_stream)
    }

    fn handle_goaway(&mut self, frame: &Frame) -> Result<()> {
        let goaway = FrameCodec::decode_goaway_frame(frame)?;
        let debug_data = String::from_utf8_lossy(&goaway.debug_data).into_owned();
        info!(
            "GOAWAY received: {} last_stream={} {}",
            goaway.error_code, goaway.last_stream_id, debug_data
        );

        let last_stream_id = goaway.last_stream_id;
        let code = goaway.error_code;
        for stream in self.stream_manager.streams_mut() {
            if stream.id() > last_stream_id && !stream.state().is_closed() {
                stream.refuse(code);
            }
        }
        self.goaway = Some(goaway);

        if code != ErrorCode::NoError {
            return Err(Error::GoAway {
                last_stream_id,
                code,
                debug_data,
            });
        }
        Ok(())
    }
}

/// Split decoded fields into `:status` and regular headers
fn split_fields(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(Option<u16>, Headers)> {
    let mut status = None;
    let mut headers = Headers::new();
    let mut regular_seen = false;

    for (name, value) in fields {
        let name = String::from_utf8_lossy(&name).into_owned();
        let value = String::from_utf8_lossy(&value).into_owned();

        if let Some(pseudo) = name.strip_prefix(':') {
            if regular_seen {
                return Err(Error::Protocol(format!(
                    "Pseudo-header {} after regular headers",
                    name
                )));
            }
            if pseudo != "status" || status.is_some() {
                return Err(Error::Protocol(format!("Unexpected pseudo-header {}", name)));
            }
            if value.len() != 3 || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Protocol(format!("Invalid :status {:?}", value)));
            }
            status = value.parse::<u16>().ok();
        } else {
            regular_seen = true;
            headers.insert(name, value);
        }
    }

    Ok((status, headers))
}

/// HTTP/2 client builder
pub struct H2ClientBuilder {
    authority: Option<String>,
    settings: SettingsBuilder,
    timeout: Option<Duration>,
}

impl H2ClientBuilder {
    /// Create a new client builder
    ///
    /// Push is disabled; every other setting keeps its protocol default.
    pub fn new() -> Self {
        H2ClientBuilder {
            authority: None,
            settings: SettingsBuilder::new().enable_push(false),
            timeout: None,
        }
    }

    /// `:authority` for requests (usually the target host name)
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Receive window for each stream and for the connection
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings = self.settings.initial_window_size(size);
        self
    }

    /// Per-read/write timeout on the transport
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the client over an established transport
    pub fn build<S: SessionOps>(self, session: S) -> Result<H2Client<S>> {
        let authority = self
            .authority
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::InvalidHeader("missing :authority".to_string()))?;
        let local_settings = self.settings.build()?;

        let mut session = HttpSession::new(session);
        session.set_timeout(self.timeout.or(session.timeout()));

        Ok(H2Client {
            session,
            authority,
            stream_manager: StreamManager::new(),
            flow_control: FlowControl::default(),
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: hpack::Decoder::new(),
            local_settings,
            remote_settings: Settings::default(),
            settings_acked: false,
            goaway: None,
            connected: false,
            closed: false,
        })
    }
}

impl Default for H2ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Loopback peer that reads the client preface and runs `script`
    fn with_peer<F>(script: F) -> (TcpStream, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut preface = [0u8; 24];
            stream.read_exact(&mut preface).unwrap();
            assert_eq!(&preface[..], CONNECTION_PREFACE);
            script(stream);
        });
        (TcpStream::connect(addr).unwrap(), handle)
    }

    fn client(stream: TcpStream) -> H2Client<FdSessionOps> {
        H2ClientBuilder::new()
            .authority("example.com")
            .timeout(Duration::from_secs(5))
            .build(FdSessionOps::new(stream))
            .unwrap()
    }

    fn read(stream: &mut TcpStream) -> Frame {
        FrameCodec::read_frame(stream, 1 << 20).unwrap()
    }

    fn send(stream: &mut TcpStream, bytes: &[u8]) {
        stream.write_all(bytes).unwrap();
    }

    /// Read until the client hangs up so no unread bytes trigger a reset
    fn drain(stream: &mut TcpStream) {
        let mut buf = [0u8; 4096];
        while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
    }

    fn server_settings(stream: &mut TcpStream) {
        send(stream, &FrameCodec::encode_settings_frame(&SettingsFrame::new(Settings::new())));
    }

    fn response_head(encoder: &mut HpackEncoder<'static>, status: &str) -> Vec<u8> {
        encoder.encode(vec![
            (&b":status"[..], status.as_bytes()),
            (&b"content-type"[..], &b"text/plain"[..]),
        ])
    }

    #[test]
    fn test_builder_requires_authority() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let result = H2ClientBuilder::new().build(FdSessionOps::new(stream));
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_request_validation() {
        assert!(H2Request::get("/").header("User-Agent", "x").validate().is_ok());
        assert!(H2Request::get("/").header("Connection", "close").validate().is_err());
        assert!(H2Request::get("/").header("te", "gzip").validate().is_err());
        assert!(H2Request::get("index.html").validate().is_err());
        assert_eq!(H2Request::get("/").header("X-Probe", "1").headers()[0].0, "x-probe");
    }

    #[test]
    fn test_first_frame_must_be_settings() {
        let (stream, peer) = with_peer(|mut stream| {
            send(&mut stream, &FrameCodec::encode_ping_frame(&PingFrame::new([0; 8])));
            let _ = read(&mut stream); // client SETTINGS
            let goaway = read(&mut stream);
            assert_eq!(goaway.frame_type(), Some(FrameType::Goaway));
            let goaway = FrameCodec::decode_goaway_frame(&goaway).unwrap();
            assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
        });

        let mut client = client(stream);
        assert!(matches!(client.connect(), Err(Error::Protocol(_))));
        peer.join().unwrap();
    }

    #[test]
    fn test_get_with_continuation_padding_and_trailers() {
        let (stream, peer) = with_peer(|mut stream| {
            let settings = read(&mut stream);
            let settings = FrameCodec::decode_settings_frame(&settings).unwrap();
            assert_eq!(settings.settings.enable_push, Some(false));
            server_settings(&mut stream);

            // SETTINGS ACK from the client, then the request
            let ack = read(&mut stream);
            assert!(FrameCodec::decode_settings_frame(&ack).unwrap().ack);

            let request = read(&mut stream);
            let request = FrameCodec::decode_headers_frame(&request).unwrap();
            assert!(request.end_stream);
            let fields = hpack::Decoder::new().decode(&request.header_block).unwrap();
            assert_eq!(fields[0], (b":method".to_vec(), b"GET".to_vec()));
            assert_eq!(fields[2], (b":authority".to_vec(), b"example.com".to_vec()));
            assert_eq!(fields[3], (b":path".to_vec(), b"/".to_vec()));

            let mut encoder = HpackEncoder::new();
            let informational = encoder.encode(vec![(&b":status"[..], &b"103"[..])]);
            send(&mut stream, &FrameCodec::encode_header_block(1, &informational, false, 16384));

            // Final head split across HEADERS + CONTINUATION
            let head = response_head(&mut encoder, "200");
            send(&mut stream, &FrameCodec::encode_header_block(1, &head, false, 4));

            let data = DataFrame::new(1, Bytes::from("hello "), false).with_padding(4);
            send(&mut stream, &FrameCodec::encode_data_frame(&data));
            send(&mut stream, &[0, 0, 0, 0xee, 0, 0, 0, 0, 0]); // unknown frame type
            let data = DataFrame::new(1, Bytes::from("world"), false);
            send(&mut stream, &FrameCodec::encode_data_frame(&data));

            let trailers = encoder.encode(vec![(&b"grpc-status"[..], &b"0"[..])]);
            send(&mut stream, &FrameCodec::encode_header_block(1, &trailers, true, 16384));

            let goaway = read(&mut stream);
            let goaway = FrameCodec::decode_goaway_frame(&goaway).unwrap();
            assert_eq!(goaway.error_code, ErrorCode::NoError);
        });

        let mut client = client(stream);
        client.connect().unwrap();
        let response = client.get("/").unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.body_string(), "hello world");
        assert_eq!(response.trailers().and_then(|t| t.get("grpc-status")), Some("0"));

        client.close().unwrap();
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_ping_answered_and_rst_stream() {
        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            send(&mut stream, &FrameCodec::encode_ping_frame(&PingFrame::new(*b"probe!!!")));
            let pong = FrameCodec::decode_ping_frame(&read(&mut stream)).unwrap();
            assert!(pong.ack);
            assert_eq!(&pong.data, b"probe!!!");

            let rst = RstStreamFrame {
                stream_id: 1,
                error_code: ErrorCode::RefusedStream,
            };
            send(&mut stream, &FrameCodec::encode_rst_stream_frame(&rst));
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        let err = client.recv_response_head(stream_id).unwrap_err();

        assert!(err.is_stream_error());
        assert!(matches!(
            err,
            Error::StreamReset {
                stream_id: 1,
                code: ErrorCode::RefusedStream
            }
        ));
        peer.join().unwrap();
    }

    /// Read the client's RST_STREAM, then the GOAWAY sent by a clean close
    fn expect_reset_then_clean_close(stream: &mut TcpStream, code: ErrorCode) {
        let rst = read(stream);
        assert_eq!(rst.frame_type(), Some(FrameType::RstStream));
        let rst = FrameCodec::decode_rst_stream_frame(&rst).unwrap();
        assert_eq!(rst.stream_id, 1);
        assert_eq!(rst.error_code, code);

        let goaway = FrameCodec::decode_goaway_frame(&read(stream)).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::NoError);
        drain(stream);
    }

    #[test]
    fn test_zero_stream_window_increment_resets_only_the_stream() {
        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            send(
                &mut stream,
                &FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(1, 0)),
            );
            expect_reset_then_clean_close(&mut stream, ErrorCode::ProtocolError);
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        let err = client.recv_response_head(stream_id).unwrap_err();

        assert!(err.is_stream_error());
        assert!(matches!(
            err,
            Error::StreamReset {
                stream_id: 1,
                code: ErrorCode::ProtocolError
            }
        ));
        assert!(client.is_connected());
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_stream_send_window_overflow_resets_only_the_stream() {
        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            // 65535 + (2^31 - 1) is past the largest legal window
            let update = WindowUpdateFrame::new(1, 0x7FFF_FFFF);
            send(&mut stream, &FrameCodec::encode_window_update_frame(&update));
            expect_reset_then_clean_close(&mut stream, ErrorCode::FlowControlError);
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        assert!(matches!(
            client.recv_response_head(stream_id),
            Err(Error::StreamReset {
                stream_id: 1,
                code: ErrorCode::FlowControlError
            })
        ));
        assert!(client.is_connected());
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_data_past_stream_window_resets_only_the_stream() {
        let (stream, peer) = with_peer(|mut stream| {
            let settings = FrameCodec::decode_settings_frame(&read(&mut stream)).unwrap();
            assert_eq!(settings.settings.initial_window_size, Some(1000));
            server_settings(&mut stream);
            // The connection window stays at 65535, so no WINDOW_UPDATE precedes the ACK
            let ack = read(&mut stream);
            assert!(FrameCodec::decode_settings_frame(&ack).unwrap().ack);
            let _ = read(&mut stream); // HEADERS

            let mut encoder = HpackEncoder::new();
            let head = response_head(&mut encoder, "200");
            send(&mut stream, &FrameCodec::encode_header_block(1, &head, false, 16384));
            let data = DataFrame::new(1, Bytes::from(vec![b'x'; 2000]), false);
            send(&mut stream, &FrameCodec::encode_data_frame(&data));
            expect_reset_then_clean_close(&mut stream, ErrorCode::FlowControlError);
        });

        let mut client = H2ClientBuilder::new()
            .authority("example.com")
            .initial_window_size(1000)
            .timeout(Duration::from_secs(5))
            .build(FdSessionOps::new(stream))
            .unwrap();
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        assert_eq!(client.recv_response_head(stream_id).unwrap().status(), 200);

        let err = client.recv_data(stream_id).unwrap_err();
        assert!(err.is_stream_error());
        assert!(matches!(
            err,
            Error::StreamReset {
                stream_id: 1,
                code: ErrorCode::FlowControlError
            }
        ));
        assert!(client.is_connected());
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_raised_initial_window_opens_connection_window_up_front() {
        const WINDOW: u32 = 1 << 20;
        const BODY: usize = 200_000;

        let (stream, peer) = with_peer(|mut stream| {
            let settings = FrameCodec::decode_settings_frame(&read(&mut stream)).unwrap();
            assert_eq!(settings.settings.initial_window_size, Some(WINDOW));
            let update = read(&mut stream);
            assert_eq!(update.frame_type(), Some(FrameType::WindowUpdate));
            let update = FrameCodec::decode_window_update_frame(&update).unwrap();
            assert_eq!(update.stream_id, 0);
            assert_eq!(update.size_increment, WINDOW - 65535);

            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            let mut encoder = HpackEncoder::new();
            let head = response_head(&mut encoder, "200");
            send(&mut stream, &FrameCodec::encode_header_block(1, &head, false, 16384));

            // The whole body fits both windows; nothing is awaited between frames
            let mut sent = 0;
            while sent < BODY {
                let n = (BODY - sent).min(16384);
                sent += n;
                let frame = DataFrame::new(1, Bytes::from(vec![b'x'; n]), sent == BODY);
                send(&mut stream, &FrameCodec::encode_data_frame(&frame));
            }

            while let Ok(frame) = FrameCodec::read_frame(&mut stream, 1 << 20) {
                assert_ne!(frame.frame_type(), Some(FrameType::WindowUpdate));
            }
        });

        let mut client = H2ClientBuilder::new()
            .authority("example.com")
            .initial_window_size(WINDOW)
            .timeout(Duration::from_secs(5))
            .build(FdSessionOps::new(stream))
            .unwrap();
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        assert_eq!(client.recv_response_head(stream_id).unwrap().status(), 200);

        let mut total = 0;
        while let Some(chunk) = client.recv_data(stream_id).unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, BODY);
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_large_body_replenishes_windows() {
        const BODY: usize = 200_000;

        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            let mut encoder = HpackEncoder::new();
            let head = response_head(&mut encoder, "200");
            send(&mut stream, &FrameCodec::encode_header_block(1, &head, false, 16384));

            let mut conn_window: i64 = 65535;
            let mut stream_window: i64 = 65535;
            let mut sent = 0;
            while sent < BODY {
                while conn_window == 0 || stream_window == 0 {
                    let update = FrameCodec::decode_window_update_frame(&read(&mut stream)).unwrap();
                    if update.stream_id == 0 {
                        conn_window += update.size_increment as i64;
                    } else {
                        stream_window += update.size_increment as i64;
                    }
                }

                let n = (BODY - sent).min(16384).min(conn_window as usize).min(stream_window as usize);
                sent += n;
                conn_window -= n as i64;
                stream_window -= n as i64;
                let frame = DataFrame::new(1, Bytes::from(vec![b'x'; n]), sent == BODY);
                send(&mut stream, &FrameCodec::encode_data_frame(&frame));
            }
            drain(&mut stream);
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        assert_eq!(client.recv_response_head(stream_id).unwrap().status(), 200);

        let mut total = 0;
        while let Some(chunk) = client.recv_data(stream_id).unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, BODY);
        client.close().unwrap();
        peer.join().unwrap();
    }

    #[test]
    fn test_push_promise_is_protocol_error() {
        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            let mut frame = FrameCodec::encode_header(
                FrameType::PushPromise,
                FrameFlags::from_u8(FrameFlags::END_HEADERS),
                1,
                4,
            )
            .to_vec();
            frame.extend_from_slice(&[0, 0, 0, 2]);
            send(&mut stream, &frame);

            let goaway = FrameCodec::decode_goaway_frame(&read(&mut stream)).unwrap();
            assert_eq!(goaway.error_code, ErrorCode::ProtocolError);
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        assert!(matches!(
            client.recv_response_head(stream_id),
            Err(Error::Protocol(_))
        ));
        peer.join().unwrap();
    }

    #[test]
    fn test_goaway_with_error_is_fatal() {
        let (stream, peer) = with_peer(|mut stream| {
            let _ = read(&mut stream);
            server_settings(&mut stream);
            let _ = read(&mut stream); // ACK
            let _ = read(&mut stream); // HEADERS

            let goaway = GoawayFrame::new(0, ErrorCode::EnhanceYourCalm, Bytes::from("slow down"));
            send(&mut stream, &FrameCodec::encode_goaway_frame(&goaway));
        });

        let mut client = client(stream);
        let stream_id = client.send_request(&H2Request::get("/")).unwrap();
        match client.recv_response_head(stream_id) {
            Err(Error::GoAway { code, debug_data, .. }) => {
                assert_eq!(code, ErrorCode::EnhanceYourCalm);
                assert_eq!(debug_data, "slow down");
            }
            other => panic!("expected GOAWAY error, got {:?}", other.map(|h| h.status)),
        }
        peer.join().unwrap();
    }
}
