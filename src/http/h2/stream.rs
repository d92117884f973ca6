//! HTTP/2 stream management
//!
//! This module implements stream state as defined in RFC 7540 Section 5.1.
//! Frames read off the connection are turned into [`StreamEvent`]s and
//! queued on the stream they belong to, in arrival order, until the caller
//! asks for them.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use crate::http::Headers;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
///
/// The reserved states only arise from server push, which the client
/// disables, so they are not modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM
    HalfClosedLocal,
    /// Peer sent END_STREAM
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// A response head: `:status` plus regular header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl H2ResponseHead {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Something that happened on a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Final (non-1xx) response head
    Head(H2ResponseHead),
    /// A body chunk, padding removed
    Data(Bytes),
    /// Trailing header block
    Trailers(Headers),
    /// END_STREAM received
    End,
    /// RST_STREAM received
    Reset(ErrorCode),
    /// Peer's GOAWAY did not cover this stream
    Refused(ErrorCode),
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow_control: FlowControl,
    head_received: bool,
    events: VecDeque<StreamEvent>,
    trailers: Option<Headers>,
    finished: bool,
}

impl H2Stream {
    /// Create a new stream with the given send and receive windows
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow_control: FlowControl::new(send_window, recv_window),
            head_received: false,
            events: VecDeque::new(),
            trailers: None,
            finished: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn flow_control_mut(&mut self) -> &mut FlowControl {
        &mut self.flow_control
    }

    /// Whether the final response head has arrived
    pub fn head_received(&self) -> bool {
        self.head_received
    }

    /// Trailers, once the caller has read past them
    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    pub(crate) fn set_trailers(&mut self, trailers: Headers) {
        self.trailers = Some(trailers);
    }

    /// Whether the caller has consumed END_STREAM
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn set_finished(&mut self) {
        self.finished = true;
    }

    pub(crate) fn pop_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// We are sending HEADERS
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "Cannot send HEADERS in state {:?}",
                self.state
            ))),
        }
    }

    /// We are sending DATA
    pub fn send_data(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }

        if end_stream {
            self.state = match self.state {
                StreamState::Open => StreamState::HalfClosedLocal,
                _ => StreamState::Closed,
            };
        }
        Ok(())
    }

    /// Peer sent a complete header block
    pub fn recv_head(&mut self, head: H2ResponseHead, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        if self.head_received {
            return Err(Error::Protocol(format!(
                "Second response head on stream {}",
                self.id
            )));
        }

        self.head_received = true;
        self.events.push_back(StreamEvent::Head(head));
        if end_stream {
            self.recv_end_stream();
        }
        Ok(())
    }

    /// Peer sent a trailing header block, which must end the stream
    pub fn recv_trailers(&mut self, trailers: Headers, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        if !end_stream {
            return Err(Error::Protocol(format!(
                "Trailers without END_STREAM on stream {}",
                self.id
            )));
        }

        self.events.push_back(StreamEvent::Trailers(trailers));
        self.recv_end_stream();
        Ok(())
    }

    /// Peer sent DATA
    pub fn recv_data(&mut self, data: Bytes, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        if !self.head_received {
            return Err(Error::Protocol(format!(
                "DATA before response head on stream {}",
                self.id
            )));
        }

        if !data.is_empty() {
            self.events.push_back(StreamEvent::Data(data));
        }
        if end_stream {
            self.recv_end_stream();
        }
        Ok(())
    }

    fn recv_end_stream(&mut self) {
        self.events.push_back(StreamEvent::End);
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    /// Peer reset the stream
    pub fn recv_reset(&mut self, code: ErrorCode) {
        self.state = StreamState::Closed;
        self.events.push_back(StreamEvent::Reset(code));
    }

    /// Peer's GOAWAY excluded the stream
    pub fn refuse(&mut self, code: ErrorCode) {
        self.state = StreamState::Closed;
        self.events.push_back(StreamEvent::Refused(code));
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }
}

/// Stream manager
///
/// Manages the client-initiated streams of a connection
#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamId, H2Stream>,
    /// Next stream ID (client: odd)
    next_stream_id: StreamId,
    max_concurrent_streams: Option<u32>,
}

impl StreamManager {
    pub fn new() -> Self {
        StreamManager {
            streams: HashMap::new(),
            next_stream_id: 1,
            max_concurrent_streams: None,
        }
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    /// Highest stream ID handed out so far (0 if none)
    pub fn last_stream_id(&self) -> StreamId {
        self.next_stream_id.saturating_sub(2)
    }

    /// Allocate next stream ID and create stream
    pub fn create_stream(&mut self, send_window: u32, recv_window: u32) -> Result<StreamId> {
        if let Some(max) = self.max_concurrent_streams {
            if self.active_stream_count() >= max as usize {
                return Err(Error::Protocol(format!(
                    "Peer allows only {} concurrent streams",
                    max
                )));
            }
        }

        let stream_id = self.next_stream_id;
        if stream_id > super::MAX_STREAM_ID {
            return Err(Error::Protocol("Stream IDs exhausted".to_string()));
        }
        self.next_stream_id += 2;

        self.streams
            .insert(stream_id, H2Stream::new(stream_id, send_window, recv_window));
        Ok(stream_id)
    }

    pub fn get_stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Whether the ID belongs to a stream that was never opened
    pub fn is_idle(&self, stream_id: StreamId) -> bool {
        stream_id >= self.next_stream_id
    }

    pub fn remove_stream(&mut self, stream_id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn active_stream_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state().is_closed())
            .count()
    }

    pub fn streams_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}
