//! HTTP/2 frame encoding and decoding
//!
//! Encoders produce complete frames (9-byte header plus payload) ready to be
//! written to the transport. Decoders take a received [`Frame`] and check
//! the per-type length and stream-id rules of RFC 7540 Section 6.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::Settings;
use super::stream::StreamId;
use super::CONNECTION_STREAM_ID;
use crate::http::{HttpSession, SessionOps};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload the 24-bit length field can express
pub const MAX_FRAME_SIZE: usize = 0x00FF_FFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Reserved bit is always 0
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());

        header
    }

    /// Decode a frame header; unknown frame types are kept as raw bytes
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        // Reserved bit is ignored on receipt
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);

        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.flow_len());
        Self::put_padded(
            &mut buf,
            FrameType::Data,
            flags,
            frame.stream_id,
            &frame.data,
            frame.padding,
        );
        buf.freeze()
    }

    /// Encode a single HEADERS frame
    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut buf = BytesMut::new();
        Self::put_padded(
            &mut buf,
            FrameType::Headers,
            flags,
            frame.stream_id,
            &frame.header_block,
            frame.padding,
        );
        buf.freeze()
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(stream_id: StreamId, fragment: &[u8], end_headers: bool) -> Bytes {
        let mut flags = FrameFlags::empty();
        if end_headers {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + fragment.len());
        buf.put_slice(&Self::encode_header(
            FrameType::Continuation,
            flags,
            stream_id,
            fragment.len(),
        ));
        buf.put_slice(fragment);
        buf.freeze()
    }

    /// Encode a complete header block as HEADERS followed by as many
    /// CONTINUATION frames as `max_frame_size` requires
    ///
    /// END_STREAM goes on the HEADERS frame, END_HEADERS on the last frame.
    pub fn encode_header_block(
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
    ) -> Bytes {
        let max = max_frame_size.max(1);
        let mut chunks = block.chunks(max);
        let first = chunks.next().unwrap_or(&[]);
        let rest: Vec<&[u8]> = chunks.collect();

        let mut buf = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE * (rest.len() + 1));
        let headers = HeadersFrame::new(
            stream_id,
            Bytes::copy_from_slice(first),
            end_stream,
            rest.is_empty(),
        );
        buf.put_slice(&Self::encode_headers_frame(&headers));

        for (i, fragment) in rest.iter().enumerate() {
            let last = i + 1 == rest.len();
            buf.put_slice(&Self::encode_continuation_frame(stream_id, fragment, last));
        }

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let (flags, length) = if frame.ack {
            (FrameFlags::from_u8(FrameFlags::ACK), 0)
        } else {
            (FrameFlags::empty(), frame.settings.encoded_len())
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + length);
        buf.put_slice(&Self::encode_header(
            FrameType::Settings,
            flags,
            CONNECTION_STREAM_ID,
            length,
        ));
        if !frame.ack {
            frame.settings.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, CONNECTION_STREAM_ID, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let length = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + length);
        buf.put_slice(&Self::encode_header(
            FrameType::Goaway,
            FrameFlags::empty(),
            CONNECTION_STREAM_ID,
            length,
        ));
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    fn put_padded(
        buf: &mut BytesMut,
        frame_type: FrameType,
        mut flags: FrameFlags,
        stream_id: StreamId,
        body: &[u8],
        padding: Option<u8>,
    ) {
        let mut length = body.len();
        if let Some(pad) = padding {
            flags.set(FrameFlags::PADDED);
            length += 1 + pad as usize;
        }

        buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, length));
        if let Some(pad) = padding {
            buf.put_u8(pad);
        }
        buf.put_slice(body);
        if let Some(pad) = padding {
            buf.put_bytes(0, pad as usize);
        }
    }

    /// Split off the pad-length byte and trailing padding
    fn strip_padding(frame: &Frame) -> Result<(Bytes, Option<u8>)> {
        if !frame.flags().is_padded() {
            return Ok((frame.payload.clone(), None));
        }

        let payload = &frame.payload;
        let pad = *payload
            .first()
            .ok_or_else(|| Error::FrameSize(format!("{} too short for padding", frame)))?;

        // RFC 7540 Section 6.1: padding as long as the payload is a protocol error
        if pad as usize >= payload.len() {
            return Err(Error::Protocol(format!(
                "Padding length {} exceeds payload in {}",
                pad, frame
            )));
        }

        Ok((payload.slice(1..payload.len() - pad as usize), Some(pad)))
    }

    fn require_stream(frame: &Frame) -> Result<StreamId> {
        if frame.stream_id() == CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} on stream 0", frame)));
        }
        Ok(frame.stream_id())
    }

    fn require_connection(frame: &Frame) -> Result<()> {
        if frame.stream_id() != CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} must be on stream 0", frame)));
        }
        Ok(())
    }

    fn require_len(frame: &Frame, len: usize) -> Result<()> {
        if frame.payload.len() != len {
            return Err(Error::FrameSize(format!(
                "{} payload must be {} bytes",
                frame, len
            )));
        }
        Ok(())
    }

    /// Decode a DATA frame, removing padding
    pub fn decode_data_frame(frame: &Frame) -> Result<DataFrame> {
        let stream_id = Self::require_stream(frame)?;
        let (data, padding) = Self::strip_padding(frame)?;

        Ok(DataFrame {
            stream_id,
            data,
            end_stream: frame.flags().is_end_stream(),
            padding,
        })
    }

    /// Decode a HEADERS frame, removing padding and the priority block
    pub fn decode_headers_frame(frame: &Frame) -> Result<HeadersFrame> {
        let stream_id = Self::require_stream(frame)?;
        let (mut block, padding) = Self::strip_padding(frame)?;

        if frame.flags().is_priority() {
            if block.len() < 5 {
                return Err(Error::FrameSize(format!("{} too short for priority", frame)));
            }
            block = block.slice(5..);
        }

        Ok(HeadersFrame {
            stream_id,
            header_block: block,
            end_stream: frame.flags().is_end_stream(),
            end_headers: frame.flags().is_end_headers(),
            padding,
        })
    }

    /// Decode a RST_STREAM frame
    pub fn decode_rst_stream_frame(frame: &Frame) -> Result<RstStreamFrame> {
        let stream_id = Self::require_stream(frame)?;
        Self::require_len(frame, 4)?;

        let p = &frame.payload;
        Ok(RstStreamFrame {
            stream_id,
            error_code: ErrorCode::from_u32(u32::from_be_bytes([p[0], p[1], p[2], p[3]])),
        })
    }

    /// Decode a SETTINGS frame
    pub fn decode_settings_frame(frame: &Frame) -> Result<SettingsFrame> {
        Self::require_connection(frame)?;

        if frame.flags().is_ack() {
            Self::require_len(frame, 0)?;
            return Ok(SettingsFrame::ack());
        }

        Ok(SettingsFrame::new(Settings::decode(&frame.payload)?))
    }

    /// Decode a PING frame
    pub fn decode_ping_frame(frame: &Frame) -> Result<PingFrame> {
        Self::require_connection(frame)?;
        Self::require_len(frame, 8)?;

        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload);
        Ok(PingFrame {
            ack: frame.flags().is_ack(),
            data,
        })
    }

    /// Decode a GOAWAY frame
    pub fn decode_goaway_frame(frame: &Frame) -> Result<GoawayFrame> {
        Self::require_connection(frame)?;

        let p = &frame.payload;
        if p.len() < 8 {
            return Err(Error::FrameSize(format!("{} shorter than 8 bytes", frame)));
        }

        Ok(GoawayFrame {
            last_stream_id: u32::from_be_bytes([p[0] & 0x7F, p[1], p[2], p[3]]),
            error_code: ErrorCode::from_u32(u32::from_be_bytes([p[4], p[5], p[6], p[7]])),
            debug_data: p.slice(8..),
        })
    }

    /// Decode a WINDOW_UPDATE frame
    pub fn decode_window_update_frame(frame: &Frame) -> Result<WindowUpdateFrame> {
        Self::require_len(frame, 4)?;

        let p = &frame.payload;
        Ok(WindowUpdateFrame {
            stream_id: frame.stream_id(),
            size_increment: u32::from_be_bytes([p[0] & 0x7F, p[1], p[2], p[3]]),
        })
    }

    /// Write an encoded frame to any writer
    pub fn write_frame<W: Write>(writer: &mut W, frame_data: &[u8]) -> io::Result<()> {
        writer.write_all(frame_data)?;
        writer.flush()
    }

    /// Read one frame from any reader
    pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: usize) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        reader.read_exact(&mut header).map_err(map_read_error)?;

        let header = Self::decode_header(&header);
        Self::check_length(&header, max_frame_size)?;

        let mut payload = vec![0u8; header.length];
        reader.read_exact(&mut payload).map_err(map_read_error)?;

        Ok(Frame {
            header,
            payload: Bytes::from(payload),
        })
    }

    /// Read one frame from an HttpSession, honouring its timeout and deadline
    pub fn read_frame_from_session<S: SessionOps>(
        session: &mut HttpSession<S>,
        max_frame_size: usize,
    ) -> Result<Frame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        session.read_exact(&mut header)?;

        let header = Self::decode_header(&header);
        Self::check_length(&header, max_frame_size)?;

        let mut payload = vec![0u8; header.length];
        session.read_exact(&mut payload)?;

        Ok(Frame {
            header,
            payload: Bytes::from(payload),
        })
    }

    fn check_length(header: &FrameHeader, max_frame_size: usize) -> Result<()> {
        if header.length > max_frame_size.min(MAX_FRAME_SIZE) {
            return Err(Error::FrameSize(format!(
                "Frame payload of {} bytes exceeds maximum {}",
                header.length, max_frame_size
            )));
        }
        Ok(())
    }
}

fn map_read_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::from(err)
    }
}
