//! HTTP/1.x response head parsing
//!
//! The CONNECT reply is a status line plus headers with no body, so the
//! parser stops at the blank line and leaves any following bytes in its
//! buffer for the caller to inspect.

use super::{Error, Headers, Result, Status, Version, MAX_HEAD_SIZE};

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse HTTP response status line
///
/// Format: VERSION SP STATUS [SP REASON]
/// Example: HTTP/1.1 200 Connection Established
///
/// The status code must be exactly three digits; a line such as
/// `HTTP/1.1 200OK` is rejected rather than read as 200.
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = Version::from_str(parts[0])?;
    let status = Status::parse(parts[1])?;
    let reason = match parts.get(2) {
        Some(reason) => reason.trim().to_string(),
        None => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// A parsed response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// The raw status line, without CRLF
    pub status_line: String,
    /// HTTP version
    pub version: Version,
    /// Status code
    pub status: Status,
    /// Reason phrase
    pub reason: String,
    /// Header fields
    pub headers: Headers,
    /// Size of the head on the wire, including the blank line
    pub wire_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    StatusLine,
    Headers,
    Complete,
}

/// Incremental response head parser
pub struct ResponseHeadParser {
    state: ParserState,
    buffer: Vec<u8>,
    consumed: usize,
    max_size: usize,
    status_line: Option<(String, Version, Status, String)>,
    headers: Headers,
}

impl ResponseHeadParser {
    /// Create a new parser with the default head size limit
    pub fn new() -> Self {
        Self::with_max_size(MAX_HEAD_SIZE)
    }

    /// Create a new parser with a custom head size limit
    pub fn with_max_size(max_size: usize) -> Self {
        ResponseHeadParser {
            state: ParserState::StatusLine,
            buffer: Vec::new(),
            consumed: 0,
            max_size,
            status_line: None,
            headers: Headers::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(head)) once the blank line has been seen,
    /// Ok(None) if more data is needed, or Err on parse error.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<ResponseHead>> {
        if self.state == ParserState::Complete {
            self.buffer.extend_from_slice(data);
            return Ok(None);
        }

        self.buffer.extend_from_slice(data);

        let result = loop {
            let Some(crlf_pos) = find_crlf(&self.buffer) else {
                break None;
            };

            let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).to_string();
            self.buffer.drain(..crlf_pos + 2);
            self.consumed += crlf_pos + 2;

            match self.state {
                ParserState::StatusLine => {
                    let (version, status, reason) = parse_status_line(&line)?;
                    self.status_line = Some((line, version, status, reason));
                    self.state = ParserState::Headers;
                }
                ParserState::Headers if line.is_empty() => {
                    self.state = ParserState::Complete;
                    break Some(self.finish()?);
                }
                ParserState::Headers => {
                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParserState::Complete => unreachable!("complete state handled above"),
            }

            if self.consumed > self.max_size {
                return Err(Error::HeadTooLarge(self.max_size));
            }
        };

        if result.is_none() && self.consumed + self.buffer.len() > self.max_size {
            return Err(Error::HeadTooLarge(self.max_size));
        }

        Ok(result)
    }

    fn finish(&mut self) -> Result<ResponseHead> {
        let (status_line, version, status, reason) = self
            .status_line
            .take()
            .ok_or_else(|| Error::Parse("Missing status line".to_string()))?;

        Ok(ResponseHead {
            status_line,
            version,
            status,
            reason,
            headers: std::mem::take(&mut self.headers),
            wire_len: self.consumed,
        })
    }

    /// Check whether the head has been fully parsed
    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    /// Bytes received after the end of the head
    pub fn remaining(&self) -> &[u8] {
        if self.is_complete() {
            &self.buffer
        } else {
            &[]
        }
    }
}

impl Default for ResponseHeadParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) =
            parse_status_line("HTTP/1.1 200 Connection Established").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "Connection Established");

        // Without reason phrase
        let (version, status, reason) = parse_status_line("HTTP/1.0 403").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status.code(), 403);
        assert_eq!(reason, "Forbidden");
    }

    #[test]
    fn test_parse_status_line_strict_code() {
        assert!(parse_status_line("HTTP/1.1 200OK-but-actually-420").is_err());
        assert!(parse_status_line("HTTP/1.1 2000 OK").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("SSH-2.0-OpenSSH_9.6 200").is_err());
    }

    #[test]
    fn test_head_parser_single_chunk() {
        let mut parser = ResponseHeadParser::new();
        let head = parser
            .parse(b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: test\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(head.status.code(), 200);
        assert_eq!(head.status_line, "HTTP/1.1 200 Connection Established");
        assert_eq!(head.headers.get("proxy-agent"), Some("test"));
        assert_eq!(head.wire_len, 59);
        assert!(parser.remaining().is_empty());
    }

    #[test]
    fn test_head_parser_incremental() {
        let mut parser = ResponseHeadParser::new();

        assert!(parser.parse(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.parse(b"200 Connection Established\r").unwrap().is_none());
        assert!(parser.parse(b"\n").unwrap().is_none());
        assert!(parser.parse(b"Via: 1.1 proxy\r\n\r").unwrap().is_none());
        let head = parser.parse(b"\n").unwrap().unwrap();

        assert_eq!(head.status, Status::OK);
        assert_eq!(head.headers.get("Via"), Some("1.1 proxy"));
    }

    #[test]
    fn test_head_parser_200_in_header_value_only() {
        let mut parser = ResponseHeadParser::new();
        let head = parser
            .parse(b"HTTP/1.1 403 Forbidden\r\nX-Trace: 200\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.status.code(), 403);
    }

    #[test]
    fn test_head_parser_keeps_trailing_bytes() {
        let mut parser = ResponseHeadParser::new();
        let head = parser.parse(b"HTTP/1.1 200 OK\r\n\r\nextra").unwrap();
        assert!(head.is_some());
        assert_eq!(parser.remaining(), b"extra");
    }

    #[test]
    fn test_head_parser_size_limit() {
        let mut parser = ResponseHeadParser::with_max_size(64);
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\n").unwrap().is_none());

        let filler = vec![b'a'; 80];
        let result = parser.parse(&filler);
        assert!(matches!(result, Err(Error::HeadTooLarge(64))));
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"Hello\r\nWorld"), Some(5));
        assert_eq!(find_crlf(b"NoEOL"), None);
        assert_eq!(find_crlf(b"\r\n"), Some(0));
    }
}
