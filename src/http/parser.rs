//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are fed through a caller-owned `BytesMut`; each call to
//! [`RequestParser::parse`] consumes what it can and yields at most one
//! [`ParseEvent`]. `Ok(None)` means more bytes are needed (or the message is
//! finished and the parser is waiting to be discarded).

use bytes::{Buf, Bytes, BytesMut};

use crate::http::request::Method;

/// Longest request line, header line or chunk-size line accepted.
const MAX_LINE_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_METHOD_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunkSize,
    LineTooLong,
    TooManyHeaders,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::InvalidRequest => "invalid request line",
            ParseError::InvalidMethod => "invalid HTTP method",
            ParseError::InvalidVersion => "unsupported HTTP version",
            ParseError::InvalidHeader => "invalid header",
            ParseError::InvalidContentLength => "invalid content-length",
            ParseError::InvalidChunkSize => "invalid chunk size",
            ParseError::LineTooLong => "line too long",
            ParseError::TooManyHeaders => "too many headers",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

/// One step of request assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    RequestLine { method: Method, target: Bytes },
    Header { name: Bytes, value: Bytes },
    HeadersComplete,
    Body(Bytes),
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
    Upgraded,
}

#[derive(Debug)]
pub struct RequestParser {
    state: State,
    minor_version: u8,
    header_count: usize,
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    connection_keep_alive: bool,
    connection_upgrade: bool,
    has_upgrade_header: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::RequestLine,
            minor_version: 1,
            header_count: 0,
            content_length: None,
            chunked: false,
            connection_close: false,
            connection_keep_alive: false,
            connection_upgrade: false,
            has_upgrade_header: false,
        }
    }

    /// Consumes bytes from `buf` until one event is produced or more input is
    /// needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            match self.state {
                State::RequestLine => return self.parse_request_line(buf),
                State::Headers => return self.parse_header(buf),
                State::Body { remaining } => {
                    if remaining == 0 {
                        return Ok(Some(self.finish_message()));
                    }
                    match take_body(buf, remaining) {
                        Some(data) => {
                            self.state = State::Body {
                                remaining: remaining - data.len() as u64,
                            };
                            return Ok(Some(ParseEvent::Body(data)));
                        }
                        None => return Ok(None),
                    }
                }
                State::ChunkSize => {
                    let Some(line) = take_line(buf, ParseError::InvalidChunkSize)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => match take_body(buf, remaining) {
                    Some(data) => {
                        let left = remaining - data.len() as u64;
                        self.state = if left == 0 {
                            State::ChunkDataEnd
                        } else {
                            State::ChunkData { remaining: left }
                        };
                        return Ok(Some(ParseEvent::Body(data)));
                    }
                    None => return Ok(None),
                },
                State::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunkSize);
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(line) = take_line(buf, ParseError::InvalidHeader)? else {
                        return Ok(None);
                    };
                    // trailer fields are read past and dropped
                    if line.is_empty() {
                        return Ok(Some(self.finish_message()));
                    }
                }
                State::Complete | State::Upgraded => return Ok(None),
            }
        }
    }

    /// HTTP version as `"1.1"` or `"1.0"`.
    pub fn http_version(&self) -> &'static str {
        if self.minor_version == 0 { "1.0" } else { "1.1" }
    }

    /// Keep-alive as negotiated by the request itself.
    pub fn should_keep_alive(&self) -> bool {
        if self.is_upgrade() {
            return false;
        }
        if self.minor_version == 0 {
            self.connection_keep_alive && !self.connection_close
        } else {
            !self.connection_close
        }
    }

    /// `Upgrade` header present together with `Connection: upgrade`.
    pub fn is_upgrade(&self) -> bool {
        self.has_upgrade_header && self.connection_upgrade
    }

    pub fn is_message_complete(&self) -> bool {
        matches!(self.state, State::Complete | State::Upgraded)
    }

    pub fn headers_complete(&self) -> bool {
        !matches!(self.state, State::RequestLine | State::Headers)
    }

    fn parse_request_line(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        // tolerate stray CRLFs between messages
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
        if &buf[..] == b"\r" {
            return Ok(None);
        }

        // reject a bad method as soon as its bytes show up
        let method_end = buf.iter().position(|b| *b == b' ').unwrap_or(buf.len());
        if method_end > MAX_METHOD_LEN
            || !buf[..method_end].iter().all(|b| b.is_ascii_uppercase())
        {
            return Err(ParseError::InvalidMethod);
        }

        let Some(line) = take_line(buf, ParseError::LineTooLong)? else {
            return Ok(None);
        };

        let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
        let method = parts.next().ok_or(ParseError::InvalidRequest)?;
        let target = parts.next().ok_or(ParseError::InvalidRequest)?;
        let version = parts.next().ok_or(ParseError::InvalidRequest)?;
        if parts.next().is_some() {
            return Err(ParseError::InvalidRequest);
        }

        let method = std::str::from_utf8(method)
            .ok()
            .and_then(Method::from_str)
            .ok_or(ParseError::InvalidMethod)?;

        self.minor_version = match version {
            b"HTTP/1.1" => 1,
            b"HTTP/1.0" => 0,
            _ => return Err(ParseError::InvalidVersion),
        };

        if target.iter().any(|b| b.is_ascii_control()) {
            return Err(ParseError::InvalidRequest);
        }

        let target = line.slice_ref(target);
        self.state = State::Headers;
        Ok(Some(ParseEvent::RequestLine { method, target }))
    }

    fn parse_header(&mut self, buf: &mut BytesMut) -> Result<Option<ParseEvent>, ParseError> {
        let Some(line) = take_line(buf, ParseError::LineTooLong)? else {
            return Ok(None);
        };

        if line.is_empty() {
            self.state = self.body_state();
            return Ok(Some(ParseEvent::HeadersComplete));
        }

        self.header_count += 1;
        if self.header_count > MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }

        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(ParseError::InvalidHeader);
        }
        let value = trim(&line[colon + 1..]);

        self.observe_header(name, value)?;

        Ok(Some(ParseEvent::Header {
            name: line.slice_ref(name),
            value: line.slice_ref(value),
        }))
    }

    /// Tracks the headers that drive framing and keep-alive.
    fn observe_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), ParseError> {
        if name.eq_ignore_ascii_case(b"content-length") {
            let length = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(ParseError::InvalidContentLength)?;
            if self.content_length.is_some_and(|existing| existing != length) {
                return Err(ParseError::InvalidContentLength);
            }
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            self.chunked = value
                .split(|b| *b == b',')
                .next_back()
                .map(|coding| trim(coding).eq_ignore_ascii_case(b"chunked"))
                .unwrap_or(false);
        } else if name.eq_ignore_ascii_case(b"connection") {
            for token in value.split(|b| *b == b',').map(trim) {
                if token.eq_ignore_ascii_case(b"close") {
                    self.connection_close = true;
                } else if token.eq_ignore_ascii_case(b"keep-alive") {
                    self.connection_keep_alive = true;
                } else if token.eq_ignore_ascii_case(b"upgrade") {
                    self.connection_upgrade = true;
                }
            }
        } else if name.eq_ignore_ascii_case(b"upgrade") {
            self.has_upgrade_header = true;
        }
        Ok(())
    }

    fn body_state(&self) -> State {
        if self.is_upgrade() {
            State::Body { remaining: 0 }
        } else if self.chunked {
            State::ChunkSize
        } else {
            State::Body {
                remaining: self.content_length.unwrap_or(0),
            }
        }
    }

    fn finish_message(&mut self) -> ParseEvent {
        self.state = if self.is_upgrade() {
            State::Upgraded
        } else {
            State::Complete
        };
        ParseEvent::MessageComplete
    }
}

/// Splits one CRLF-terminated line off `buf`, without the terminator.
fn take_line(buf: &mut BytesMut, too_long: ParseError) -> Result<Option<Bytes>, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => {
            if end > MAX_LINE_LEN {
                return Err(too_long);
            }
            let line = buf.split_to(end).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE_LEN => Err(too_long),
        None => Ok(None),
    }
}

fn take_body(buf: &mut BytesMut, remaining: u64) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
    Some(buf.split_to(n).freeze())
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|b| *b == b';').next().map(trim).unwrap_or_default();
    let size = std::str::from_utf8(size).map_err(|_| ParseError::InvalidChunkSize)?;
    if size.is_empty() {
        return Err(ParseError::InvalidChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut RequestParser, buf: &mut BytesMut) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        while let Some(event) = parser.parse(buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn parse_simple_get() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]);
        let mut parser = RequestParser::new();
        let events = drain(&mut parser, &mut buf);

        assert_eq!(
            events,
            vec![
                ParseEvent::RequestLine {
                    method: Method::GET,
                    target: Bytes::from_static(b"/"),
                },
                ParseEvent::Header {
                    name: Bytes::from_static(b"Host"),
                    value: Bytes::from_static(b"example.com"),
                },
                ParseEvent::HeadersComplete,
                ParseEvent::MessageComplete,
            ]
        );
        assert!(buf.is_empty());
        assert!(parser.is_message_complete());
    }

    #[test]
    fn lowercase_method_fails_before_line_end() {
        let mut buf = BytesMut::from(&b"not http"[..]);
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse(&mut buf), Err(ParseError::InvalidMethod));
    }

    #[test]
    fn chunk_extensions_and_trailers() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n0\r\nX-Trailer: y\r\n\r\n"[..],
        );
        let mut parser = RequestParser::new();
        let events = drain(&mut parser, &mut buf);

        assert!(events.contains(&ParseEvent::Body(Bytes::from_static(b"abc"))));
        assert_eq!(events.last(), Some(&ParseEvent::MessageComplete));
    }

    #[test]
    fn trim_handles_blank() {
        assert_eq!(trim(b"  "), b"");
        assert_eq!(trim(b" a b\t"), b"a b");
    }
}
