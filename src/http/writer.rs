//! Response serialization.
//!
//! The engine owns the `Connection` header and, for complete responses, fills
//! in `Content-Length` when the caller left it out. Streamed bodies use
//! chunked framing.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::request::HeaderList;
use crate::http::response::ResponseMessage;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Terminator of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// What the caller's headers already say about framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderCheck {
    /// A `Connection: close` header is present.
    pub connection_close: bool,
    /// A `Content-Length` header is present.
    pub content_length: bool,
}

/// Scans response headers with exact, case-sensitive matches.
pub fn check_headers(headers: &HeaderList) -> HeaderCheck {
    let mut check = HeaderCheck::default();
    for (key, value) in headers {
        if &key[..] == b"Connection" && &value[..] == b"close" {
            check.connection_close = true;
        }
        if &key[..] == b"Content-Length" {
            check.content_length = true;
        }
    }
    check
}

/// Serializes a complete response, or the head of a streamed one when
/// `message.more_content` is set.
pub fn serialize_response(
    message: &ResponseMessage,
    keep_alive: bool,
    keep_alive_timeout: Option<u64>,
) -> BytesMut {
    let check = check_headers(&message.headers);
    let mut buf = BytesMut::with_capacity(256 + message.content.len());

    write_status_line(&mut buf, message);
    buf.put_slice(b"Connection: ");
    buf.put_slice(if keep_alive { &b"keep-alive"[..] } else { &b"close"[..] });
    buf.put_slice(b"\r\n");

    if keep_alive {
        if let Some(timeout) = keep_alive_timeout {
            buf.put_slice(format!("Keep-Alive: {timeout}\r\n").as_bytes());
        }
    }

    if !message.more_content && !check.content_length {
        buf.put_slice(format!("Content-Length: {}\r\n", message.content.len()).as_bytes());
    }

    write_headers(&mut buf, &message.headers);

    // Header/body separator
    buf.put_slice(b"\r\n");
    buf.put_slice(&message.content);

    buf
}

/// Serializes the head of a protocol switch. No body framing is added.
pub fn serialize_upgrade(message: &ResponseMessage) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);

    write_status_line(&mut buf, message);
    buf.put_slice(b"Connection: upgrade\r\n");
    write_headers(&mut buf, &message.headers);
    buf.put_slice(b"\r\n");

    buf
}

/// Frames one chunk of a streamed body: `<hex-length>\r\n<bytes>\r\n`.
pub fn encode_chunk(content: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(content.len() + 12);
    buf.put_slice(format!("{:x}\r\n", content.len()).as_bytes());
    buf.put_slice(content);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn write_status_line(buf: &mut BytesMut, message: &ResponseMessage) {
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        message.status.as_u16(),
        message.status.reason_phrase()
    );
    buf.put_slice(status_line.as_bytes());
}

fn write_headers(buf: &mut BytesMut, headers: &HeaderList) {
    for (k, v) in headers {
        // the engine decides the connection's fate
        if &k[..] == b"Connection" {
            continue;
        }
        buf.put_slice(k);
        buf.put_slice(b": ");
        buf.put_slice(v);
        buf.put_slice(b"\r\n");
    }
}

/// Writes a serialized buffer to a stream, resuming after partial writes.
pub struct ResponseWriter {
    buffer: Bytes,
    written: usize,
}

impl ResponseWriter {
    pub fn new(buffer: impl Into<Bytes>) -> Self {
        Self {
            buffer: buffer.into(),
            written: 0,
        }
    }

    pub async fn write_to_stream<S>(&mut self, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        while self.written < self.buffer.len() {
            let n = stream.write(&self.buffer[self.written..]).await?;

            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }

            self.written += n;
        }

        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::StatusCode;

    fn message(headers: HeaderList, content: &'static [u8], more_content: bool) -> ResponseMessage {
        ResponseMessage {
            status: StatusCode::OK,
            headers,
            content: Bytes::from_static(content),
            more_content,
        }
    }

    #[test]
    fn caller_connection_header_is_replaced() {
        let headers = vec![(Bytes::from_static(b"Connection"), Bytes::from_static(b"upgrade"))];
        let out = serialize_response(&message(headers, b"", false), false, None);
        let text = String::from_utf8(out.to_vec()).unwrap();

        assert_eq!(text.matches("Connection:").count(), 1);
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn streamed_head_has_no_length() {
        let out = serialize_response(&message(Vec::new(), b"", true), true, Some(5));
        let text = String::from_utf8(out.to_vec()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nKeep-Alive: 5\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunk_framing_uses_hex_length() {
        assert_eq!(&encode_chunk(&[b'x'; 26])[..4], b"1a\r\n");
        assert!(encode_chunk(b"abc").ends_with(b"abc\r\n"));
    }

    #[tokio::test]
    async fn writer_flushes_whole_buffer() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(Bytes::from_static(b"hello"));
        writer.write_to_stream(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
