use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::HttpError;
use crate::http::channel::ResponseStream;
use crate::http::connection::Upgraded;
use crate::http::request::HeaderList;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An HTTP status code.
///
/// Any numeric code can be carried; the associated constants cover the ones
/// the engine emits itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    pub const fn from_u16(code: u16) -> Self {
        StatusCode(code)
    }

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use switchyard::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// Unregistered codes get `"Unknown Status"` so a status line can always
    /// be written.
    ///
    /// # Example
    ///
    /// ```
    /// # use switchyard::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::PAYLOAD_TOO_LARGE.reason_phrase(), "Request Entity Too Large");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            208 => "Already Reported",
            226 => "IM Used",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Requested Range Not Satisfiable",
            417 => "Expectation Failed",
            422 => "Unprocessable Entity",
            423 => "Locked",
            424 => "Failed Dependency",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            506 => "Variant Also Negotiates",
            507 => "Insufficient Storage",
            508 => "Loop Detected",
            510 => "Not Extended",
            511 => "Network Authentication Required",
            _ => "Unknown Status",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Status line, headers and body as handed to the connection serializer.
///
/// With `more_content = false` this is a complete response; with `true` it
/// opens a chunked response continued by [`ResponseChunk`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub content: Bytes,
    pub more_content: bool,
}

/// Continuation of a streamed response. The terminating chunk is empty with
/// `more_content = false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub content: Bytes,
    pub more_content: bool,
}

impl ResponseChunk {
    pub fn data(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            more_content: true,
        }
    }

    pub fn last() -> Self {
        Self {
            content: Bytes::new(),
            more_content: false,
        }
    }
}

/// Hands the raw transport to an upgraded protocol once the head is written.
pub type UpgradeHandler = Box<dyn FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send>;

/// Everything a Reply Channel can carry to the connection.
pub enum Outgoing {
    Response(ResponseMessage),
    Chunk(ResponseChunk),
    Upgrade(ResponseMessage, UpgradeHandler),
}

impl fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outgoing::Response(message) => f.debug_tuple("Response").field(message).finish(),
            Outgoing::Chunk(chunk) => f.debug_tuple("Chunk").field(chunk).finish(),
            Outgoing::Upgrade(message, _) => f.debug_tuple("Upgrade").field(message).finish(),
        }
    }
}

impl From<ResponseMessage> for Outgoing {
    fn from(message: ResponseMessage) -> Self {
        Outgoing::Response(message)
    }
}

impl From<ResponseChunk> for Outgoing {
    fn from(chunk: ResponseChunk) -> Self {
        Outgoing::Chunk(chunk)
    }
}

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// A complete, in-memory HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// Headers in the order they will be written
    pub headers: HeaderList,
    /// Response body as bytes
    pub body: Bytes,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```
/// # use switchyard::http::response::{ResponseBuilder, StatusCode};
/// let response = ResponseBuilder::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body("{}")
///     .build();
/// assert_eq!(response.header("content-type"), Some(&b"application/json"[..]));
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderList,
    body: Bytes,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header. Repeated names are kept, in order.
    pub fn header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the final Response.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` unless one was given.
    /// `Content-Length` is left to the serializer.
    pub fn build(mut self) -> Response {
        if !has_header(&self.headers, b"content-type") {
            self.headers.push((
                Bytes::from_static(b"Content-Type"),
                Bytes::from_static(DEFAULT_CONTENT_TYPE.as_bytes()),
            ));
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    pub fn builder(status: StatusCode) -> ResponseBuilder {
        ResponseBuilder::new(status)
    }

    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK).body(body).build()
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        ResponseBuilder::new(status).body(body.into()).build()
    }

    /// Serializes `value` as the body with `Content-Type: application/json`.
    pub fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HttpError::server_error(format!("failed to encode json: {e}")))?;
        Ok(ResponseBuilder::new(status)
            .header("Content-Type", "application/json")
            .body(body)
            .build())
    }

    /// Default rendering of an error condition: `Error: <message>`.
    pub fn from_error(error: &HttpError) -> Self {
        Self::text(error.status(), format!("Error: {error}"))
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, "Error: Not Found")
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name.as_bytes())
    }

    /// Produces the wire-level message; `more_content` marks a streamed head.
    pub fn to_message(&self, more_content: bool) -> ResponseMessage {
        ResponseMessage {
            status: self.status,
            headers: self.headers.clone(),
            content: self.body.clone(),
            more_content,
        }
    }

    pub fn into_message(self) -> ResponseMessage {
        ResponseMessage {
            status: self.status,
            headers: self.headers,
            content: self.body,
            more_content: false,
        }
    }
}

type Producer = Box<dyn FnOnce(ResponseStream) -> BoxFuture<'static, Result<(), HttpError>> + Send>;

/// A response whose body is produced incrementally with chunked framing.
///
/// ```ignore
/// StreamingResponse::new(StatusCode::OK, |mut stream| async move {
///     stream.write("foo,").await?;
///     stream.write("bar").await
/// })
/// ```
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    producer: Producer,
}

impl StreamingResponse {
    pub fn new<F, Fut>(status: StatusCode, producer: F) -> Self
    where
        F: FnOnce(ResponseStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HttpError>> + Send + 'static,
    {
        Self {
            status,
            headers: vec![
                (
                    Bytes::from_static(b"Content-Type"),
                    Bytes::from_static(DEFAULT_CONTENT_TYPE.as_bytes()),
                ),
                (
                    Bytes::from_static(b"Transfer-Encoding"),
                    Bytes::from_static(b"chunked"),
                ),
            ],
            producer: Box::new(move |stream| Box::pin(producer(stream))),
        }
    }

    /// Adds a header. `Content-Length` is dropped since the body is chunked;
    /// a `Content-Type` replaces the default one.
    pub fn header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        let key = key.into();
        if key.eq_ignore_ascii_case(b"content-length") {
            return self;
        }
        if key.eq_ignore_ascii_case(b"content-type") {
            self.headers
                .retain(|(name, _)| !name.eq_ignore_ascii_case(b"content-type"));
        }
        self.headers.push((key, value.into()));
        self
    }

    /// The opening message: status and headers, no body, more content to follow.
    pub fn head_message(&self) -> ResponseMessage {
        ResponseMessage {
            status: self.status,
            headers: self.headers.clone(),
            content: Bytes::new(),
            more_content: true,
        }
    }

    pub(crate) fn into_producer(self) -> Producer {
        self.producer
    }
}

/// A protocol switch: the head is written, then `handler` owns the transport.
pub struct UpgradeResponse {
    pub status: StatusCode,
    pub headers: HeaderList,
    handler: UpgradeHandler,
}

impl UpgradeResponse {
    pub fn new<F, Fut>(headers: HeaderList, handler: F) -> Self
    where
        F: FnOnce(Upgraded) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers,
            handler: Box::new(move |io| Box::pin(handler(io))),
        }
    }

    pub(crate) fn into_outgoing(self) -> Outgoing {
        let head = ResponseMessage {
            status: self.status,
            headers: self.headers,
            content: Bytes::new(),
            more_content: false,
        };
        Outgoing::Upgrade(head, self.handler)
    }
}

/// What a pipeline hands back for one request.
pub enum Reply {
    /// One complete response.
    Simple(Response),
    /// Head now, body chunks as the producer writes them.
    Streaming(StreamingResponse),
    /// Head now, then the transport belongs to the handler.
    Upgrade(UpgradeResponse),
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Simple(response)
    }
}

impl From<StreamingResponse> for Reply {
    fn from(response: StreamingResponse) -> Self {
        Reply::Streaming(response)
    }
}

impl From<UpgradeResponse> for Reply {
    fn from(response: UpgradeResponse) -> Self {
        Reply::Upgrade(response)
    }
}

fn find_header<'a>(headers: &'a HeaderList, name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_ref())
}

fn has_header(headers: &HeaderList, name: &[u8]) -> bool {
    find_header(headers, name).is_some()
}
