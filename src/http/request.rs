use bytes::Bytes;
use std::net::SocketAddr;
use url::Url;

use crate::error::HttpError;
use crate::http::channel::BodyChannel;

/// Ordered `(name, value)` header pairs, names kept in their original case.
pub type HeaderList = Vec<(Bytes, Bytes)>;

/// HTTP request methods.
///
/// Anything outside this set is rejected by the parser as a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, typically uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use switchyard::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

/// Where the request body lives.
///
/// Exactly one form is active per request; which one is decided before the
/// pipeline runs, from the pipeline's streaming intent.
#[derive(Debug, Clone)]
pub enum Body {
    /// The whole body, already received.
    Full(Bytes),
    /// Chunks delivered as they arrive.
    Stream(BodyChannel),
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Bytes::new())
    }
}

/// A request as handed across the connection/pipeline boundary.
///
/// Built once the header block is complete; only the body placeholder is
/// filled in afterwards.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// `http` or `https`, or the scheme of an absolute-form target
    pub scheme: String,
    /// The request path without the query string
    pub path: String,
    /// Raw query string, without the leading `?`
    pub query_string: Bytes,
    /// HTTP version as `"1.1"` / `"1.0"`
    pub http_version: String,
    /// Request headers in arrival order, original case
    pub headers: HeaderList,
    pub body: Body,
    /// Peer address of the client
    pub client: Option<SocketAddr>,
    /// Local address the connection was accepted on
    pub server: Option<SocketAddr>,
}

impl RequestMessage {
    /// Retrieves a header value by name (case-insensitive).
    ///
    /// # Arguments
    ///
    /// * `key` - Header name to look up
    ///
    /// # Returns
    ///
    /// The first matching value, `None` if absent.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key.as_bytes()))
            .map(|(_, value)| value.as_ref())
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Determines whether the client asked to keep the connection open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 only keeps alive with an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection");
        if self.http_version == "1.0" {
            connection
                .map(|v| v.eq_ignore_ascii_case(b"keep-alive"))
                .unwrap_or(false)
        } else {
            !connection
                .map(|v| v.eq_ignore_ascii_case(b"close"))
                .unwrap_or(false)
        }
    }

    /// The materialized body, if this request was not dispatched as a stream.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    /// The body channel, if this request was dispatched as a stream.
    pub fn stream(&self) -> Option<&BodyChannel> {
        match &self.body {
            Body::Stream(channel) => Some(channel),
            Body::Full(_) => None,
        }
    }
}

/// Splits a request target into `(scheme, path, query)`.
///
/// Origin-form targets keep `default_scheme`; absolute-form targets carry
/// their own.
pub(crate) fn split_target(
    target: &[u8],
    default_scheme: &str,
) -> Result<(String, String, Bytes), HttpError> {
    let text = std::str::from_utf8(target).map_err(|_| HttpError::bad_request())?;

    if text.starts_with('/') || text == "*" {
        let (path, query) = match text.split_once('?') {
            Some((path, query)) => (path, query),
            None => (text, ""),
        };
        return Ok((
            default_scheme.to_string(),
            path.to_string(),
            Bytes::copy_from_slice(query.as_bytes()),
        ));
    }

    let url = Url::parse(text).map_err(|_| HttpError::bad_request())?;
    let query = url.query().unwrap_or_default();
    Ok((
        url.scheme().to_string(),
        url.path().to_string(),
        Bytes::copy_from_slice(query.as_bytes()),
    ))
}

/// Builder for constructing RequestMessage objects, mostly for tests and
/// pipelines that synthesize requests.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    query_string: Bytes,
    version: Option<String>,
    headers: HeaderList,
    body: Bytes,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            query_string: Bytes::new(),
            version: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn query_string(mut self, query: impl Into<Bytes>) -> Self {
        self.query_string = query.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<RequestMessage, &'static str> {
        Ok(RequestMessage {
            method: self.method.ok_or("method missing")?,
            scheme: "http".to_string(),
            path: self.path.ok_or("path missing")?,
            query_string: self.query_string,
            http_version: self.version.unwrap_or_else(|| "1.1".to_string()),
            headers: self.headers,
            body: Body::Full(self.body),
            client: None,
            server: None,
        })
    }
}
