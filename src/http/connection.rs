//! One transport, one request at a time.
//!
//! A [`Connection`] owns its transport and drives everything that happens on
//! it from a single task: bytes are fed to the parser, parser events build the
//! request and fill its body channel, the pipeline runs as a separate task,
//! and whatever it sends back on the reply channel is serialized here.
//!
//! ```text
//!   Idle ──first byte──▶ ParsingHeaders ──headers──▶ ParsingBody
//!    ▲                                                   │ message complete
//!    │ keep-alive                                        ▼
//!    └──────────── Responding ◀──── response head ── Dispatched
//!                      │
//!                      └── close / error / timeout ──▶ Closed
//! ```
//!
//! The request timer runs for the whole life of the connection. It measures
//! from the last completed response (or from accept), so an idle keep-alive
//! connection and a slow handler both end in `408 Request Timeout`.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, trace, warn};

use crate::error::HttpError;
use crate::http::channel::{BodyChannel, BodyChunk, BodySender, ReplyChannel};
use crate::http::parser::{ParseEvent, RequestParser};
use crate::http::pipeline::{self, fallback_response};
use crate::http::request::{Body, HeaderList, Method, RequestMessage, split_target};
use crate::http::response::{
    Outgoing, Reply, ResponseChunk, ResponseMessage, StatusCode, UpgradeHandler,
};
use crate::http::writer::{
    LAST_CHUNK, ResponseWriter, check_headers, encode_chunk, serialize_response,
    serialize_upgrade,
};
use crate::server::context::{ConnectionGuard, ServerContext};

const READ_BUFFER: usize = 8 * 1024;

/// Any byte stream a connection can run on: plain TCP, TLS, or an in-memory
/// duplex in tests.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// The transport handed to an upgrade handler after the `101` head is written.
pub struct Upgraded {
    pub io: Box<dyn Io>,
    /// Bytes the client sent after the upgrade request, already read off the
    /// transport.
    pub buffered: Bytes,
}

/// Requests a worker can make of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Close only if no request is in progress.
    CloseIfIdle,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ParsingHeaders,
    ParsingBody,
    Dispatched,
    Responding,
    Closed,
}

enum Event {
    Timeout,
    Control(Option<Control>),
    Reply(Option<Outgoing>),
    Read(io::Result<usize>),
}

pub struct Connection<S: Io> {
    transport: Option<S>,
    ctx: ServerContext,
    guard: ConnectionGuard,
    control: mpsc::UnboundedReceiver<Control>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    scheme: &'static str,
    state: ConnectionState,

    inbound: BytesMut,
    buffer: BytesMut,
    parser: Option<RequestParser>,
    method: Option<Method>,
    target: Bytes,
    headers: HeaderList,
    total_request_size: usize,
    /// Bytes queued behind the current request passed the size ceiling; the
    /// next thing written after the current response is a 413.
    overflowed: bool,

    last_activity: Instant,
    timer: Pin<Box<Sleep>>,
    keep_alive: bool,

    request: Option<RequestMessage>,
    body: Option<BodySender>,
    replies: Option<mpsc::UnboundedReceiver<Outgoing>>,
    dispatch: Option<JoinHandle<()>>,
    status: Option<StatusCode>,
}

impl<S: Io> Connection<S> {
    /// Wraps an accepted transport and registers it with the worker.
    ///
    /// The request timer starts now.
    pub fn new(transport: S, ctx: ServerContext) -> Self {
        let (guard, control) = ctx.connections.register();
        let now = Instant::now();
        let timeout = ctx.limits.request_timeout;
        let keep_alive = ctx.limits.keep_alive;

        Self {
            transport: Some(transport),
            ctx,
            guard,
            control,
            peer: None,
            local: None,
            scheme: "http",
            state: ConnectionState::Idle,
            inbound: BytesMut::with_capacity(READ_BUFFER),
            buffer: BytesMut::new(),
            parser: None,
            method: None,
            target: Bytes::new(),
            headers: Vec::new(),
            total_request_size: 0,
            overflowed: false,
            last_activity: now,
            timer: Box::pin(tokio::time::sleep_until(now + timeout)),
            keep_alive,
            request: None,
            body: None,
            replies: None,
            dispatch: None,
            status: None,
        }
    }

    pub fn with_addresses(mut self, peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self.local = local;
        self
    }

    /// Marks the transport as TLS; origin-form requests get the `https` scheme.
    pub fn secure(mut self) -> Self {
        self.scheme = "https";
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Serves requests until the transport closes.
    pub async fn run(mut self) {
        debug!(id = %self.guard.id(), peer = ?self.peer, "connection opened");

        while self.transport.is_some() {
            if self.overflowed && self.parser.is_none() {
                self.write_error(HttpError::payload_too_large()).await;
                continue;
            }

            // bytes of the next request may have arrived with the last one
            if self.parser.is_none() && !self.buffer.is_empty() {
                let pending = self.buffer.split().freeze();
                self.data_received(&pending).await;
                continue;
            }

            let event = tokio::select! {
                biased;
                _ = self.timer.as_mut() => Event::Timeout,
                control = self.control.recv() => Event::Control(control),
                outgoing = next_outgoing(&mut self.replies) => Event::Reply(outgoing),
                read = read_some(&mut self.transport, &mut self.inbound) => Event::Read(read),
            };

            match event {
                Event::Timeout => self.on_timeout().await,
                Event::Control(Some(Control::CloseIfIdle)) => {
                    self.close_if_idle();
                }
                Event::Control(Some(Control::Close)) | Event::Control(None) => self.close(),
                Event::Reply(Some(outgoing)) => self.on_outgoing(outgoing).await,
                Event::Reply(None) => self.on_pipeline_gone().await,
                Event::Read(Ok(0)) => {
                    trace!(id = %self.guard.id(), "peer closed");
                    self.close();
                }
                Event::Read(Ok(_)) => {
                    let data = self.inbound.split().freeze();
                    self.data_received(&data).await;
                }
                Event::Read(Err(e)) => {
                    debug!(id = %self.guard.id(), error = %e, "read failed");
                    self.close();
                }
            }
        }

        self.cleanup();
        self.state = ConnectionState::Closed;
        debug!(id = %self.guard.id(), "connection closed");
    }

    /// Feeds freshly received bytes through the size check and the parser.
    pub async fn data_received(&mut self, data: &[u8]) {
        // after an overflow the rest of the stream is read and dropped
        if self.transport.is_none() || self.overflowed {
            return;
        }

        let waiting = self
            .parser
            .as_ref()
            .is_some_and(RequestParser::is_message_complete);
        if waiting {
            // held until the current response is written, up to the ceiling
            if self.buffer.len() + data.len() > self.ctx.limits.request_max_size {
                debug!(id = %self.guard.id(), "pipelined request over the size limit");
                self.overflowed = true;
                self.buffer.clear();
            } else {
                self.buffer.extend_from_slice(data);
            }
            return;
        }
        self.buffer.extend_from_slice(data);

        // Counts the whole read, so a pipelined request that arrives in the
        // same segment as the current one counts against the current one too.
        self.total_request_size += data.len();
        if self.total_request_size > self.ctx.limits.request_max_size {
            self.write_error(HttpError::payload_too_large()).await;
            return;
        }

        if self.parser.is_none() {
            self.parser = Some(RequestParser::new());
            self.headers.clear();
            self.state = ConnectionState::ParsingHeaders;
        }

        self.process_buffer().await;
    }

    /// Closes the transport if no request is in progress.
    ///
    /// Returns whether the connection was closed.
    pub fn close_if_idle(&mut self) -> bool {
        if self.parser.is_none() {
            self.close();
            return true;
        }
        false
    }

    async fn process_buffer(&mut self) {
        loop {
            let Some(parser) = self.parser.as_mut() else {
                return;
            };
            match parser.parse(&mut self.buffer) {
                Ok(Some(event)) => {
                    if let Err(e) = self.on_event(event) {
                        self.write_error(e).await;
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(id = %self.guard.id(), error = %e, "malformed request");
                    self.write_error(e.into()).await;
                    return;
                }
            }
        }
    }

    fn on_event(&mut self, event: ParseEvent) -> Result<(), HttpError> {
        match event {
            ParseEvent::RequestLine { method, target } => {
                self.method = Some(method);
                self.target = target;
            }
            ParseEvent::Header { name, value } => {
                if name.eq_ignore_ascii_case(b"content-length") {
                    let declared = std::str::from_utf8(&value)
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0);
                    if declared > self.ctx.limits.request_max_size as u64 {
                        return Err(HttpError::payload_too_large());
                    }
                }
                self.headers.push((name, value));
            }
            ParseEvent::HeadersComplete => {
                let request = self.build_request()?;
                self.dispatch(request);
                self.state = ConnectionState::ParsingBody;
            }
            ParseEvent::Body(data) => {
                if let Some(body) = &self.body {
                    body.send(BodyChunk::data(data));
                }
            }
            ParseEvent::MessageComplete => {
                if let Some(body) = self.body.take() {
                    body.send(BodyChunk::last());
                }
                if self.state == ConnectionState::ParsingBody {
                    self.state = ConnectionState::Dispatched;
                }
            }
        }
        Ok(())
    }

    fn build_request(&mut self) -> Result<RequestMessage, HttpError> {
        let http_version = self
            .parser
            .as_ref()
            .map(RequestParser::http_version)
            .ok_or_else(|| HttpError::server_error("headers completed without a parser"))?;
        let method = self.method.take().ok_or_else(HttpError::bad_request)?;
        let (scheme, path, query_string) = split_target(&self.target, self.scheme)?;

        Ok(RequestMessage {
            method,
            scheme,
            path,
            query_string,
            http_version: http_version.to_string(),
            headers: std::mem::take(&mut self.headers),
            body: Body::default(),
            client: self.peer,
            server: self.local,
        })
    }

    /// Starts the pipeline while the body is still streaming in.
    fn dispatch(&mut self, request: RequestMessage) {
        let (body_tx, body) = BodyChannel::attached(self.guard.control());
        let (reply, replies) = ReplyChannel::new();

        self.body = Some(body_tx);
        self.replies = Some(replies);
        self.request = Some(request.clone());
        self.dispatch = Some(tokio::spawn(pipeline::dispatch(
            self.ctx.pipeline.clone(),
            request,
            body,
            reply,
            self.ctx.limits.debug,
        )));
    }

    async fn on_outgoing(&mut self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Response(message) => self.send_response(message).await,
            Outgoing::Chunk(chunk) => self.send_chunk(chunk).await,
            Outgoing::Upgrade(head, handler) => self.upgrade(head, handler).await,
        }
    }

    /// The pipeline task ended without finishing its response.
    async fn on_pipeline_gone(&mut self) {
        self.replies = None;
        if self.state == ConnectionState::Responding {
            warn!(id = %self.guard.id(), "response stream ended without a terminal chunk");
            self.close();
        } else {
            self.write_error(HttpError::server_error("pipeline produced no response"))
                .await;
        }
    }

    async fn send_response(&mut self, message: ResponseMessage) {
        if self.state == ConnectionState::Responding {
            warn!(id = %self.guard.id(), "second response head ignored");
            return;
        }

        if check_headers(&message.headers).connection_close {
            self.keep_alive = false;
        }
        let keep_alive = self.keep_alive();
        let hint = self.ctx.limits.request_timeout.as_secs();
        let bytes = serialize_response(&message, keep_alive, Some(hint));
        self.status = Some(message.status);

        if let Err(e) = self.write(bytes.freeze()).await {
            debug!(id = %self.guard.id(), error = %e, "write failed");
            self.close();
            return;
        }

        if message.more_content {
            self.state = ConnectionState::Responding;
        } else {
            self.after_write(keep_alive);
        }
    }

    async fn send_chunk(&mut self, chunk: ResponseChunk) {
        if self.state != ConnectionState::Responding {
            self.write_error(HttpError::server_error(
                "response chunk sent before a response head",
            ))
            .await;
            return;
        }

        let mut out = BytesMut::new();
        if !chunk.content.is_empty() {
            out.extend_from_slice(&encode_chunk(&chunk.content));
        }
        if !chunk.more_content {
            out.extend_from_slice(LAST_CHUNK);
        }
        if out.is_empty() {
            return;
        }

        if let Err(e) = self.write(out.freeze()).await {
            debug!(id = %self.guard.id(), error = %e, "write failed");
            self.close();
            return;
        }

        if !chunk.more_content {
            let keep_alive = self.keep_alive();
            self.after_write(keep_alive);
        }
    }

    /// Writes the `101` head and hands the transport to `handler`.
    async fn upgrade(&mut self, head: ResponseMessage, handler: UpgradeHandler) {
        if !self.parser.as_ref().is_some_and(RequestParser::is_upgrade) {
            self.write_error(HttpError::server_error(
                "upgrade reply to a request that did not ask for one",
            ))
            .await;
            return;
        }

        self.status = Some(head.status);
        if let Err(e) = self.write(serialize_upgrade(&head).freeze()).await {
            debug!(id = %self.guard.id(), error = %e, "write failed");
            self.close();
            return;
        }
        self.log_access();

        let Some(transport) = self.transport.take() else {
            return;
        };
        let upgraded = Upgraded {
            io: Box::new(transport),
            buffered: self.buffer.split().freeze(),
        };
        self.cleanup();
        self.state = ConnectionState::Closed;
        tokio::spawn(handler(upgraded));
    }

    /// Keep-alive as of now: configured, not shutting down, and negotiated by
    /// the active request.
    fn keep_alive(&self) -> bool {
        self.keep_alive
            && !self.ctx.signal.is_stopped()
            && self
                .parser
                .as_ref()
                .is_some_and(RequestParser::should_keep_alive)
    }

    fn after_write(&mut self, keep_alive: bool) {
        self.log_access();

        let complete = self
            .parser
            .as_ref()
            .is_some_and(RequestParser::is_message_complete);
        if !keep_alive || !complete {
            self.close();
            return;
        }

        self.last_activity = Instant::now();
        self.cleanup();
    }

    async fn on_timeout(&mut self) {
        let timeout = self.ctx.limits.request_timeout;
        if self.last_activity.elapsed() < timeout {
            let deadline = self.last_activity + timeout;
            self.timer.as_mut().reset(deadline);
            return;
        }

        if let Some(task) = self.dispatch.take() {
            task.abort();
        }
        self.write_error(HttpError::request_timeout()).await;
    }

    /// Renders `error`, writes it and closes the transport.
    async fn write_error(&mut self, error: HttpError) {
        if self.transport.is_none() {
            return;
        }
        debug!(id = %self.guard.id(), peer = ?self.peer, error = %error, "request failed");

        if let Some(task) = self.dispatch.take() {
            task.abort();
        }
        self.body = None;
        self.replies = None;
        self.keep_alive = false;

        if self.state == ConnectionState::Responding {
            // the head is already on the wire
            self.close();
            return;
        }

        let debug = self.ctx.limits.debug;
        let response = match self
            .ctx
            .pipeline
            .error_response(self.request.as_ref(), &error)
            .await
        {
            Ok(Reply::Simple(response)) => response,
            Ok(_) => fallback_response(
                &HttpError::server_error("error handler must return a simple response"),
                debug,
            ),
            Err(e) => {
                error!(error = %e, original = %error, "error handler failed");
                fallback_response(&e, debug)
            }
        };

        let message = response.into_message();
        self.status = Some(message.status);
        let bytes = serialize_response(&message, false, None);
        match self.write(bytes.freeze()).await {
            Ok(()) => self.log_access(),
            Err(e) => error!(
                peer = ?self.peer,
                error = %e,
                "connection lost before error written"
            ),
        }
        self.close();
    }

    async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        };
        ResponseWriter::new(bytes).write_to_stream(transport).await
    }

    fn log_access(&self) {
        if !self.ctx.limits.access_log {
            return;
        }
        let Some(status) = self.status else {
            return;
        };
        let (method, path) = self
            .request
            .as_ref()
            .map_or(("-", "-"), |r| (r.method.as_str(), r.path.as_str()));
        let peer = self
            .peer
            .map_or_else(|| "-".to_string(), |addr| addr.to_string());

        info!(
            target: "switchyard::access",
            %peer,
            method,
            path,
            status = status.as_u16(),
            "{} {} {}",
            method,
            path,
            status.as_u16()
        );
    }

    /// Forgets the finished request; the connection is idle afterwards.
    fn cleanup(&mut self) {
        self.parser = None;
        self.method = None;
        self.target = Bytes::new();
        self.headers.clear();
        self.total_request_size = 0;
        self.request = None;
        self.body = None;
        self.replies = None;
        self.dispatch = None;
        self.status = None;
        self.state = ConnectionState::Idle;
    }

    fn close(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(mut transport) = self.transport.take() {
            tokio::spawn(async move {
                let _ = transport.shutdown().await;
            });
        }
    }
}

async fn next_outgoing(replies: &mut Option<mpsc::UnboundedReceiver<Outgoing>>) -> Option<Outgoing> {
    match replies {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_some<S: Io>(transport: &mut Option<S>, inbound: &mut BytesMut) -> io::Result<usize> {
    match transport {
        Some(io) => {
            inbound.reserve(READ_BUFFER);
            io.read_buf(inbound).await
        }
        None => std::future::pending().await,
    }
}
