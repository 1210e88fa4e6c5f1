//! The boundary between the connection core and application code.
//!
//! Routing, middleware and handlers live behind [`Pipeline`]. The core only
//! needs three things from it: whether a request wants its body streamed,
//! a reply for a request, and a reply for a failure.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::HttpError;
use crate::http::channel::{BodyChannel, ReplyChannel};
use crate::http::request::{Body, RequestMessage};
use crate::http::response::{Reply, Response, ResponseChunk, StatusCode};

#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Streaming intent of whatever will handle `request`.
    ///
    /// Called before [`handle`](Pipeline::handle), with the body not yet
    /// filled in. `true` hands the handler a [`BodyChannel`] instead of the
    /// collected body.
    fn is_stream(&self, _request: &RequestMessage) -> bool {
        false
    }

    async fn handle(&self, request: &RequestMessage) -> Result<Reply, HttpError>;

    /// Renders a failure. `request` is absent when the failure happened
    /// before a request could be assembled.
    async fn error_response(
        &self,
        _request: Option<&RequestMessage>,
        error: &HttpError,
    ) -> Result<Reply, HttpError> {
        Ok(Response::from_error(error).into())
    }
}

/// Last-resort body used when rendering an error failed too.
pub fn fallback_response(error: &HttpError, debug: bool) -> Response {
    let body = if debug {
        format!("Error while handling error: {error}")
    } else {
        "An error occurred while handling an error".to_string()
    };
    Response::text(StatusCode::INTERNAL_SERVER_ERROR, body)
}

/// Runs one request through the pipeline and pushes the result into `reply`.
pub(crate) async fn dispatch(
    pipeline: Arc<dyn Pipeline>,
    mut request: RequestMessage,
    body: BodyChannel,
    mut reply: ReplyChannel,
    debug: bool,
) {
    let outcome = if pipeline.is_stream(&request) {
        request.body = Body::Stream(body);
        pipeline.handle(&request).await
    } else {
        match body.read_to_end().await {
            Ok(bytes) => {
                request.body = Body::Full(bytes);
                pipeline.handle(&request).await
            }
            Err(e) => Err(e),
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            debug!(error = %e, path = %request.path, "pipeline failed, rendering error");
            recover(pipeline.as_ref(), &request, &e, debug).await
        }
    };

    if let Err(e) = drive(result, &mut reply).await {
        debug!(error = %e, path = %request.path, "reply not delivered");
    }
}

async fn recover(
    pipeline: &dyn Pipeline,
    request: &RequestMessage,
    failure: &HttpError,
    debug: bool,
) -> Reply {
    match pipeline.error_response(Some(request), failure).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = %e, original = %failure, "error handler failed");
            fallback_response(&e, debug).into()
        }
    }
}

async fn drive(result: Reply, reply: &mut ReplyChannel) -> Result<(), HttpError> {
    match result {
        Reply::Simple(response) => reply.send(response.into_message()).await,
        Reply::Streaming(streaming) => {
            reply.send(streaming.head_message()).await?;
            let producer = streaming.into_producer();
            if let Err(e) = producer(reply.stream()).await {
                // the head is already out, so all that is left is to end the body
                warn!(error = %e, "streaming response aborted");
            }
            reply.send(ResponseChunk::last()).await
        }
        Reply::Upgrade(upgrade) => reply.send(upgrade.into_outgoing()).await,
    }
}

/// A pipeline built from an async closure.
///
/// ```ignore
/// let pipeline = pipeline_fn(|request: RequestMessage| async move {
///     Ok(Response::ok(format!("you asked for {}", request.path)).into())
/// });
/// ```
pub struct FnPipeline<F> {
    f: F,
    stream: bool,
}

pub fn pipeline_fn<F, Fut>(f: F) -> FnPipeline<F>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, HttpError>> + Send + 'static,
{
    FnPipeline { f, stream: false }
}

impl<F> FnPipeline<F> {
    /// Deliver every request body through a [`BodyChannel`].
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

#[async_trait]
impl<F, Fut> Pipeline for FnPipeline<F>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, HttpError>> + Send + 'static,
{
    fn is_stream(&self, _request: &RequestMessage) -> bool {
        self.stream
    }

    async fn handle(&self, request: &RequestMessage) -> Result<Reply, HttpError> {
        (self.f)(request.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::channel::BodyChunk;
    use crate::http::request::{Method, RequestBuilder};
    use crate::http::response::{Outgoing, StreamingResponse};
    use bytes::Bytes;

    struct Failing;

    #[async_trait]
    impl Pipeline for Failing {
        async fn handle(&self, _request: &RequestMessage) -> Result<Reply, HttpError> {
            Err(HttpError::server_error("handler exploded"))
        }

        async fn error_response(
            &self,
            _request: Option<&RequestMessage>,
            error: &HttpError,
        ) -> Result<Reply, HttpError> {
            Err(HttpError::server_error(format!("renderer exploded on {error}")))
        }
    }

    fn request() -> RequestMessage {
        RequestBuilder::new().method(Method::POST).path("/").build().unwrap()
    }

    async fn run(pipeline: Arc<dyn Pipeline>, debug: bool) -> Vec<Outgoing> {
        let (tx, body) = BodyChannel::detached();
        tx.send(BodyChunk::data(Bytes::from_static(b"hi")));
        tx.send(BodyChunk::last());
        let (reply, mut rx) = ReplyChannel::new();

        dispatch(pipeline, request(), body, reply, debug).await;

        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn collected_body_reaches_handler() {
        let pipeline = pipeline_fn(|request: RequestMessage| async move {
            let body = request.body_bytes().cloned().unwrap_or_default();
            Ok(Response::ok(body).into())
        });
        let out = run(Arc::new(pipeline), false).await;

        match &out[..] {
            [Outgoing::Response(message)] => assert_eq!(&message.content[..], b"hi"),
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_error_handler_falls_back() {
        let production = run(Arc::new(Failing), false).await;
        let debug = run(Arc::new(Failing), true).await;

        match (&production[..], &debug[..]) {
            ([Outgoing::Response(prod)], [Outgoing::Response(dbg)]) => {
                assert_eq!(prod.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(&prod.content[..], b"An error occurred while handling an error");
                let detail = String::from_utf8_lossy(&dbg.content).into_owned();
                assert!(detail.starts_with("Error while handling error: renderer exploded"));
            }
            other => panic!("unexpected replies: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_reply_ends_with_empty_chunk() {
        let pipeline = pipeline_fn(|_request: RequestMessage| async move {
            Ok(StreamingResponse::new(StatusCode::OK, |mut stream| async move {
                stream.write("a").await?;
                stream.write("b").await
            })
            .into())
        });
        let out = run(Arc::new(pipeline), false).await;

        assert_eq!(out.len(), 4);
        assert!(matches!(&out[0], Outgoing::Response(head) if head.more_content));
        assert!(matches!(&out[3], Outgoing::Chunk(chunk) if !chunk.more_content && chunk.content.is_empty()));
    }
}
