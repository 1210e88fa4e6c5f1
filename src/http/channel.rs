//! Channels between a connection and the pipeline serving its current request.
//!
//! The body side is an unbounded FIFO: the connection pushes chunks from
//! parser callbacks and must never wait on a slow consumer. The reply side
//! carries response messages back to the connection's serializer.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use crate::error::HttpError;
use crate::http::connection::Control;
use crate::http::response::{Outgoing, ResponseChunk};

/// A slice of request body as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub content: Bytes,
    /// `false` only on the terminal chunk of a request.
    pub more_content: bool,
    pub closed: bool,
}

impl BodyChunk {
    pub fn data(content: Bytes) -> Self {
        Self {
            content,
            more_content: true,
            closed: false,
        }
    }

    pub fn last() -> Self {
        Self {
            content: Bytes::new(),
            more_content: false,
            closed: false,
        }
    }
}

/// Producing half of a body channel. Sending never blocks.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<BodyChunk>,
}

impl BodySender {
    /// Enqueues a chunk. A consumer that already went away is not an error.
    pub fn send(&self, chunk: BodyChunk) {
        let _ = self.tx.send(chunk);
    }
}

/// Consuming half of a body channel.
///
/// Clones share the same queue, so a chunk is received by exactly one of them.
#[derive(Debug, Clone)]
pub struct BodyChannel {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<BodyChunk>>>,
    connection: Option<mpsc::WeakUnboundedSender<Control>>,
}

impl BodyChannel {
    /// A channel not tied to any connection; `close()` is a no-op.
    pub fn detached() -> (BodySender, BodyChannel) {
        Self::with_connection(None)
    }

    pub(crate) fn attached(control: &mpsc::UnboundedSender<Control>) -> (BodySender, BodyChannel) {
        Self::with_connection(Some(control.downgrade()))
    }

    fn with_connection(
        connection: Option<mpsc::WeakUnboundedSender<Control>>,
    ) -> (BodySender, BodyChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BodySender { tx },
            BodyChannel {
                rx: Arc::new(Mutex::new(rx)),
                connection,
            },
        )
    }

    /// Waits for the next chunk, in arrival order.
    ///
    /// `None` means the connection went away before the terminal chunk.
    pub async fn receive(&self) -> Option<BodyChunk> {
        self.rx.lock().await.recv().await
    }

    /// Collects every remaining chunk into one buffer.
    pub async fn read_to_end(&self) -> Result<Bytes, HttpError> {
        let mut body = BytesMut::new();
        loop {
            let chunk = self.receive().await.ok_or_else(|| {
                HttpError::server_error("connection closed before the request body was complete")
            })?;
            body.extend_from_slice(&chunk.content);
            if !chunk.more_content {
                return Ok(body.freeze());
            }
        }
    }

    /// Closes the owning connection's transport, for consumers abandoning a stream.
    pub fn close(&self) {
        if let Some(tx) = self.connection.as_ref().and_then(|weak| weak.upgrade()) {
            let _ = tx.send(Control::Close);
        }
    }
}

/// Per-request conduit from the pipeline back to the connection.
///
/// `send` returns as soon as the connection has the message queued for
/// writing. After the terminal message the channel refuses further sends.
#[derive(Debug)]
pub struct ReplyChannel {
    tx: mpsc::UnboundedSender<Outgoing>,
    finished: bool,
}

impl ReplyChannel {
    pub fn new() -> (ReplyChannel, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyChannel { tx, finished: false }, rx)
    }

    pub async fn send(&mut self, message: impl Into<Outgoing>) -> Result<(), HttpError> {
        if self.finished {
            return Err(HttpError::server_error("response already completed"));
        }
        let message = message.into();
        let terminal = match &message {
            Outgoing::Response(response) => !response.more_content,
            Outgoing::Chunk(chunk) => !chunk.more_content,
            Outgoing::Upgrade(..) => true,
        };
        self.tx
            .send(message)
            .map_err(|_| HttpError::server_error("connection closed"))?;
        self.finished = terminal;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// A writer for the body of a streamed response.
    pub fn stream(&self) -> ResponseStream {
        ResponseStream {
            tx: self.tx.clone(),
        }
    }
}

/// Writes streamed response data; each write becomes one chunk on the wire.
#[derive(Debug, Clone)]
pub struct ResponseStream {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ResponseStream {
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), HttpError> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Outgoing::Chunk(ResponseChunk::data(data)))
            .map_err(|_| HttpError::server_error("connection closed"))
    }
}
