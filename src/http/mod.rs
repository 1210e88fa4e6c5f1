//! HTTP/1.1 connection engine.
//!
//! This module turns raw byte streams into requests for a [`Pipeline`] and
//! writes the pipeline's replies back, one request at a time per connection.
//!
//! # Architecture
//!
//! - **`connection`**: per-transport state machine and request timer
//! - **`parser`**: incremental request parser producing callback-style events
//! - **`request`**: the request message handed to the pipeline
//! - **`response`**: status codes, response messages and the `Reply` variants
//! - **`channel`**: body and reply channels between connection and pipeline
//! - **`writer`**: status line, header and chunk serialization
//! - **`pipeline`**: the application boundary and its dispatch task
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchyard::http::connection::Connection;
//! use switchyard::http::pipeline::pipeline_fn;
//! use switchyard::http::response::Response;
//! use switchyard::server::context::{Limits, ServerContext};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = pipeline_fn(|_request| async { Ok(Response::ok("hi").into()) });
//!     let ctx = ServerContext::new(Limits::default(), Arc::new(pipeline));
//!     let listener = TcpListener::bind("127.0.0.1:8000").await?;
//!
//!     loop {
//!         let (socket, _addr) = listener.accept().await?;
//!         tokio::spawn(Connection::new(socket, ctx.clone()).run());
//!     }
//! }
//! ```
//!
//! [`Pipeline`]: pipeline::Pipeline

pub mod channel;
pub mod connection;
pub mod parser;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod writer;
