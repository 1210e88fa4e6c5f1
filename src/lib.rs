//! Switchyard - embeddable HTTP/1.1 connection engine
//!
//! Parses requests incrementally, hands them to a pluggable pipeline over
//! body/reply channels, writes the replies back and supervises the worker
//! processes that share the listening socket.

pub mod config;
pub mod error;
pub mod http;
pub mod server;
