//! Worker supervision: sockets, accept loop, lifecycle, draining.

pub mod context;
pub mod listener;
pub mod supervisor;
pub mod tls;
#[cfg(unix)]
pub mod workers;

pub use supervisor::Server;
