//! State shared by every connection of one worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::http::connection::Control;
use crate::http::pipeline::Pipeline;

/// Per-connection policy taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub request_timeout: Duration,
    pub request_max_size: usize,
    pub keep_alive: bool,
    pub access_log: bool,
    /// Include failure details in fallback error bodies.
    pub debug: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            request_max_size: 100_000_000,
            keep_alive: true,
            access_log: true,
            debug: false,
        }
    }
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout),
            request_max_size: config.request_max_size,
            keep_alive: config.keep_alive,
            access_log: config.access_log,
            debug: config.debug,
        }
    }
}

/// The worker's "server is stopping" flag. Set once, never cleared.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    stopped: Arc<AtomicBool>,
}

impl Signal {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Unique identifier for a connection within a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connections of a worker, addressable for draining.
#[derive(Debug, Clone, Default)]
pub struct Connections {
    inner: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Control>>>>,
    next_id: Arc<AtomicU64>,
}

impl Connections {
    /// Adds a connection. It stays listed until the returned guard drops.
    pub fn register(&self) -> (ConnectionGuard, mpsc::UnboundedReceiver<Control>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx.clone());
        let guard = ConnectionGuard {
            id,
            control: tx,
            connections: self.clone(),
        };
        (guard, rx)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Asks every connection to close if it sits between requests.
    ///
    /// Returns how many connections were asked.
    pub fn close_idle(&self) -> usize {
        let connections = self.lock();
        for control in connections.values() {
            let _ = control.send(Control::CloseIfIdle);
        }
        connections.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Control>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a connection registered; removes it on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    control: mpsc::UnboundedSender<Control>,
    connections: Connections,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn control(&self) -> &mpsc::UnboundedSender<Control> {
        &self.control
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.lock().remove(&self.id);
    }
}

/// Everything a connection needs from its worker, passed by value.
#[derive(Clone)]
pub struct ServerContext {
    pub limits: Limits,
    pub signal: Signal,
    pub connections: Connections,
    pub pipeline: Arc<dyn Pipeline>,
}

impl ServerContext {
    pub fn new(limits: Limits, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            limits,
            signal: Signal::default(),
            connections: Connections::default(),
            pipeline,
        }
    }
}
