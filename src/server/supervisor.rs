//! Worker lifecycle: start hooks, accept loop, signal handling, drain.
//!
//! ```text
//! before_start → accept loop → after_start → (wait for signal)
//!   → before_stop → stop accepting → Signal::stop → close idle
//!   → poll until no connections remain → after_stop
//! ```

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::pipeline::Pipeline;
use crate::http::response::BoxFuture;
use crate::server::context::{Limits, ServerContext};
use crate::server::{listener, tls};

const DRAIN_POLL: Duration = Duration::from_millis(100);

type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A server: one pipeline, one listening socket, one or more workers.
pub struct Server {
    config: Config,
    pipeline: Arc<dyn Pipeline>,
    tls: Option<Arc<rustls::ServerConfig>>,
    listener: Option<std::net::TcpListener>,
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

impl Server {
    pub fn new(config: Config, pipeline: impl Pipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            tls: None,
            listener: None,
            before_start: Vec::new(),
            after_start: Vec::new(),
            before_stop: Vec::new(),
            after_stop: Vec::new(),
        }
    }

    /// Uses a pre-built TLS context instead of the cert/key pair in the config.
    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Serves on an already bound socket instead of binding `listen_addr`.
    pub fn with_listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_start.push(boxed(hook));
        self
    }

    pub fn after_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_start.push(boxed(hook));
        self
    }

    pub fn before_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_stop.push(boxed(hook));
        self
    }

    pub fn after_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_stop.push(boxed(hook));
        self
    }

    /// Runs until SIGINT/SIGTERM, then drains and returns.
    ///
    /// With `workers > 1` this process only supervises; each worker is a
    /// re-executed copy of it sharing the listening socket.
    pub fn run(mut self) -> Result<()> {
        if self.tls.is_none() {
            if let Some(paths) = &self.config.tls {
                self.tls = Some(tls::load_tls_config(&paths.cert, &paths.key)?);
            }
        }

        #[cfg(unix)]
        {
            if let Some(inherited) = crate::server::workers::inherited_listener()? {
                return self.serve_blocking(Some(inherited));
            }
            if self.config.workers > 1 {
                let shared = match self.listener.take() {
                    Some(listener) => listener,
                    None => crate::server::workers::shared_socket(
                        self.config.socket_addr()?,
                        self.config.backlog,
                    )?,
                };
                return crate::server::workers::serve_multiple(shared, self.config.workers);
            }
        }
        #[cfg(not(unix))]
        if self.config.workers > 1 {
            warn!("multiple workers are only supported on unix, running one");
        }

        let listener = self.listener.take();
        self.serve_blocking(listener)
    }

    /// One worker on a fresh single-threaded runtime.
    fn serve_blocking(self, bound: Option<std::net::TcpListener>) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build runtime")?;

        runtime.block_on(self.start(bound))
    }

    async fn start(self, bound: Option<std::net::TcpListener>) -> Result<()> {
        let listener = match bound {
            Some(std_listener) => {
                std_listener
                    .set_nonblocking(true)
                    .context("failed to make listener non-blocking")?;
                TcpListener::from_std(std_listener).context("failed to adopt listener")?
            }
            None => listener::bind(self.config.socket_addr()?, self.config.backlog, false)?,
        };
        self.serve(listener, shutdown_signal()).await
    }

    /// Runs one worker on the current runtime until `shutdown` resolves,
    /// then drains.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ctx = ServerContext::new(Limits::from_config(&self.config), self.pipeline.clone());
        let acceptor = self.tls.clone().map(tls::acceptor);

        for hook in &self.before_start {
            hook().await.context("before_start hook failed")?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let accept = tokio::spawn(listener::accept_loop(listener, ctx.clone(), acceptor, stop_rx));

        for hook in &self.after_start {
            if let Err(e) = hook().await {
                let _ = stop_tx.send(true);
                let _ = accept.await;
                drain(&ctx).await;
                return Err(e.context("after_start hook failed"));
            }
        }

        info!(pid = std::process::id(), "Starting worker");
        shutdown.await;
        info!(pid = std::process::id(), "Stopping worker");

        run_stop_hooks(&self.before_stop, "before_stop").await;

        let _ = stop_tx.send(true);
        if let Err(e) = accept.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        drain(&ctx).await;

        run_stop_hooks(&self.after_stop, "after_stop").await;
        Ok(())
    }
}

/// Closes idle connections and waits for in-flight ones to finish.
pub async fn drain(ctx: &ServerContext) {
    ctx.signal.stop();
    let asked = ctx.connections.close_idle();
    debug!(connections = asked, "draining");

    while !ctx.connections.is_empty() {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    debug!("drained");
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// stop hooks run newest first
async fn run_stop_hooks(hooks: &[Hook], stage: &str) {
    for hook in hooks.iter().rev() {
        if let Err(e) = hook().await {
            error!(error = %e, "{} hook failed", stage);
        }
    }
}

fn boxed<F, Fut>(hook: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(hook()))
}
