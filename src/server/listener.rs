use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use crate::http::connection::Connection;
use crate::server::context::ServerContext;

/// Pause after a failed accept (usually fd exhaustion) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds a listening socket. `reuse_port` lets several workers bind the same
/// address.
pub fn bind(addr: SocketAddr, backlog: u32, reuse_port: bool) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("failed to create socket")?;

    socket
        .set_reuseaddr(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    if reuse_port {
        socket
            .set_reuseport(true)
            .context("failed to set SO_REUSEPORT")?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(backlog)
        .with_context(|| format!("failed to listen on {addr}"))
}

/// Accepts connections until `stop` flips, spawning one task per connection.
pub async fn accept_loop(
    listener: TcpListener,
    ctx: ServerContext,
    tls: Option<TlsAcceptor>,
    mut stop: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    loop {
        let (socket, peer) = tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        trace!("Accepted connection from {}", peer);

        let ctx = ctx.clone();
        match &tls {
            None => {
                tokio::spawn(serve_plain(socket, peer, ctx));
            }
            Some(acceptor) => {
                tokio::spawn(serve_tls(socket, peer, ctx, acceptor.clone()));
            }
        }
    }

    debug!("accept loop stopped");
}

async fn serve_plain(socket: TcpStream, peer: SocketAddr, ctx: ServerContext) {
    let _ = socket.set_nodelay(true);
    let local = socket.local_addr().ok();
    Connection::new(socket, ctx)
        .with_addresses(Some(peer), local)
        .run()
        .await;
}

async fn serve_tls(socket: TcpStream, peer: SocketAddr, ctx: ServerContext, acceptor: TlsAcceptor) {
    let _ = socket.set_nodelay(true);
    let local = socket.local_addr().ok();

    let handshake = tokio::time::timeout(ctx.limits.request_timeout, acceptor.accept(socket)).await;
    match handshake {
        Ok(Ok(stream)) => {
            Connection::new(stream, ctx)
                .with_addresses(Some(peer), local)
                .secure()
                .run()
                .await;
        }
        Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
        Err(_) => debug!(%peer, "TLS handshake timed out"),
    }
}
