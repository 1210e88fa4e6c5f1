//! Multi-process mode.
//!
//! The parent binds one socket with address/port reuse, leaves it open
//! across `exec`, and re-executes its own binary once per worker. Each child
//! finds the descriptor in `SWITCHYARD_LISTEN_FD` and serves on it with its
//! own runtime and connection set. The parent only forwards termination
//! signals and waits.

use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::server::supervisor::shutdown_signal;

/// Descriptor of the inherited listening socket, set for worker processes.
pub const LISTEN_FD_ENV: &str = "SWITCHYARD_LISTEN_FD";
/// Zero-based index of a worker process.
pub const WORKER_ID_ENV: &str = "SWITCHYARD_WORKER_ID";

/// Binds the socket shared by all workers. It is left inheritable.
pub fn shared_socket(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("failed to create socket")?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .with_context(|| format!("failed to listen on {addr}"))?;

    info!("Listening on {}", addr);
    inheritable(socket.into())
}

/// Clears close-on-exec so re-executed workers can adopt the socket.
///
/// Sockets from `std::net` are created with the flag set.
pub fn inheritable(listener: std::net::TcpListener) -> Result<std::net::TcpListener> {
    let socket = Socket::from(listener);
    socket
        .set_cloexec(false)
        .context("failed to make socket inheritable")?;
    Ok(socket.into())
}

/// The socket handed down by a supervising parent, if this is a worker.
pub fn inherited_listener() -> Result<Option<std::net::TcpListener>> {
    inherited_listener_from(|key| std::env::var(key).ok())
}

/// Like [`inherited_listener`], reading variables through `lookup`.
pub fn inherited_listener_from<F>(lookup: F) -> Result<Option<std::net::TcpListener>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(LISTEN_FD_ENV) else {
        return Ok(None);
    };
    let fd: RawFd = raw
        .parse()
        .with_context(|| format!("{LISTEN_FD_ENV} is not a descriptor: {raw:?}"))?;
    if fd < 0 {
        return Err(anyhow!("{LISTEN_FD_ENV} is negative: {fd}"));
    }

    // SAFETY: the parent opened this descriptor for us and kept it open across exec;
    // nothing else in this process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    Ok(Some(listener))
}

/// Starts `workers` children on `listener` and blocks until all have exited.
pub fn serve_multiple(listener: std::net::TcpListener, workers: usize) -> Result<()> {
    let listener = inheritable(listener)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(supervise(&listener, workers))?;

    // children are gone, the socket can go too
    drop(listener);
    Ok(())
}

async fn supervise(listener: &std::net::TcpListener, workers: usize) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let fd = listener.as_raw_fd();

    let mut pids = Vec::with_capacity(workers);
    let mut waits = Vec::with_capacity(workers);
    for id in 0..workers {
        let mut child = Command::new(&exe)
            .args(&args)
            .env(LISTEN_FD_ENV, fd.to_string())
            .env(WORKER_ID_ENV, id.to_string())
            .spawn()
            .with_context(|| format!("failed to start worker {id}"))?;

        let pid = child.id();
        info!(worker = id, pid = ?pid, "Started worker");
        pids.extend(pid);
        waits.push(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(worker = id, "worker exited"),
                Ok(status) => warn!(worker = id, %status, "worker exited abnormally"),
                Err(e) => error!(worker = id, error = %e, "failed to wait for worker"),
            }
        }));
    }

    let all_exited = async {
        for wait in waits {
            let _ = wait.await;
        }
    };
    tokio::pin!(all_exited);

    tokio::select! {
        _ = &mut all_exited => {}
        _ = shutdown_signal() => {
            info!("Stopping {} workers", pids.len());
            for pid in &pids {
                forward_interrupt(*pid);
            }
            all_exited.await;
        }
    }
    Ok(())
}

fn forward_interrupt(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGINT) } != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, error = %err, "failed to signal worker");
    }
}
