use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Instrument};

use crate::proxy::session::{ProxyContext, ProxySession};

/// Pause after a transient accept error before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Too many open files in the system (ENFILE). Same value on Linux, macOS
/// and the BSDs.
#[cfg(unix)]
const ENFILE: i32 = 23;

/// Too many open files in this process (EMFILE)
#[cfg(unix)]
const EMFILE: i32 = 24;

/// Accept loop that spawns one session per client connection.
pub struct Listener {
    listener: TcpListener,
    ctx: ProxyContext,
    next_id: AtomicU64,
}

impl Listener {
    pub async fn bind(addr: &str, ctx: ProxyContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        info!(
            addr = %listener.local_addr()?,
            backends = ctx.registry.len(),
            "Listening"
        );

        Ok(Self {
            listener,
            ctx,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Accept until an unrecoverable accept error.
    pub async fn run(&self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept until `shutdown` completes or an unrecoverable accept error.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(&self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = &mut shutdown => {
                    info!("Listener shutting down");
                    return Ok(());
                }
            };

            match accepted {
                Ok((socket, peer)) => self.spawn_session(socket, peer),
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Transient accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, stopping listener");
                    return Err(e);
                }
            }
        }
    }

    fn spawn_session(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(id, peer = %peer, "Accepted connection");

        let session = ProxySession::new(id, peer, socket, self.ctx.clone());

        tokio::spawn(
            async move {
                session.run().await;
            }
            .instrument(tracing::info_span!("session", id, peer = %peer)),
        );
    }
}

/// Errors that concern one pending connection or a momentary resource
/// shortage, not the listening socket itself.
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
    ) {
        return true;
    }

    is_fd_exhaustion(e)
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}
