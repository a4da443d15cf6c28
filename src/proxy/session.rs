//! Per-connection proxy session.
//!
//! A session owns one accepted client stream for its whole life:
//!
//! ```text
//!   Init ──▶ Connecting ──dial ok──▶ Forwarding ──▶ Closing ──▶ Closed
//!                 │                                    ▲
//!                 └────────────dial failed─────────────┘
//! ```
//!
//! Teardown always runs in the same order: outstanding forwarders are
//! cancelled, both streams are shut down, and the backend slot is released.
//! The slot is a [`BackendSlot`], so even a session task that is aborted
//! mid-flight gives its counter back.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{Direction, SessionError};
use crate::proxy::backend::{BackendAddress, BackendRegistry};
use crate::proxy::forward::{forward, IdleClock};
use crate::proxy::selector::{BackendSlot, ConnectionSelector};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Forwarding,
    Closing,
    Closed,
}

/// Timeouts applied to every session. Both default to none.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

/// State shared by all sessions of a listener
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub registry: BackendRegistry,
    pub selector: Arc<ConnectionSelector>,
    pub options: SessionOptions,
}

impl ProxyContext {
    pub fn new(registry: BackendRegistry, options: SessionOptions) -> Self {
        let selector = Arc::new(ConnectionSelector::new(registry.len()));

        Self {
            registry,
            selector,
            options,
        }
    }
}

/// What happened to a finished session
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub backend: usize,
    pub state: SessionState,
    /// Bytes relayed client to backend, when forwarding completed cleanly
    pub bytes_up: u64,
    /// Bytes relayed backend to client, when forwarding completed cleanly
    pub bytes_down: u64,
    pub error: Option<SessionError>,
}

pub struct ProxySession {
    id: u64,
    peer: SocketAddr,
    client: Option<TcpStream>,
    ctx: ProxyContext,
    state: SessionState,
}

impl ProxySession {
    pub fn new(id: u64, peer: SocketAddr, client: TcpStream, ctx: ProxyContext) -> Self {
        Self {
            id,
            peer,
            client: Some(client),
            ctx,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion. Never fails; errors end up in the
    /// report.
    pub async fn run(mut self) -> SessionReport {
        self.transition(SessionState::Connecting);

        let slot = self.ctx.selector.acquire_slot();
        let index = slot.index();

        let mut report = SessionReport {
            id: self.id,
            backend: index,
            state: self.state,
            bytes_up: 0,
            bytes_down: 0,
            error: None,
        };

        let outcome = match self.ctx.registry.get(index).cloned() {
            Some(addr) => self.connect_and_relay(&addr, &slot).await,
            None => Err(SessionError::BackendUnavailable {
                backend: format!("#{index}"),
                source: io::Error::new(io::ErrorKind::NotFound, "no such backend"),
            }),
        };

        match outcome {
            Ok((up, down)) => {
                report.bytes_up = up;
                report.bytes_down = down;
            }
            Err(e) => report.error = Some(e),
        }

        // Streams are closed; the slot goes back last.
        self.transition(SessionState::Closing);
        if let Some(mut client) = self.client.take() {
            close_stream(&mut client, "client").await;
        }
        slot.release();
        self.transition(SessionState::Closed);

        report.state = self.state;

        match &report.error {
            None => info!(
                backend = index,
                bytes_up = report.bytes_up,
                bytes_down = report.bytes_down,
                "Session closed"
            ),
            Some(e) => info!(backend = index, error = %e, "Session closed with error"),
        }

        report
    }

    async fn connect_and_relay(
        &mut self,
        addr: &BackendAddress,
        slot: &BackendSlot,
    ) -> Result<(u64, u64), SessionError> {
        info!(
            backend = slot.index(),
            addr = %addr,
            peer = %self.peer,
            counts = ?self.ctx.selector.snapshot(),
            "Selected backend"
        );

        let mut backend = match self.dial(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = slot.index(), error = %e, "Backend dial failed");
                return Err(e);
            }
        };

        self.transition(SessionState::Forwarding);
        let result = self.relay(&mut backend).await;

        if let Err(e) = &result {
            debug!(error = %e, "Forwarding stopped");
        }

        close_stream(&mut backend, "backend").await;
        result
    }

    async fn dial(&self, addr: &BackendAddress) -> Result<TcpStream, SessionError> {
        let connect = TcpStream::connect(addr.as_connect_target());

        let result = match self.ctx.options.connect_timeout {
            Some(limit) => timeout(limit, connect).await.unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))
            }),
            None => connect.await,
        };

        result.map_err(|source| SessionError::BackendUnavailable {
            backend: addr.to_string(),
            source,
        })
    }

    /// Run both directions concurrently. The first error cancels the other
    /// direction; a clean EOF on one side waits for the other to finish.
    /// With an idle timeout, the session ends once neither direction has
    /// moved a byte for that long.
    async fn relay(&mut self, backend: &mut TcpStream) -> Result<(u64, u64), SessionError> {
        let idle = self.ctx.options.idle_timeout;
        let Some(client) = self.client.as_mut() else {
            return Err(SessionError::forwarding(
                Direction::Upstream,
                io::Error::new(io::ErrorKind::NotConnected, "client stream already closed"),
            ));
        };

        let clock = IdleClock::new();
        let (mut client_rd, mut client_wr) = client.split();
        let (mut backend_rd, mut backend_wr) = backend.split();

        let upstream = async {
            forward(&mut client_rd, &mut backend_wr, Some(&clock))
                .await
                .map_err(|e| SessionError::forwarding(Direction::Upstream, e))
        };

        let downstream = async {
            forward(&mut backend_rd, &mut client_wr, Some(&clock))
                .await
                .map_err(|e| SessionError::forwarding(Direction::Downstream, e))
        };

        let both = async { tokio::try_join!(upstream, downstream) };

        match idle {
            Some(limit) => tokio::select! {
                result = both => result,
                () = clock.expired(limit) => Err(SessionError::IdleTimeout { idle: limit }),
            },
            None => both.await,
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!(id = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

/// Shut a stream down, swallowing errors. Safe on an already closed stream.
async fn close_stream(stream: &mut TcpStream, which: &'static str) {
    if let Err(e) = stream.shutdown().await {
        debug!(stream = which, error = %e, "Ignoring error while closing stream");
    }
}
