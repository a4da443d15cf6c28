//! One-directional byte relay.
//!
//! [`forward`] copies from a reader to a writer one bounded chunk at a time.
//! Nothing is buffered beyond the chunk in flight. When the reader reaches
//! EOF the writer is shut down, which on a TCP write half sends FIN and
//! leaves the opposite direction open.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

/// Maximum bytes read per iteration
pub const CHUNK_SIZE: usize = 4096;

/// Last time any forwarder sharing this clock moved bytes.
///
/// Both directions of a session share one clock, so a session streaming in
/// only one direction stays alive while the silent direction waits.
#[derive(Debug)]
pub struct IdleClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl IdleClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing has been recorded for `limit`.
    pub async fn expired(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            sleep(limit - idle).await;
        }
    }
}

impl Default for IdleClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay bytes from `reader` to `writer` until EOF.
///
/// Returns the number of bytes relayed. Read and write errors end the loop
/// and are returned as-is. Every chunk read and written touches `activity`
/// when one is given; enforcing a deadline on it is up to the caller.
pub async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: Option<&IdleClock>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let mut total: u64 = 0;

    loop {
        buf.clear();

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(clock) = activity {
            clock.touch();
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        total += n as u64;

        if let Some(clock) = activity {
            clock.touch();
        }
    }

    // Half-close. The peer may already be gone, which is not our failure.
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "Half-close after EOF failed");
    }

    Ok(total)
}
