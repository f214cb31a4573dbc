//! Sender half of a session.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Where the sender gets its bytes from.
#[derive(Debug)]
pub enum Outgoing {
    /// Write `payload` once per `interval`, forever.
    Fixed { payload: Bytes, interval: Duration },
    /// Write back every chunk the receiver surfaced, in arrival order.
    Echo(mpsc::Receiver<Bytes>),
}

/// Counters kept by the sender.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendStats {
    /// Buffers fully handed to the transport.
    pub writes: u64,
    /// Bytes of those buffers.
    pub bytes: u64,
    /// Whether the last buffer was given up after the peer stalled.
    pub abandoned: bool,
}

/// Run the sender until cancelled (or, in echo mode, until the receiver is done).
///
/// A buffer that is already being written when the scope is cancelled is
/// finished, so a peer that keeps reading never sees a partial payload. Each
/// write call made after cancellation gets `grace` to make progress; a peer
/// that stops reading for longer loses the rest of that buffer and the
/// sender returns.
///
/// In echo mode, cancellation closes the queue: chunks already queued are
/// still written back, nothing new is accepted.
pub async fn run_sender<W>(
    writer: &mut W,
    outgoing: Outgoing,
    grace: Duration,
    token: CancellationToken,
) -> io::Result<SendStats>
where
    W: AsyncWrite + Unpin,
{
    debug!("sender started");
    let mut stats = SendStats::default();

    match outgoing {
        Outgoing::Fixed { payload, interval } => {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                debug!(data = ?payload, "sending payload");
                if !write_chunk(writer, &payload, grace, &token, &mut stats).await? {
                    break;
                }
            }
        }
        Outgoing::Echo(mut chunks) => {
            let mut closed = false;
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = token.cancelled(), if !closed => {
                        chunks.close();
                        closed = true;
                        continue;
                    }
                    chunk = chunks.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };

                trace!(bytes = chunk.len(), "echoing chunk");
                if !write_chunk(writer, &chunk, grace, &token, &mut stats).await? {
                    break;
                }
            }
        }
    }

    debug!(writes = stats.writes, bytes = stats.bytes, "sender stopped");
    Ok(stats)
}

/// Drive `op` to completion, or until it has made no progress for `grace`
/// after the scope was cancelled. `None` means it was given up.
async fn within_grace<T, F>(
    op: F,
    grace: Duration,
    token: &CancellationToken,
) -> Option<io::Result<T>>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::pin!(op);

    tokio::select! {
        biased;
        res = &mut op => return Some(res),
        _ = token.cancelled() => {}
    }

    tokio::time::timeout(grace, op).await.ok()
}

/// Write one whole buffer. Returns `false` if the peer stalled past the grace period.
async fn write_chunk<W>(
    writer: &mut W,
    chunk: &[u8],
    grace: Duration,
    token: &CancellationToken,
    stats: &mut SendStats,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;

    while written < chunk.len() {
        match within_grace(writer.write(&chunk[written..]), grace, token).await {
            Some(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Some(Ok(n)) => written += n,
            Some(Err(e)) => return Err(e),
            None => {
                warn!(written, len = chunk.len(), "peer stalled after cancellation, abandoning write");
                stats.abandoned = true;
                return Ok(false);
            }
        }
    }

    match within_grace(writer.flush(), grace, token).await {
        Some(res) => res?,
        None => {
            stats.abandoned = true;
            return Ok(false);
        }
    }

    stats.writes += 1;
    stats.bytes += chunk.len() as u64;
    Ok(true)
}
