//! Receiver half of a session.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Why the receiver stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The peer closed its write side (zero-length read).
    EndOfStream,
    /// The scope was cancelled while waiting for data.
    Cancelled,
}

/// Counters kept by the receiver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Non-empty reads.
    pub chunks: u64,
    /// Total bytes read.
    pub bytes: u64,
}

/// Consume the stream chunk by chunk until end-of-stream or cancellation.
///
/// Each chunk is logged and forwarded to every sink in arrival order. Sinks
/// are bounded: a full sink stops further reads until it has room, so a slow
/// consumer pushes back on the peer. Sinks whose receiving end went away are
/// dropped silently. End-of-stream is returned as a value; deciding what it
/// means is left to the caller.
pub async fn run_receiver<R>(
    reader: &mut R,
    mut sinks: Vec<mpsc::Sender<Bytes>>,
    buffer_size: usize,
    token: CancellationToken,
) -> io::Result<(ReceiveEnd, ReceiveStats)>
where
    R: AsyncRead + Unpin,
{
    debug!("receiver started");
    let mut stats = ReceiveStats::default();
    let mut buffer = BytesMut::with_capacity(buffer_size);

    loop {
        buffer.reserve(buffer_size);

        // read_buf is cancel safe: losing the race reads nothing
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(chunks = stats.chunks, bytes = stats.bytes, "receiver cancelled");
                return Ok((ReceiveEnd::Cancelled, stats));
            }
            n = reader.read_buf(&mut buffer) => n?,
        };

        if n == 0 {
            info!(chunks = stats.chunks, bytes = stats.bytes, "connection closed by peer");
            return Ok((ReceiveEnd::EndOfStream, stats));
        }

        let chunk = buffer.split().freeze();
        stats.chunks += 1;
        stats.bytes += n as u64;
        info!(bytes = n, data = ?chunk, "received data");

        let mut i = 0;
        while i < sinks.len() {
            let delivered = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(chunks = stats.chunks, bytes = stats.bytes, "receiver cancelled");
                    return Ok((ReceiveEnd::Cancelled, stats));
                }
                sent = sinks[i].send(chunk.clone()) => sent.is_ok(),
            };

            if delivered {
                i += 1;
            } else {
                trace!("chunk sink closed");
                sinks.remove(i);
            }
        }
    }
}
