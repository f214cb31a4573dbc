//! Connection supervisor.
//!
//! Owns one stream for its whole life. Lends the halves to a sender and a
//! receiver running in one task group, waits for both to stop, then closes the
//! stream exactly once. The first task to stop cancels the other.

use crate::config::{Config, ServerMode};
use crate::connection::{Lifecycle, SessionState, SessionStream};
use crate::error::ConnectionError;
use crate::peer::{run_receiver, run_sender, Outgoing, ReceiveEnd, ReceiveStats, SendStats};
use crate::task_group::{Exited, TaskGroup};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunks the receiver may queue ahead of the sender in echo mode.
const ECHO_QUEUE_DEPTH: usize = 32;

/// What the sender writes.
#[derive(Debug, Clone)]
pub enum OutgoingMode {
    /// A fixed payload once per interval.
    Fixed { payload: Bytes, interval: Duration },
    /// Whatever the receiver reads, written back.
    Echo,
}

/// Knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub outgoing: OutgoingMode,
    pub read_buffer_size: usize,
    pub connect_timeout: Duration,
    pub nodelay: bool,
    /// How long a write may stall once the session is cancelled.
    pub cancel_grace: Duration,
    /// Receives a copy of every chunk read, in arrival order. A full tap
    /// holds back further reads.
    pub tap: Option<mpsc::Sender<Bytes>>,
}

impl SessionSettings {
    /// Settings for the client role.
    pub fn client(config: &Config) -> Self {
        Self {
            outgoing: OutgoingMode::Fixed {
                payload: Bytes::from(config.payload.clone()),
                interval: config.interval,
            },
            read_buffer_size: config.read_buffer_size,
            connect_timeout: config.connect_timeout,
            nodelay: config.nodelay,
            cancel_grace: config.cancel_grace,
            tap: None,
        }
    }

    /// Settings for sessions accepted by the server.
    pub fn server(config: &Config) -> Self {
        let outgoing = match config.server_mode {
            ServerMode::Echo => OutgoingMode::Echo,
            ServerMode::Fixed => OutgoingMode::Fixed {
                payload: Bytes::from(config.payload.clone()),
                interval: config.interval,
            },
        };
        Self {
            outgoing,
            ..Self::client(config)
        }
    }
}

/// Summary of a session that ended because the peer closed the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: String,
    pub sent: SendStats,
    pub received: ReceiveStats,
}

/// Connect to `host:port` and run a session over the new stream.
pub async fn run_client_session(
    host: &str,
    port: u16,
    settings: &SessionSettings,
    shutdown: &CancellationToken,
) -> Result<SessionReport, ConnectionError> {
    let addr = display_addr(host, port);
    let mut life = Lifecycle::new();
    transition(&mut life, SessionState::Connecting);

    let connected = if port == 0 {
        Err(ConnectionError::Unreachable {
            addr: addr.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "port 0 is not connectable"),
        })
    } else {
        info!(addr = %addr, "connecting");
        let attempt = TcpStream::connect((host, port));
        bounded_connect(&addr, settings.connect_timeout, shutdown, attempt).await
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            transition(&mut life, SessionState::Closed);
            return Err(e);
        }
    };

    let peer = tune(&stream, settings).unwrap_or(addr);
    supervise(life, SessionStream::new(stream, peer), settings, shutdown).await
}

/// Run a session over a stream accepted elsewhere.
pub async fn run_server_session(
    stream: TcpStream,
    settings: &SessionSettings,
    shutdown: &CancellationToken,
) -> Result<SessionReport, ConnectionError> {
    let peer = tune(&stream, settings).unwrap_or_else(|| "unknown".to_string());
    run_session(stream, peer, settings, shutdown).await
}

/// Run a session over any already-open duplex stream.
pub async fn run_session<S>(
    stream: S,
    peer: impl Into<String>,
    settings: &SessionSettings,
    shutdown: &CancellationToken,
) -> Result<SessionReport, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    supervise(Lifecycle::new(), SessionStream::new(stream, peer), settings, shutdown).await
}

/// `host:port`, with IPv6 literals bracketed.
fn display_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Apply socket options and return the peer address.
fn tune(stream: &TcpStream, settings: &SessionSettings) -> Option<String> {
    if let Err(e) = stream.set_nodelay(settings.nodelay) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    stream.peer_addr().ok().map(|addr| addr.to_string())
}

/// Await `attempt`, bounded by `bound` and by the shutdown scope.
async fn bounded_connect<T, F>(
    addr: &str,
    bound: Duration,
    shutdown: &CancellationToken,
    attempt: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ConnectionError::Cancelled),
        res = tokio::time::timeout(bound, attempt) => match res {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectionError::Unreachable {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(ConnectionError::Timeout {
                addr: addr.to_string(),
                after: bound,
            }),
        },
    }
}

fn transition(life: &mut Lifecycle, next: SessionState) {
    if let Err(e) = life.advance(next) {
        warn!(error = %e, "ignoring session transition");
    }
}

enum TaskExit<S> {
    Sender {
        half: WriteHalf<S>,
        result: io::Result<SendStats>,
    },
    Receiver {
        half: ReadHalf<S>,
        result: io::Result<(ReceiveEnd, ReceiveStats)>,
    },
}

/// Write errors that just mean the peer is gone.
fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

async fn supervise<S>(
    mut life: Lifecycle,
    mut stream: SessionStream<S>,
    settings: &SessionSettings,
    shutdown: &CancellationToken,
) -> Result<SessionReport, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = stream.peer().to_string();
    let (mut reader, mut writer) = stream.lend().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "stream already lent or closed")
    })?;

    let mut sinks = Vec::with_capacity(2);
    sinks.extend(settings.tap.clone());
    let outgoing = match &settings.outgoing {
        OutgoingMode::Fixed { payload, interval } => Outgoing::Fixed {
            payload: payload.clone(),
            interval: *interval,
        },
        OutgoingMode::Echo => {
            let (tx, rx) = mpsc::channel(ECHO_QUEUE_DEPTH);
            sinks.push(tx);
            Outgoing::Echo(rx)
        }
    };

    transition(&mut life, SessionState::Active);
    info!(peer = %peer, "session active");

    let mut group = TaskGroup::new(shutdown);
    let grace = settings.cancel_grace;
    group.spawn("sender", move |token| async move {
        let result = run_sender(&mut writer, outgoing, grace, token).await;
        TaskExit::Sender { half: writer, result }
    });
    let buffer_size = settings.read_buffer_size;
    group.spawn("receiver", move |token| async move {
        let result = run_receiver(&mut reader, sinks, buffer_size, token).await;
        TaskExit::Receiver { half: reader, result }
    });

    let mut reader = None;
    let mut writer = None;
    let mut sent = SendStats::default();
    let mut received = ReceiveStats::default();
    let mut peer_closed = false;
    let mut faults: Vec<(&'static str, io::Error)> = Vec::new();

    while let Some(joined) = group.join_next().await {
        if life.state() == SessionState::Active {
            transition(&mut life, SessionState::Draining);
        }

        match joined {
            Ok(Exited { name, value }) => match value {
                TaskExit::Sender { half, result } => {
                    writer = Some(half);
                    match result {
                        Ok(stats) => sent = stats,
                        Err(e) => faults.push((name, e)),
                    }
                }
                TaskExit::Receiver { half, result } => {
                    reader = Some(half);
                    match result {
                        Ok((end, stats)) => {
                            received = stats;
                            peer_closed = end == ReceiveEnd::EndOfStream;
                        }
                        Err(e) => faults.push((name, e)),
                    }
                }
            },
            Err(e) => faults.push(("task", io::Error::other(format!("session task failed: {}", e)))),
        }
    }

    // Both tasks have stopped; the stream is ours again
    match (reader, writer) {
        (Some(reader), Some(writer)) => stream.restore(reader, writer),
        (reader, writer) => drop((reader, writer)),
    }
    stream.close().await;
    transition(&mut life, SessionState::Closed);

    if peer_closed {
        faults.retain(|(name, e)| {
            let benign = *name == "sender" && is_peer_gone(e);
            if benign {
                debug!(peer = %peer, error = %e, "write raced with peer close");
            }
            !benign
        });
    }

    if let Some((name, e)) = faults.into_iter().next() {
        warn!(peer = %peer, task = name, error = %e, "session fault");
        return Err(ConnectionError::PeerFault(e));
    }

    if peer_closed {
        info!(
            peer = %peer,
            writes = sent.writes,
            bytes_sent = sent.bytes,
            bytes_received = received.bytes,
            "session finished"
        );
        return Ok(SessionReport {
            peer,
            sent,
            received,
        });
    }

    info!(peer = %peer, "session cancelled");
    Err(ConnectionError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    const TICK: Duration = Duration::from_secs(1);

    fn ping_settings() -> SessionSettings {
        SessionSettings {
            outgoing: OutgoingMode::Fixed {
                payload: Bytes::from_static(b"PING"),
                interval: TICK,
            },
            read_buffer_size: 1024,
            connect_timeout: Duration::from_secs(1),
            nodelay: true,
            cancel_grace: TICK,
            tap: None,
        }
    }

    /// Duplex stream that can fail reads and counts shutdown calls.
    struct FaultyStream {
        inner: DuplexStream,
        fail_reads: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    impl AsyncRead for FaultyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FaultyStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_unreachable_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = run_client_session("127.0.0.1", port, &ping_settings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_port_zero_is_unreachable() {
        let err = run_client_session("127.0.0.1", 0, &ping_settings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Unreachable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let attempt = std::future::pending::<io::Result<()>>();
        let err = bounded_connect("10.0.0.1:12345", TICK, &CancellationToken::new(), attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { after, .. } if after == TICK));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let attempt = std::future::pending::<io::Result<()>>();
        let err = bounded_connect("10.0.0.1:12345", TICK, &shutdown, attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_ends_session_within_one_tick() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let settings = ping_settings();
        let session = tokio::spawn(async move {
            run_session(local, "duplex", &settings, &CancellationToken::new()).await
        });

        let mut received = [0u8; 8];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"PINGPING");

        let closed_at = Instant::now();
        drop(remote);

        let report = session.await.unwrap().unwrap();
        assert!(closed_at.elapsed() <= TICK);
        assert!(report.sent.writes >= 2);
        assert_eq!(report.received, ReceiveStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_closed_after_session() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let settings = ping_settings();
        let session = tokio::spawn(async move {
            run_session(local, "duplex", &settings, &CancellationToken::new()).await
        });

        // Half-close: the session sees end-of-stream, we keep reading
        remote.write_all(b"bye").await.unwrap();
        remote.shutdown().await.unwrap();

        let report = session.await.unwrap().unwrap();
        assert_eq!(report.received.bytes, 3);

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len() % 4, 0);
        assert!(remote.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_receiver_fault_closes_once_and_reports() {
        let (inner, mut remote) = tokio::io::duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let stream = FaultyStream {
            inner,
            fail_reads: true,
            shutdowns: Arc::clone(&shutdowns),
        };

        let err = run_session(stream, "faulty", &ping_settings(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::PeerFault(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        // Stream is already closed when the error surfaces; no torn payloads
        let mut seen = Vec::new();
        remote.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen.len() % 4, 0);
        assert!(seen.chunks(4).all(|c| c == b"PING"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let shutdown = CancellationToken::new();
        let scope = shutdown.clone();
        let settings = ping_settings();
        let session =
            tokio::spawn(async move { run_session(local, "duplex", &settings, &scope).await });

        let mut received = [0u8; 4];
        remote.read_exact(&mut received).await.unwrap();
        shutdown.cancel();

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        assert!(!err.is_failure());

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len() % 4, 0);
    }

    #[tokio::test]
    async fn test_echo_mode_writes_back_and_taps() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (tap, mut tapped) = mpsc::channel(8);
        let settings = SessionSettings {
            outgoing: OutgoingMode::Echo,
            tap: Some(tap),
            ..ping_settings()
        };
        let session = tokio::spawn(async move {
            run_session(local, "duplex", &settings, &CancellationToken::new()).await
        });

        remote.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        remote.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        remote.shutdown().await.unwrap();
        let report = session.await.unwrap().unwrap();
        assert_eq!(report.received.bytes, 5);
        assert_eq!(report.sent.bytes, 5);

        let mut seen = Vec::new();
        while let Some(chunk) = tapped.recv().await {
            seen.extend_from_slice(&chunk);
        }
        assert_eq!(seen, b"hello");
    }

    #[tokio::test]
    async fn test_client_against_loopback_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 4];
            socket.read_exact(&mut first).await.unwrap();
            socket.write_all(b"PONG").await.unwrap();
            first
        });

        let settings = SessionSettings {
            outgoing: OutgoingMode::Fixed {
                payload: Bytes::from_static(b"PING"),
                // Long enough that the peer never holds unread bytes when it closes
                interval: Duration::from_secs(30),
            },
            ..ping_settings()
        };
        let report = run_client_session("127.0.0.1", port, &settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(&peer.await.unwrap(), b"PING");
        assert_eq!(report.received.bytes, 4);
        assert!(report.sent.writes >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_write_delivers_whole_payloads() {
        let mut framed = vec![b'.'; 64];
        framed[0] = b'[';
        framed[63] = b']';
        let payload = Bytes::from(framed);

        // The pipe holds a quarter of the payload, so the first write blocks
        let (local, mut remote) = tokio::io::duplex(16);
        let shutdown = CancellationToken::new();
        let scope = shutdown.clone();
        let settings = SessionSettings {
            outgoing: OutgoingMode::Fixed {
                payload: payload.clone(),
                interval: TICK,
            },
            ..ping_settings()
        };
        let session =
            tokio::spawn(async move { run_session(local, "duplex", &settings, &scope).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();

        let mut seen = Vec::new();
        remote.read_to_end(&mut seen).await.unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen.len() % payload.len(), 0);
        assert!(seen.chunks(payload.len()).all(|c| c == payload));

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_when_echo_peer_never_reads() {
        let (local, remote) = tokio::io::duplex(64);
        let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);
        let shutdown = CancellationToken::new();
        let scope = shutdown.clone();
        let settings = SessionSettings {
            outgoing: OutgoingMode::Echo,
            ..ping_settings()
        };
        let session =
            tokio::spawn(async move { run_session(local, "duplex", &settings, &scope).await });

        // Floods the session and never reads what comes back
        let flood = tokio::spawn(async move {
            let chunk = vec![b'z'; 1024 * 1024];
            remote_writer.write_all(&chunk).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled_at = Instant::now();
        shutdown.cancel();

        let err = tokio::time::timeout(3 * TICK, session)
            .await
            .expect("session did not stop after cancellation")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        assert!(cancelled_at.elapsed() <= TICK + Duration::from_millis(1));

        // The session's end of the pipe is gone, so the flood fails
        assert!(flood.await.unwrap().is_err());
        let mut echoed = Vec::new();
        remote_reader.read_to_end(&mut echoed).await.unwrap();
        assert!(echoed.iter().all(|b| *b == b'z'));
    }

    #[test]
    fn test_display_addr_brackets_ipv6() {
        assert_eq!(display_addr("127.0.0.1", 12345), "127.0.0.1:12345");
        assert_eq!(display_addr("localhost", 80), "localhost:80");
        assert_eq!(display_addr("::1", 12345), "[::1]:12345");
    }

    #[tokio::test]
    async fn test_client_connects_to_ipv6_literal() {
        // Hosts without IPv6 loopback have nothing to check
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 4];
            socket.read_exact(&mut first).await.unwrap();
            first
        });

        let settings = SessionSettings {
            outgoing: OutgoingMode::Fixed {
                payload: Bytes::from_static(b"PING"),
                interval: Duration::from_secs(30),
            },
            ..ping_settings()
        };
        let report = run_client_session("::1", port, &settings, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(&peer.await.unwrap(), b"PING");
        assert!(report.peer.starts_with("[::1]"));
    }
}
