//! TCP server for the server role.
//!
//! Accepts connections and runs one supervised session per stream. Every
//! session scope is nested under the server's shutdown token, so cancelling
//! the server stops all sessions before `run` returns.

use crate::config::Config;
use crate::error::ConnectionError;
use crate::supervisor::{run_server_session, SessionSettings};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    settings: SessionSettings,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let settings = SessionSettings::server(&config);
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            settings,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> io::Result<()> {
        let addr: SocketAddr = self
            .config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %listener.local_addr()?, mode = ?self.config.server_mode, "Server listening");

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` is cancelled
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(done) = sessions.join_next() => {
                    if let Err(e) = done {
                        error!(error = %e, "Session task failed");
                    }
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let settings = self.settings.clone();
                    let scope = shutdown.clone();

                    sessions.spawn(async move {
                        match run_server_session(stream, &settings, &scope).await {
                            Ok(report) => debug!(
                                peer = %addr,
                                bytes_received = report.received.bytes,
                                bytes_sent = report.sent.bytes,
                                "Connection closed by client"
                            ),
                            Err(ConnectionError::Cancelled) => {
                                debug!(peer = %addr, "Session cancelled")
                            }
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!(sessions = sessions.len(), "Server shutting down");
        while let Some(done) = sessions.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Session task failed");
            }
        }

        Ok(())
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
