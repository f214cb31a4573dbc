//! duplex-echo: a structured-concurrency TCP echo service
//!
//! Each connection is owned by a supervisor that runs exactly two tasks over
//! it in one cancellation scope:
//! - a sender writing a payload on a timer (or echoing what it reads)
//! - a receiver reading until the peer closes the stream
//!
//! Features:
//! - Client role: connect, run one session, exit when the peer closes
//! - Server role: accept connections and run one session per stream
//! - Ctrl-C cancels every scope and closes every stream before exit
//! - Configuration via CLI arguments or TOML file

use duplex_echo::{run_client_session, Config, Role, Server, SessionSettings};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        role = ?config.role,
        host = %config.host,
        port = config.port,
        listen = %config.listen,
        interval_ms = config.interval.as_millis() as u64,
        "Starting duplex-echo"
    );

    // Sender and receiver are multiplexed on one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(shutdown.clone()));

    match config.role {
        Role::Client => Ok(run_client(config, shutdown).await),
        Role::Server => {
            Server::new(config).run(shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run one client session. The peer closing the stream is a clean exit.
async fn run_client(config: Config, shutdown: CancellationToken) -> ExitCode {
    let settings = SessionSettings::client(&config);

    match run_client_session(&config.host, config.port, &settings, &shutdown).await {
        Ok(report) => {
            info!(peer = %report.peer, "Peer closed the connection");
            ExitCode::SUCCESS
        }
        Err(e) if !e.is_failure() => {
            info!("Session cancelled");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            ExitCode::FAILURE
        }
    }
}

async fn cancel_on_interrupt(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => warn!(error = %e, "Unable to listen for interrupt signal"),
    }
}
