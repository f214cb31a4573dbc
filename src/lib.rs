//! Structured-concurrency TCP echo sessions.
//!
//! A supervisor owns one stream and runs a sender and a receiver over it in a
//! single [`TaskGroup`]. Whichever stops first cancels the other, and the
//! stream is closed once both have stopped.

pub mod config;
pub mod connection;
pub mod error;
pub mod peer;
pub mod server;
pub mod supervisor;
pub mod task_group;

pub use config::{Config, ConfigError, Role, ServerMode};
pub use connection::{SessionState, SessionStream};
pub use error::ConnectionError;
pub use server::Server;
pub use supervisor::{
    run_client_session, run_server_session, run_session, OutgoingMode, SessionReport,
    SessionSettings,
};
pub use task_group::TaskGroup;
