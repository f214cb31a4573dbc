//! Session error taxonomy.

use std::io;
use std::time::Duration;

/// Why a session did not complete normally.
#[derive(Debug)]
pub enum ConnectionError {
    /// The peer did not accept the connection (refused, unreachable, bad address).
    Unreachable { addr: String, source: io::Error },
    /// The connect attempt did not complete within the configured bound.
    Timeout { addr: String, after: Duration },
    /// An I/O error (or task panic) during an active session.
    PeerFault(io::Error),
    /// The supervising scope was cancelled from outside.
    Cancelled,
}

impl ConnectionError {
    /// `Cancelled` is an expected termination reason, not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ConnectionError::Cancelled)
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Unreachable { addr, source } => {
                write!(f, "Peer '{}' is unreachable: {}", addr, source)
            }
            ConnectionError::Timeout { addr, after } => {
                write!(f, "Connecting to '{}' timed out after {:?}", addr, after)
            }
            ConnectionError::PeerFault(e) => write!(f, "Session I/O fault: {}", e),
            ConnectionError::Cancelled => write!(f, "Session cancelled"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Unreachable { source, .. } => Some(source),
            ConnectionError::PeerFault(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::PeerFault(e)
    }
}
