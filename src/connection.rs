//! Session lifecycle and the supervisor-owned stream.
//!
//! The stream is lent to the sender/receiver pair as split halves and handed
//! back when they exit. Only the owner closes it, and closing twice is a no-op.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

/// Lifecycle of one supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing opened yet.
    Idle,
    /// Client connect in flight.
    Connecting,
    /// Sender and receiver both running.
    Active,
    /// One task finished; the sibling is being cancelled.
    Draining,
    /// Stream closed. Terminal.
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Server sessions go straight from `Idle` to `Active` since the stream
    /// is already accepted. A failed connect goes from `Connecting` to `Closed`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Active)
                | (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Draining)
                | (Draining, Closed)
        )
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks the state of one session and logs every transition.
#[derive(Debug)]
pub struct Lifecycle {
    state: SessionState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, refusing anything the state machine does not allow.
    pub fn advance(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        trace!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

enum Slot<S> {
    Open(S),
    /// Halves are out with the session tasks.
    Lent,
    Closed,
}

/// A full-duplex byte stream owned by exactly one supervisor.
pub struct SessionStream<S> {
    slot: Slot<S>,
    peer: String,
}

impl<S> SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an open stream connected to `peer`.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            slot: Slot::Open(stream),
            peer: peer.into(),
        }
    }

    /// Peer description, used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Lend the stream out as read/write halves.
    ///
    /// Returns `None` if the stream is already lent or closed.
    pub fn lend(&mut self) -> Option<(ReadHalf<S>, WriteHalf<S>)> {
        match std::mem::replace(&mut self.slot, Slot::Lent) {
            Slot::Open(stream) => Some(tokio::io::split(stream)),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Take back both halves after the tasks holding them have exited.
    pub fn restore(&mut self, reader: ReadHalf<S>, writer: WriteHalf<S>) {
        if matches!(self.slot, Slot::Lent) {
            self.slot = Slot::Open(reader.unsplit(writer));
        }
    }

    /// Close the stream.
    ///
    /// Returns `true` if this call closed it and `false` if it was already
    /// closed. Shutdown errors are logged, never returned: a peer that already
    /// went away leaves nothing to close.
    pub async fn close(&mut self) -> bool {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Open(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    if e.kind() != io::ErrorKind::NotConnected {
                        debug!(peer = %self.peer, error = %e, "shutdown failed during close");
                    }
                }
                debug!(peer = %self.peer, "stream closed");
                true
            }
            Slot::Lent => {
                // A half was lost with a panicked task; dropping closes the rest.
                debug!(peer = %self.peer, "stream closed with halves outstanding");
                true
            }
            Slot::Closed => {
                trace!(peer = %self.peer, "stream already closed");
                false
            }
        }
    }
}
