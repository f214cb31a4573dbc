//! Task group: a set of tasks sharing one lifetime and one cancellation scope.
//!
//! Members are spawned onto the current runtime and handed a clone of the
//! group's [`CancellationToken`]. Cancellation is cooperative: members check
//! the token at their own suspension points.
//!
//! Lifetime rules:
//! - [`TaskGroup::join_next`] yields every member's exit; the group is done
//!   once it returns `None`.
//! - The first member to exit, for any reason, cancels the others.
//! - Dropping the group aborts whatever is still running, so no member
//!   outlives its scope.

use std::future::Future;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Output of a member that ran to completion.
#[derive(Debug)]
pub struct Exited<T> {
    /// Name given at spawn time.
    pub name: &'static str,
    /// Value returned by the member.
    pub value: T,
}

/// A bounded set of concurrently scheduled tasks.
pub struct TaskGroup<T> {
    tasks: JoinSet<(&'static str, T)>,
    token: CancellationToken,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create a group whose scope is nested inside `parent`.
    ///
    /// Cancelling `parent` cancels the group; cancelling the group leaves
    /// `parent` untouched.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            token: parent.child_token(),
        }
    }

    /// Spawn a member. `make` receives the group's token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let fut = make(self.token.clone());
        trace!(task = name, "spawning group member");
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Wait for the next member to exit.
    ///
    /// The first exit, for any reason, cancels the remaining members. A
    /// panicking member shows up as a `JoinError`. Returns `None` once the
    /// group is empty.
    pub async fn join_next(&mut self) -> Option<Result<Exited<T>, JoinError>> {
        let joined = self
            .tasks
            .join_next()
            .await?
            .map(|(name, value)| Exited { name, value });

        if !self.token.is_cancelled() {
            match &joined {
                Ok(exited) => debug!(task = exited.name, "member exited, cancelling siblings"),
                Err(e) => debug!(error = %e, "member failed, cancelling siblings"),
            }
            self.token.cancel();
        }

        Some(joined)
    }
}
