use std::time::Duration;

use errors::{Error, ErrorKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation-bearing capability handed down through every invocation.
/// Cancelling a parent cancels all derived children; cancelling a child
/// leaves the parent untouched. A deadline only ever shrinks along the
/// derivation chain.
#[derive(Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Root context, typically owned by the supervisor and cancelled on
    /// shutdown.
    pub fn background() -> Context {
        Context {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A cancellable child. Useful when a per-message scope must be
    /// revocable without touching the parent.
    pub fn child(&self) -> Context {
        Context {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is `now + timeout`, clamped to the parent's
    /// deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Context {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Never resolves for a background context that is not cancelled.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error describing why the context is done. Meaningful after
    /// `done()` resolves or `is_done()` returns true.
    pub fn error(&self) -> Error {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Error::message(ErrorKind::DeadlineExceeded, "context deadline exceeded")
            }
            _ => Error::message(ErrorKind::Cancelled, "context cancelled"),
        }
    }
}
