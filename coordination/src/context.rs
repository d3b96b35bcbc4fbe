//! Request context: correlation id and cancellation passed through every call.
//!
//! Every public async operation in this crate takes a `&RequestContext`
//! instead of reading ambient state. The context carries:
//! - a request id used as the `request_id` field on the tracing span
//! - a [`CancellationToken`] honored by every suspension point
//!   (rate-limit waits, retry backoff, semaphore acquisition)
//!
//! # Usage
//!
//! ```rust,ignore
//! use analysis_coordination::context::RequestContext;
//!
//! let ctx = RequestContext::new();
//! let child = ctx.child();
//! ctx.cancel(); // child is cancelled too
//! assert!(child.is_cancelled());
//! ```

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Returned when a wait or call is aborted through the request's cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Per-request context threaded through the control plane.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a fresh root context with a new request id.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Create a root context bound to an existing token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            cancel,
        }
    }

    /// Derive a child context sharing the request id.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves
    /// the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the request has already been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Sleep for `duration` unless the request is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if duration.is_zero() {
            return self.check();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Tracing span carrying the request id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("analysis", request_id = %self.request_id)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
