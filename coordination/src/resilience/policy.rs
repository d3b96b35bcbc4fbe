//! Composable call policies.
//!
//! Every policy exposes the same `execute` signature, so decorators can be
//! unit-tested on their own and stacked in any order with [`Chain`]:
//!
//! ```text
//! Chain<CircuitBreaker, RetryPolicy>
//!   └─ breaker checks state once per logical call
//!        └─ retry loop with backoff
//!             └─ operation
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::context::RequestContext;

use super::errors::ExecResult;

/// A decorator around a fallible async operation.
///
/// `op` is `Fn` rather than `FnMut` so an outer policy can hand it to an
/// inner one by shared reference and invoke it once per attempt.
pub trait CallPolicy: Send + Sync {
    fn execute<'a, T, F, Fut>(
        &'a self,
        ctx: &'a RequestContext,
        op: &'a F,
    ) -> impl Future<Output = ExecResult<T>> + Send + 'a
    where
        T: Send + 'a,
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = ExecResult<T>> + Send + 'a;
}

impl<P: CallPolicy> CallPolicy for Arc<P> {
    fn execute<'a, T, F, Fut>(
        &'a self,
        ctx: &'a RequestContext,
        op: &'a F,
    ) -> impl Future<Output = ExecResult<T>> + Send + 'a
    where
        T: Send + 'a,
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = ExecResult<T>> + Send + 'a,
    {
        (**self).execute(ctx, op)
    }
}

/// `outer` wraps `inner`: each time `outer` runs the operation, the whole
/// `inner` policy runs.
#[derive(Debug)]
pub struct Chain<O, I> {
    outer: O,
    inner: I,
}

impl<O, I> Chain<O, I> {
    pub fn new(outer: O, inner: I) -> Self {
        Self { outer, inner }
    }

    pub fn outer(&self) -> &O {
        &self.outer
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<O: CallPolicy, I: CallPolicy> CallPolicy for Chain<O, I> {
    fn execute<'a, T, F, Fut>(
        &'a self,
        ctx: &'a RequestContext,
        op: &'a F,
    ) -> impl Future<Output = ExecResult<T>> + Send + 'a
    where
        T: Send + 'a,
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = ExecResult<T>> + Send + 'a,
    {
        async move {
            let inner = &self.inner;
            let through_inner = move || inner.execute(ctx, op);
            self.outer.execute(ctx, &through_inner).await
        }
    }
}

/// Policy that runs the operation exactly once. Useful as a chain terminator
/// and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl CallPolicy for Passthrough {
    fn execute<'a, T, F, Fut>(
        &'a self,
        ctx: &'a RequestContext,
        op: &'a F,
    ) -> impl Future<Output = ExecResult<T>> + Send + 'a
    where
        T: Send + 'a,
        F: Fn() -> Fut + Send + Sync + 'a,
        Fut: Future<Output = ExecResult<T>> + Send + 'a,
    {
        async move {
            ctx.check()?;
            op().await
        }
    }
}
