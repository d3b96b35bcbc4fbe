//! Resilient call executor: circuit breaker wrapped around retry.
//!
//! ```text
//! execute(op)
//!   ├─ breaker Open          → ExecError::CircuitOpen (op never runs)
//!   └─ breaker Closed/trial  → retry loop
//!        ├─ success                        → Ok(T)
//!        ├─ permanent failure              → OperationFailed (1 attempt)
//!        └─ retryable failure × max        → OperationFailed (breaker counts it)
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::context::RequestContext;

use super::circuit_breaker::CircuitBreaker;
use super::errors::{default_classifier, Classifier, ExecError, ExecResult, ExternalError};
use super::policy::{CallPolicy, Chain};
use super::retry::RetryPolicy;

/// Executes one external call under breaker + retry policies.
pub struct ResilientCallExecutor {
    policies: Chain<Arc<CircuitBreaker>, RetryPolicy>,
    classifier: Classifier,
}

impl std::fmt::Debug for ResilientCallExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCallExecutor")
            .field("breaker", self.breaker())
            .field("retry", self.retry_policy())
            .finish_non_exhaustive()
    }
}

impl ResilientCallExecutor {
    /// Build an executor with its own breaker named `name`.
    pub fn new(name: &str, retry: RetryConfig, breaker: CircuitBreakerConfig) -> Self {
        Self::with_breaker(Arc::new(CircuitBreaker::new(name, breaker)), retry)
    }

    /// Build an executor around an existing, possibly shared, breaker.
    pub fn with_breaker(breaker: Arc<CircuitBreaker>, retry: RetryConfig) -> Self {
        Self {
            policies: Chain::new(breaker, RetryPolicy::new(retry)),
            classifier: default_classifier(),
        }
    }

    /// Replace the retryability predicate.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.policies.outer()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.policies.inner()
    }

    /// Run `op` under the breaker and retry policies.
    ///
    /// `op` is invoked once per attempt; each failure is classified with the
    /// installed [`Classifier`]. An attempt still running when the request is
    /// cancelled is dropped and the call returns [`ExecError::Cancelled`].
    pub async fn execute<T, F, Fut>(&self, ctx: &RequestContext, op: F) -> ExecResult<T>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ExternalError>> + Send,
    {
        let classifier = &self.classifier;
        let op = &op;
        let classified = move || {
            let attempt = op();
            async move {
                let result = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(ExecError::Cancelled),
                    result = attempt => result,
                };
                result.map_err(|err| {
                    let class = classifier(&err);
                    ExecError::failed(err, class)
                })
            }
        };
        self.policies.execute(ctx, &classified).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::resilience::errors::ErrorClass;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn executor(max_attempts: u32, threshold: u32) -> ResilientCallExecutor {
        ResilientCallExecutor::new(
            "llm-analysis",
            RetryConfig {
                max_attempts,
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
            },
            CircuitBreakerConfig {
                failure_threshold: threshold,
                break_duration_secs: 30,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_passes_through() {
        let exec = executor(3, 5);
        let ctx = RequestContext::new();
        let value = exec
            .execute(&ctx, || async { Ok::<_, ExternalError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_then_succeeds() {
        let exec = executor(3, 5);
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let value = exec
            .execute(&ctx, move || async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExternalError::http(502, "bad gateway"))
                } else {
                    Ok("analysis")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "analysis");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(exec.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_immediately() {
        let exec = executor(5, 5);
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let err = exec
            .execute(&ctx, move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExternalError::http(401, "unauthorized"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            ExecError::OperationFailed {
                class: ErrorClass::Permanent,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(exec.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_counts_logical_calls_not_attempts() {
        let exec = executor(3, 2);
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let failing = move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ExternalError::Network("connection reset".into()))
        };

        exec.execute(&ctx, failing).await.unwrap_err();
        assert_eq!(exec.breaker().failure_count(), 1);
        assert_eq!(exec.breaker().state(), CircuitState::Closed);
        exec.execute(&ctx, failing).await.unwrap_err();
        assert_eq!(exec.breaker().state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let err = exec.execute(&ctx, failing).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier_disables_retry() {
        let exec = executor(5, 5).with_classifier(Arc::new(|_: &ExternalError| ErrorClass::Permanent));
        let ctx = RequestContext::new();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let start = Instant::now();
        exec.execute(&ctx, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ExternalError::http(503, "down"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let exec = executor(3, 5);
        let ctx = RequestContext::new();
        ctx.cancel();
        let err = exec
            .execute(&ctx, || async { Ok::<_, ExternalError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Cancelled);
        assert_eq!(exec.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_in_flight_call() {
        let exec = executor(3, 1);
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = exec
            .execute(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(100)).await;
                Ok::<_, ExternalError>(7)
            })
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Cancelled);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(exec.breaker().state(), CircuitState::Closed);
        assert_eq!(exec.breaker().failure_count(), 0);
    }
}
