//! Retry with capped exponential backoff.
//!
//! Attempt `n` failing with a retryable error is followed by a delay of
//! `min(initial * 2^(n-1), max)`, up to `max_attempts` attempts in total.
//! Permanent failures return immediately. The backoff sleep honors the
//! request's cancellation token.

use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::context::RequestContext;

use super::errors::ExecResult;
use super::policy::CallPolicy;

/// Delay after failed attempt `attempt` (1-based).
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = config
        .initial_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms);
    Duration::from_millis(delay_ms)
}

/// Retry decorator. Reads its config once per logical call.
#[derive(Debug, Default)]
pub struct RetryPolicy {
    config: RwLock<RetryConfig>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> RetryConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config(&self, config: RetryConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Delay that follows failed attempt `attempt` under the current config.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(&self.config(), attempt)
    }
}

impl CallPolicy for RetryPolicy {
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
            let config = self.config();
            let max_attempts = config.max_attempts.max(1);
            let mut attempt = 1;

            loop {
                ctx.check()?;
                let err = match op().await {
                    Ok(value) => {
                        if attempt > 1 {
                            debug!(attempt, "Call succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(err) => err,
                };

                if !err.class().is_retryable() {
                    return Err(err.with_attempts(attempt));
                }
                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %err, "Retries exhausted");
                    return Err(err.with_attempts(attempt));
                }

                let backoff = backoff_delay(&config, attempt);
                warn!(
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                ctx.sleep(backoff).await?;
                attempt += 1;
            }
        }
    }
}
