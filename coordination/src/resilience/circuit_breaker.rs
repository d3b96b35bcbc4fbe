//! Circuit breaker for a protected external operation.
//!
//! The breaker tracks consecutive qualifying failures (retryable failures
//! that survived the retry policy). When failures reach a configurable
//! threshold the circuit *opens* and calls fail fast without reaching the
//! operation. After the break duration the circuit enters *half-open*
//! state and admits exactly one trial call: success closes it, failure
//! reopens it and restarts the timer.
//!
//! One breaker instance is shared by every caller of the operation it
//! protects. State sits behind a single mutex that is never held across an
//! await.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::context::RequestContext;

use super::errors::{ExecError, ExecResult};
use super::policy::CallPolicy;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests blocked until the break duration expires.
    Open,
    /// Break duration expired, one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// How a permitted call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Permanent failure or cancellation: says nothing about service health.
    Neutral,
}

/// Process-wide circuit breaker for one protected operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: RwLock<CircuitBreakerConfig>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(config),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap thresholds. The current state and counter are kept.
    pub fn set_config(&self, config: CircuitBreakerConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Current state, promoting Open to HalfOpen once the break has elapsed.
    pub fn state(&self) -> CircuitState {
        let config = self.config();
        let mut state = self.lock();
        self.refresh(&mut state, &config);
        state.state
    }

    /// Consecutive qualifying failures recorded so far.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Force the breaker closed and clear the counter.
    pub fn reset(&self) {
        let mut state = self.lock();
        if state.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit manually reset");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, state: &mut BreakerState, config: &CircuitBreakerConfig) {
        if state.state != CircuitState::Open {
            return;
        }
        let elapsed = state
            .opened_at
            .map(|opened| opened.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= config.break_duration() {
            state.state = CircuitState::HalfOpen;
            state.trial_in_flight = false;
            info!(breaker = %self.name, "Circuit half-open, admitting trial call");
        }
    }

    fn try_acquire(&self) -> ExecResult<BreakerPermit<'_>> {
        let config = self.config();
        let mut state = self.lock();
        self.refresh(&mut state, &config);

        match state.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                Ok(BreakerPermit::new(self, true))
            }
            // A trial is already running; its outcome decides the next state.
            CircuitState::HalfOpen => Err(ExecError::CircuitOpen {
                breaker: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or_default();
                Err(ExecError::CircuitOpen {
                    breaker: self.name.clone(),
                    retry_after: config.break_duration().saturating_sub(elapsed),
                })
            }
        }
    }

    fn settle(&self, trial: bool, outcome: Outcome) {
        let config = self.config();
        let mut state = self.lock();

        match (outcome, trial) {
            (Outcome::Success, true) => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                state.trial_in_flight = false;
                info!(breaker = %self.name, "Circuit closed after successful trial");
            }
            (Outcome::Success, false) => {
                // Late successes from calls admitted before the circuit
                // opened do not close it; only the trial does.
                if state.state == CircuitState::Closed {
                    state.consecutive_failures = 0;
                }
            }
            (Outcome::Failure, true) => {
                state.state = CircuitState::Open;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                warn!(
                    breaker = %self.name,
                    break_secs = config.break_duration_secs,
                    "Trial call failed, circuit reopened"
                );
            }
            (Outcome::Failure, false) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.state == CircuitState::Closed
                    && state.consecutive_failures >= config.failure_threshold
                {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        break_secs = config.break_duration_secs,
                        "Circuit opened"
                    );
                }
            }
            (Outcome::Neutral, true) => {
                state.trial_in_flight = false;
            }
            (Outcome::Neutral, false) => {}
        }
    }
}

/// Admission ticket for one call. Dropping it unsettled (e.g. the caller's
/// future was cancelled) releases a held trial slot without a verdict.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.settle(self.trial, outcome);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.trial, Outcome::Neutral);
        }
    }
}

impl CallPolicy for CircuitBreaker {
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
            let permit = self.try_acquire()?;
            let result = op().await;
            let outcome = match &result {
                Ok(_) => Outcome::Success,
                Err(err) if err.trips_breaker() => Outcome::Failure,
                Err(_) => Outcome::Neutral,
            };
            permit.settle(outcome);
            result
        }
    }
}
