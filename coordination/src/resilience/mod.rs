//! Resilience: retry and circuit breaking around external calls.
//!
//! - [`errors`]: structured external errors and retry classification
//! - [`policy`]: the [`CallPolicy`] decorator trait and [`Chain`]
//! - [`retry`]: capped exponential backoff
//! - [`circuit_breaker`]: process-wide breaker with a single half-open trial
//! - [`executor`]: breaker-around-retry composition used for analyzer calls
//!
//! # Usage
//!
//! ```rust,ignore
//! use analysis_coordination::resilience::ResilientCallExecutor;
//!
//! let exec = ResilientCallExecutor::new("llm-analysis", retry_cfg, breaker_cfg);
//! let result = exec.execute(&ctx, || analyzer.analyze(&request, &ctx)).await;
//! match result {
//!     Ok(analysis) => { /* ... */ }
//!     Err(e) if e.is_circuit_open() => { /* service degraded */ }
//!     Err(e) => { /* failed after retries, or permanent */ }
//! }
//! ```

pub mod circuit_breaker;
pub mod errors;
pub mod executor;
pub mod policy;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use errors::{
    default_classifier, Classifier, ErrorClass, ExecError, ExecResult, ExternalError,
};
pub use executor::ResilientCallExecutor;
pub use policy::{CallPolicy, Chain, Passthrough};
pub use retry::{backoff_delay, RetryPolicy};
