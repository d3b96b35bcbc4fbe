//! Sliding-window rate limiter keyed by agent.
//!
//! Each key owns a queue of admitted-call timestamps. Every read or write
//! first drops timestamps that fell out of the trailing window, so the
//! queue length is the number of calls in the last `window`.
//!
//! Keys are locked independently: the outer map is only write-locked when a
//! key is first seen or swept, and per-key queues sit behind their own mutex.
//!
//! Throttling is expressed as a wait, never as an error. The only failure a
//! caller can observe is [`Cancelled`] when the request is aborted mid-wait.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateLimitConfig;
use crate::context::{Cancelled, RequestContext};

type CallQueue = Arc<Mutex<VecDeque<Instant>>>;

/// Snapshot of a key's admission state, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub count_in_window: u32,
    pub limit: u32,
    pub throttled: bool,
    /// Time until the oldest call leaves the window (zero when not throttled).
    pub wait: Duration,
}

/// Per-key sliding-window admission control.
#[derive(Debug)]
pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    queues: RwLock<HashMap<String, CallQueue>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a new window/limit. Existing timestamps are kept.
    pub fn set_config(&self, config: RateLimitConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Record one admitted call for `key`.
    pub fn record_call(&self, key: &str) {
        let config = self.config();
        let queue = self.queue_for(key);
        let mut calls = queue.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        trim(&mut calls, now, config.window());
        calls.push_back(now);
    }

    /// Current admission state for `key`.
    pub fn status(&self, key: &str) -> RateLimitStatus {
        let config = self.config();
        let Some(queue) = self.existing_queue(key) else {
            return RateLimitStatus {
                key: key.to_string(),
                count_in_window: 0,
                limit: config.max_calls,
                throttled: false,
                wait: Duration::ZERO,
            };
        };
        let mut calls = queue.lock().unwrap_or_else(PoisonError::into_inner);
        compute_status(key, &mut calls, Instant::now(), &config)
    }

    /// Suspend until the window frees up for `key`.
    ///
    /// Sleeps once for the computed wait and returns without re-checking;
    /// callers that need a guaranteed slot should use [`RateLimiter::acquire`].
    /// Never records a call.
    pub async fn wait_if_needed(&self, key: &str, ctx: &RequestContext) -> Result<(), Cancelled> {
        let status = self.status(key);
        if !status.throttled {
            return ctx.check();
        }
        info!(
            key,
            count = status.count_in_window,
            limit = status.limit,
            wait_ms = status.wait.as_millis() as u64,
            "Rate limit reached, waiting"
        );
        ctx.sleep(status.wait).await
    }

    /// Wait until `key` is below its limit, then record the call.
    ///
    /// The check and the append happen under the key's lock, so concurrent
    /// callers for the same key can never overshoot the limit.
    pub async fn acquire(&self, key: &str, ctx: &RequestContext) -> Result<(), Cancelled> {
        loop {
            ctx.check()?;
            let config = self.config();
            let queue = self.queue_for(key);
            let wait = {
                let mut calls = queue.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                let status = compute_status(key, &mut calls, now, &config);
                if !status.throttled {
                    calls.push_back(now);
                    return Ok(());
                }
                status.wait
            };
            debug!(key, wait_ms = wait.as_millis() as u64, "Waiting for rate limit slot");
            // A zero wait with throttled=true only happens at the exact window
            // boundary; yield a millisecond so the oldest entry can expire.
            ctx.sleep(wait.max(Duration::from_millis(1))).await?;
        }
    }

    /// Drop keys whose queues are empty after trimming. Returns removed count.
    ///
    /// A queue some caller still holds is kept even when empty: that caller
    /// is about to append to it, and the append must stay visible.
    pub fn sweep(&self) -> usize {
        let window = self.config().window();
        let now = Instant::now();
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let before = queues.len();
        queues.retain(|_, queue| {
            if Arc::strong_count(queue) > 1 {
                return true;
            }
            let mut calls = queue.lock().unwrap_or_else(PoisonError::into_inner);
            trim(&mut calls, now, window);
            !calls.is_empty()
        });
        let removed = before - queues.len();
        if removed > 0 {
            debug!(removed, remaining = queues.len(), "Swept idle rate limit keys");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn existing_queue(&self, key: &str) -> Option<CallQueue> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn queue_for(&self, key: &str) -> CallQueue {
        if let Some(queue) = self.existing_queue(key) {
            return queue;
        }

        let max_keys = self.config().max_tracked_keys;
        if max_keys > 0 && self.tracked_keys() >= max_keys {
            self.sweep();
        }

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

fn trim(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = calls.front() {
        if now.saturating_duration_since(*oldest) >= window {
            calls.pop_front();
        } else {
            break;
        }
    }
}

fn compute_status(
    key: &str,
    calls: &mut VecDeque<Instant>,
    now: Instant,
    config: &RateLimitConfig,
) -> RateLimitStatus {
    let window = config.window();
    trim(calls, now, window);
    let count = calls.len() as u32;
    let throttled = count >= config.max_calls;
    let wait = match (throttled, calls.front()) {
        (true, Some(oldest)) => window.saturating_sub(now.saturating_duration_since(*oldest)),
        _ => Duration::ZERO,
    };
    RateLimitStatus {
        key: key.to_string(),
        count_in_window: count,
        limit: config.max_calls,
        throttled,
        wait,
    }
}
