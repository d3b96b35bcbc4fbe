//! Request deduplication and result caching.
//!
//! Requests are keyed by a [`Fingerprint`] over their input descriptors.
//! [`Deduplicator::get_or_compute`] is single-flight: concurrent callers with
//! the same fingerprint wait for the first one instead of repeating the work,
//! then read its cached result.
//!
//! ```text
//! get_or_compute(fp)
//!   ├─ cache hit                          → Cached
//!   ├─ gate free → compute → store        → Computed
//!   └─ gate held → wait → re-check cache
//!        ├─ hit                           → Coalesced
//!        └─ miss (leader failed/uncacheable) → compute → Computed
//! ```

pub mod cache;
pub mod fingerprint;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::config::DedupConfig;
use crate::context::{Cancelled, RequestContext};

pub use cache::{Cache, CacheError, ShardedTtlCache};
pub use fingerprint::{canonical_form, fingerprint, FileDescriptor, Fingerprint, FingerprintOptions};

/// How a [`Deduplicator::get_or_compute`] result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupSource {
    /// Found in the cache on first lookup.
    Cached,
    /// Produced by a concurrent caller this one waited for.
    Coalesced,
    /// Computed by this caller.
    Computed,
}

impl DedupSource {
    pub fn is_hit(self) -> bool {
        !matches!(self, DedupSource::Computed)
    }
}

#[derive(Debug, Clone)]
pub struct Deduped<V> {
    pub value: V,
    pub source: DedupSource,
}

type Gate = Arc<AsyncMutex<()>>;

/// Fingerprint-keyed result cache with single-flight computation.
///
/// `max_entries` is fixed when the deduplicator is built; TTL and
/// fingerprint options follow [`Deduplicator::set_config`].
pub struct Deduplicator<V> {
    config: RwLock<DedupConfig>,
    cache: ShardedTtlCache<Fingerprint, V>,
    in_flight: Mutex<HashMap<Fingerprint, Gate>>,
}

impl<V> std::fmt::Debug for Deduplicator<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl<V> Deduplicator<V> {
    pub fn config(&self) -> DedupConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config(&self, config: DedupConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Fingerprint under the current options.
    pub fn fingerprint<S: AsRef<str>>(
        &self,
        items: &[FileDescriptor],
        objective: Option<&str>,
        language_hint: Option<&str>,
        agents: &[S],
    ) -> Fingerprint {
        fingerprint(
            items,
            objective,
            language_hint,
            agents,
            FingerprintOptions::from(&self.config()),
        )
    }

    /// Number of fingerprints with a computation currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<V: Clone + Send + Sync> Deduplicator<V> {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            cache: ShardedTtlCache::new(config.max_entries),
            config: RwLock::new(config),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, fp: &Fingerprint) -> Option<V> {
        self.cache.get(fp)
    }

    /// Cache `value` under `fp`. `ttl` defaults to the configured TTL.
    ///
    /// Storage failures are logged and swallowed; a missed cache write never
    /// fails the request that produced the value.
    pub fn store(&self, fp: Fingerprint, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.config().ttl());
        if let Err(e) = self.cache.insert(fp.clone(), value, ttl) {
            warn!(fingerprint = %fp, error = %e, "Failed to cache result");
        }
    }

    pub fn invalidate(&self, fp: &Fingerprint) -> Option<V> {
        self.cache.remove(fp)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Return the cached value for `fp`, or run `compute` once across all
    /// concurrent callers with the same fingerprint.
    ///
    /// Values for which `should_store` returns false are returned to this
    /// caller but not cached; a waiting caller then computes its own.
    pub async fn get_or_compute<E, F, Fut>(
        &self,
        fp: &Fingerprint,
        ctx: &RequestContext,
        should_store: impl Fn(&V) -> bool,
        compute: F,
    ) -> Result<Deduped<V>, E>
    where
        E: From<Cancelled>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.lookup(fp) {
            debug!(fingerprint = %fp, "Dedup cache hit");
            return Ok(Deduped {
                value,
                source: DedupSource::Cached,
            });
        }

        // Declared before the guard so the guard drops first.
        let lease = GateLease::new(self, fp);
        let (_guard, waited) = match lease.gate.clone().try_lock_owned() {
            Ok(guard) => (guard, false),
            Err(_) => {
                debug!(fingerprint = %fp, "Waiting on in-flight computation");
                let guard = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(Cancelled.into()),
                    guard = lease.gate.clone().lock_owned() => guard,
                };
                (guard, true)
            }
        };

        if waited {
            if let Some(value) = self.lookup(fp) {
                return Ok(Deduped {
                    value,
                    source: DedupSource::Coalesced,
                });
            }
        }
        ctx.check()?;

        let value = compute().await?;
        if should_store(&value) {
            self.store(fp.clone(), value.clone(), None);
        }
        Ok(Deduped {
            value,
            source: DedupSource::Computed,
        })
    }
}

/// Holds a reference to a fingerprint's gate and removes the map entry once
/// nobody else is using it.
struct GateLease<'a, V> {
    owner: &'a Deduplicator<V>,
    fp: Fingerprint,
    gate: Gate,
}

impl<'a, V> GateLease<'a, V> {
    fn new(owner: &'a Deduplicator<V>, fp: &Fingerprint) -> Self {
        let gate = owner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fp.clone())
            .or_default()
            .clone();
        Self {
            owner,
            fp: fp.clone(),
            gate,
        }
    }
}

impl<V> Drop for GateLease<'_, V> {
    fn drop(&mut self) {
        let mut map = self
            .owner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Map entry + this lease: no other caller holds or awaits the gate.
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.fp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dedup(ttl_secs: u64) -> Deduplicator<String> {
        Deduplicator::new(DedupConfig {
            ttl_secs,
            ..DedupConfig::default()
        })
    }

    fn request_fp(d: &Deduplicator<String>) -> Fingerprint {
        let modified = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        d.fingerprint(
            &[FileDescriptor::new("Main.java", 100, modified)],
            Some("modernize"),
            None,
            &["security"],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_then_lookup_until_ttl() {
        let d = dedup(1_800);
        let fp = request_fp(&d);
        assert!(d.lookup(&fp).is_none());
        d.store(fp.clone(), "report".into(), None);
        assert_eq!(d.lookup(&fp).as_deref(), Some("report"));

        tokio::time::advance(Duration::from_secs(1_800)).await;
        assert!(d.lookup(&fp).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_swallowed() {
        let d: Deduplicator<String> = Deduplicator::new(DedupConfig {
            max_entries: 0,
            ..DedupConfig::default()
        });
        let fp = request_fp(&d);
        d.store(fp.clone(), "report".into(), None);
        assert!(d.lookup(&fp).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_compute_caches() {
        let d = dedup(60);
        let fp = request_fp(&d);
        let ctx = RequestContext::new();

        let first = d
            .get_or_compute(&fp, &ctx, |_| true, || async { Ok::<_, Cancelled>("r1".to_string()) })
            .await
            .unwrap();
        assert_eq!(first.source, DedupSource::Computed);

        let second = d
            .get_or_compute(&fp, &ctx, |_| true, || async { Ok::<_, Cancelled>("r2".to_string()) })
            .await
            .unwrap();
        assert_eq!(second.source, DedupSource::Cached);
        assert_eq!(second.value, "r1");
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncacheable_value_not_stored() {
        let d = dedup(60);
        let fp = request_fp(&d);
        let ctx = RequestContext::new();
        d.get_or_compute(&fp, &ctx, |v: &String| v != "partial", || async {
            Ok::<_, Cancelled>("partial".to_string())
        })
        .await
        .unwrap();
        assert!(d.lookup(&fp).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_computation() {
        let d = Arc::new(dedup(60));
        let fp = request_fp(&d);
        let computed = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let d = Arc::clone(&d);
            let fp = fp.clone();
            let computed = Arc::clone(&computed);
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new();
                d.get_or_compute(&fp, &ctx, |_| true, || async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, Cancelled>("shared".to_string())
                })
                .await
                .unwrap()
            }));
        }

        let mut coalesced = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.value, "shared");
            if result.source == DedupSource::Coalesced {
                coalesced += 1;
            }
        }
        assert_eq!(computed.load(Ordering::SeqCst), 1);
        assert_eq!(coalesced, 4);
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_recomputes_after_leader_error() {
        let d = Arc::new(dedup(60));
        let fp = request_fp(&d);

        let leader = {
            let d = Arc::clone(&d);
            let fp = fp.clone();
            tokio::spawn(async move {
                let ctx = RequestContext::new();
                d.get_or_compute(&fp, &ctx, |_| true, || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Err::<String, _>(Cancelled)
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let ctx = RequestContext::new();
        let follower = d
            .get_or_compute(&fp, &ctx, |_| true, || async { Ok::<_, Cancelled>("retry".to_string()) })
            .await
            .unwrap();

        assert!(leader.await.unwrap().is_err());
        assert_eq!(follower.source, DedupSource::Computed);
        assert_eq!(follower.value, "retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_cancellation() {
        let d = Arc::new(dedup(60));
        let fp = request_fp(&d);

        let leader = {
            let d = Arc::clone(&d);
            let fp = fp.clone();
            tokio::spawn(async move {
                let ctx = RequestContext::new();
                d.get_or_compute(&fp, &ctx, |_| true, || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, Cancelled>("slow".to_string())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result = d
            .get_or_compute(&fp, &ctx, |_| true, || async { Ok::<_, Cancelled>("never".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), Cancelled);

        assert_eq!(leader.await.unwrap().unwrap().value, "slow");
        assert_eq!(d.in_flight(), 0);
    }
}
