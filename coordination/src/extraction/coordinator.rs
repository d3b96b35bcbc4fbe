//! Bounded-concurrency fan-out of per-file extraction.
//!
//! ```text
//! extract_all(files)
//!   validate (max_concurrency > 0)
//!   JoinSet::spawn(item_i) × N, each:
//!     acquire semaphore slot (cancellable)
//!     per-item cache → hit: done
//!                    → miss: extractor (panic-isolated) → cache on success
//!   fan-in by index → Vec<ItemOutcome> in input order + BatchMetrics
//! ```
//!
//! An item that errors or panics becomes a failed [`ItemOutcome`]; its
//! siblings keep running. Cancelling the request aborts outstanding tasks
//! and returns [`ExtractionError::Cancelled`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::context::RequestContext;
use crate::dedup::{Cache, ShardedTtlCache};

use super::types::{
    BatchExtraction, BatchMetrics, ExtractionError, ExtractionResult, Extractor, FileMetadata,
    ItemError, ItemOutcome, SourceFile,
};

/// Per-item cache identity: file name, size, mtime and language hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemKey {
    name: String,
    size: u64,
    modified: DateTime<Utc>,
    hint: Option<String>,
}

impl ItemKey {
    fn new(file: &SourceFile, hint: Option<&str>) -> Self {
        Self {
            name: file.name.clone(),
            size: file.size,
            modified: file.modified,
            hint: hint.map(str::to_string),
        }
    }
}

type MetadataCache = ShardedTtlCache<ItemKey, FileMetadata>;

pub struct BatchExtractionCoordinator {
    extractor: Arc<dyn Extractor>,
    config: RwLock<ExtractionConfig>,
    cache: Arc<MetadataCache>,
}

impl std::fmt::Debug for BatchExtractionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExtractionCoordinator")
            .field("config", &self.config())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl BatchExtractionCoordinator {
    pub fn new(extractor: Arc<dyn Extractor>, config: ExtractionConfig) -> Self {
        Self {
            extractor,
            cache: Arc::new(ShardedTtlCache::new(config.cache_max_entries)),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> ExtractionConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config(&self, config: ExtractionConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Cached per-file metadata entries.
    pub fn cached_items(&self) -> usize {
        self.cache.len()
    }

    /// Extract metadata for every file with at most `max_concurrency`
    /// extractions in flight (configured default when `None`).
    pub async fn extract_all(
        &self,
        files: &[SourceFile],
        language_hint: Option<&str>,
        max_concurrency: Option<usize>,
        ctx: &RequestContext,
    ) -> ExtractionResult<BatchExtraction> {
        let config = self.config();
        let limit = max_concurrency.unwrap_or(config.max_concurrency);
        if limit == 0 {
            return Err(ExtractionError::InvalidInput(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        ctx.check()?;

        let start = Instant::now();
        let semaphore = Arc::new(Semaphore::new(limit));
        let hint: Option<Arc<str>> = language_hint.map(Arc::from);
        let mut join_set: JoinSet<ItemOutcome> = JoinSet::new();

        for (index, file) in files.iter().enumerate() {
            let task = ItemTask {
                index,
                file: file.clone(),
                hint: hint.clone(),
                extractor: Arc::clone(&self.extractor),
                cache: Arc::clone(&self.cache),
                cache_ttl: config.cache_ttl(),
            };
            let semaphore = Arc::clone(&semaphore);
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return task.aborted(),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return task.aborted(),
                    },
                };
                task.run().await
            });
        }

        let mut slots: Vec<Option<ItemOutcome>> = vec![None; files.len()];
        loop {
            let joined = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    join_set.abort_all();
                    info!(files = files.len(), "Batch extraction cancelled");
                    return Err(ExtractionError::Cancelled);
                }
                joined = join_set.join_next() => joined,
            };
            match joined {
                Some(Ok(outcome)) => {
                    let index = outcome.index;
                    slots[index] = Some(outcome);
                }
                Some(Err(e)) => warn!(error = %e, "Extraction task failed to join"),
                None => break,
            }
        }

        let items: Vec<ItemOutcome> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| ItemOutcome {
                    index,
                    name: files[index].name.clone(),
                    result: Err(ItemError::Panicked("extraction task aborted".to_string())),
                    duration: Duration::ZERO,
                    from_cache: false,
                })
            })
            .collect();

        let metrics = BatchMetrics::from_items(&items, start.elapsed());
        info!(
            files = metrics.total_items,
            succeeded = metrics.succeeded,
            failed = metrics.failed,
            cache_hits = metrics.cache_hits,
            elapsed_ms = metrics.total_duration.as_millis() as u64,
            speedup = metrics.speedup,
            "Batch extraction complete"
        );
        Ok(BatchExtraction { items, metrics })
    }
}

struct ItemTask {
    index: usize,
    file: SourceFile,
    hint: Option<Arc<str>>,
    extractor: Arc<dyn Extractor>,
    cache: Arc<MetadataCache>,
    cache_ttl: Duration,
}

impl ItemTask {
    async fn run(self) -> ItemOutcome {
        let start = Instant::now();
        let hint = self.hint.as_deref();
        let key = ItemKey::new(&self.file, hint);

        if let Some(metadata) = self.cache.get(&key) {
            debug!(file = %self.file.name, "Extraction cache hit");
            return self.outcome(Ok(metadata), start.elapsed(), true);
        }

        let attempt = AssertUnwindSafe(self.extractor.extract(&self.file, hint))
            .catch_unwind()
            .await;
        let result = match attempt {
            Ok(Ok(metadata)) => {
                if let Err(e) = self.cache.insert(key, metadata.clone(), self.cache_ttl) {
                    debug!(file = %self.file.name, error = %e, "Metadata not cached");
                }
                Ok(metadata)
            }
            Ok(Err(e)) => {
                warn!(file = %self.file.name, error = %e, "Extraction failed");
                Err(ItemError::Extractor(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(file = %self.file.name, panic = %message, "Extractor panicked");
                Err(ItemError::Panicked(message))
            }
        };
        self.outcome(result, start.elapsed(), false)
    }

    fn aborted(self) -> ItemOutcome {
        self.outcome(
            Err(ItemError::Panicked("extraction task aborted".to_string())),
            Duration::ZERO,
            false,
        )
    }

    fn outcome(
        &self,
        result: Result<FileMetadata, ItemError>,
        duration: Duration,
        from_cache: bool,
    ) -> ItemOutcome {
        ItemOutcome {
            index: self.index,
            name: self.file.name.clone(),
            result,
            duration,
            from_cache,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ExternalError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps per file and tracks the peak number of concurrent extractions.
    #[derive(Default)]
    struct TrackingExtractor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extractor for TrackingExtractor {
        async fn extract(
            &self,
            file: &SourceFile,
            language_hint: Option<&str>,
        ) -> Result<FileMetadata, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match file.name.as_str() {
                "file4.py" => Err(ExternalError::InvalidResponse("unparseable".into())),
                "panic.py" => panic!("extractor bug"),
                _ => Ok(FileMetadata::new(&file.name, language_hint.map(str::to_string))
                    .with_detail("bytes", file.size)),
            }
        }
    }

    fn files(n: usize) -> Vec<SourceFile> {
        let modified = Utc::now();
        (1..=n)
            .map(|i| SourceFile::new(format!("file{i}.py"), modified, format!("x = {i}\n")))
            .collect()
    }

    fn coordinator(extractor: Arc<TrackingExtractor>) -> BatchExtractionCoordinator {
        BatchExtractionCoordinator::new(extractor, ExtractionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_and_failure_isolation() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();
        let input = files(10);

        let batch = coord
            .extract_all(&input, Some("python"), Some(3), &ctx)
            .await
            .unwrap();

        assert!(extractor.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(batch.items.len(), 10);
        for (i, item) in batch.items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.name, input[i].name);
        }
        assert!(matches!(
            batch.items[3].result,
            Err(ItemError::Extractor(ExternalError::InvalidResponse(_)))
        ));
        assert_eq!(batch.metrics.succeeded, 9);
        assert_eq!(batch.metrics.failed, 1);
        assert_eq!(
            batch.items[0].metadata().unwrap().language.as_deref(),
            Some("python")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_speedup_reported() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();

        let batch = coord.extract_all(&files(6), None, Some(3), &ctx).await.unwrap();
        // 6 items x 100ms over 3 slots -> ~200ms wall clock
        let total = batch.metrics.total_duration;
        assert!(total >= Duration::from_millis(200) && total < Duration::from_millis(210));
        assert!(batch.metrics.speedup > 2.8 && batch.metrics.speedup <= 3.0 + 1e-9);
        assert!(batch.metrics.throughput_per_sec > 28.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_isolated() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();
        let mut input = files(3);
        input[1] = SourceFile::new("panic.py", Utc::now(), "boom");

        let batch = coord.extract_all(&input, None, Some(2), &ctx).await.unwrap();
        assert!(batch.items[0].is_success());
        assert_eq!(
            batch.items[1].result,
            Err(ItemError::Panicked("extractor bug".to_string()))
        );
        assert!(batch.items[2].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_cache_hits_on_repeat() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();
        let input = files(5);

        coord.extract_all(&input, None, None, &ctx).await.unwrap();
        let second = coord.extract_all(&input, None, None, &ctx).await.unwrap();

        // file4 failed, so it is the only one extracted again
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 6);
        assert_eq!(second.metrics.cache_hits, 4);
        assert!(!second.items[3].from_cache);

        // a different hint is a different cache key
        coord.extract_all(&input, Some("python"), None, &ctx).await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_concurrency_rejected() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();
        let err = coord.extract_all(&files(2), None, Some(0), &ctx).await.unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidInput(_)));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_batch() {
        let extractor = Arc::new(TrackingExtractor::default());
        let coord = coordinator(Arc::clone(&extractor));
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let err = coord.extract_all(&files(10), None, Some(2), &ctx).await.unwrap_err();
        assert_eq!(err, ExtractionError::Cancelled);
        assert!(extractor.calls.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let coord = coordinator(Arc::new(TrackingExtractor::default()));
        let batch = coord
            .extract_all(&[], None, None, &RequestContext::new())
            .await
            .unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.metrics.total_items, 0);
    }
}
