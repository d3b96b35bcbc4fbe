//! Extraction inputs, outputs and errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::Cancelled;
use crate::dedup::FileDescriptor;
use crate::resilience::ExternalError;

/// One input file: identity metadata plus its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub content: Arc<str>,
}

impl SourceFile {
    /// Build a file whose size is the content length in bytes.
    pub fn new(name: impl Into<String>, modified: DateTime<Utc>, content: impl Into<Arc<str>>) -> Self {
        let content = content.into();
        Self {
            name: name.into(),
            size: content.len() as u64,
            modified,
            content,
        }
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::new(self.name.clone(), self.size, self.modified)
    }
}

/// Extractor payload for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub language: Option<String>,
    /// Extractor-specific facts (line counts, symbols, ...).
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl FileMetadata {
    pub fn new(file_name: impl Into<String>, language: Option<String>) -> Self {
        Self {
            file_name: file_name.into(),
            language,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Produces metadata for a single file.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        file: &SourceFile,
        language_hint: Option<&str>,
    ) -> Result<FileMetadata, ExternalError>;
}

/// Why one item in a batch produced no metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("extractor failed: {0}")]
    Extractor(#[from] ExternalError),

    #[error("extractor panicked: {0}")]
    Panicked(String),
}

/// Result for the file at `index` in the input list.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub index: usize,
    pub name: String,
    pub result: Result<FileMetadata, ItemError>,
    pub duration: Duration,
    pub from_cache: bool,
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.result.as_ref().ok()
    }
}

/// Batch timing telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub total_duration: Duration,
    pub mean_item_duration: Duration,
    /// Sum of item durations over wall-clock duration.
    pub speedup: f64,
    pub throughput_per_sec: f64,
}

/// `sum / count`, zero for an empty set. Counts beyond `u32` are fine.
fn mean_duration(sum: Duration, count: usize) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => sum / n,
        Err(_) => sum.div_f64(count as f64),
    }
}

impl BatchMetrics {
    pub(crate) fn from_items(items: &[ItemOutcome], total_duration: Duration) -> Self {
        let total_items = items.len();
        let succeeded = items.iter().filter(|i| i.is_success()).count();
        let cache_hits = items.iter().filter(|i| i.from_cache).count();
        let item_sum: Duration = items.iter().map(|i| i.duration).sum();

        let mean_item_duration = mean_duration(item_sum, total_items);
        let total_secs = total_duration.as_secs_f64();
        let (speedup, throughput_per_sec) = if total_secs > 0.0 {
            (item_sum.as_secs_f64() / total_secs, total_items as f64 / total_secs)
        } else {
            (0.0, 0.0)
        };

        Self {
            total_items,
            succeeded,
            failed: total_items - succeeded,
            cache_hits,
            total_duration,
            mean_item_duration,
            speedup,
            throughput_per_sec,
        }
    }
}

/// Per-file outcomes in input order plus batch metrics.
#[derive(Debug, Clone)]
pub struct BatchExtraction {
    pub items: Vec<ItemOutcome>,
    pub metrics: BatchMetrics,
}

impl BatchExtraction {
    pub fn successes(&self) -> impl Iterator<Item = &FileMetadata> {
        self.items.iter().filter_map(ItemOutcome::metadata)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.is_success())
    }
}

/// Batch-level failures. Per-item failures live in [`ItemOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("invalid extraction input: {0}")]
    InvalidInput(String),

    #[error("extraction cancelled")]
    Cancelled,
}

impl From<Cancelled> for ExtractionError {
    fn from(_: Cancelled) -> Self {
        ExtractionError::Cancelled
    }
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;
