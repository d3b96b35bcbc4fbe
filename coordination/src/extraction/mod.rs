//! Batch metadata extraction.
//!
//! [`BatchExtractionCoordinator`] fans a file list out to an [`Extractor`]
//! with bounded concurrency and a per-file cache, and fans the results back
//! in input order.

pub mod coordinator;
pub mod types;

pub use coordinator::BatchExtractionCoordinator;
pub use types::{
    BatchExtraction, BatchMetrics, ExtractionError, ExtractionResult, Extractor, FileMetadata,
    ItemError, ItemOutcome, SourceFile,
};
