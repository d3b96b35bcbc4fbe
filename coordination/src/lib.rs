//! Analysis Coordination Library
//!
//! Control plane for multi-specialist code analysis. A request carries a
//! file set, an objective and a list of specialists; the library decides
//! whether and how fast the external analyzers get called, survives their
//! failures, and merges their answers.
//!
//! # Components
//!
//! - [`rate_limit`]: per-key sliding-window throttling
//! - [`resilience`]: retry with capped backoff inside a circuit breaker
//! - [`dedup`]: request fingerprinting, TTL cache, single-flight computation
//! - [`extraction`]: bounded-concurrency per-file metadata extraction
//! - [`consensus`]: agreement, weighted confidence and recommendation buckets
//! - [`pipeline`]: the end-to-end request path over all of the above
//!
//! Every async entry point takes a [`RequestContext`] carrying the request
//! id and a cancellation token.
//!
//! # Usage
//!
//! ```rust,ignore
//! use analysis_coordination::{AnalysisPipeline, CoordinationConfig, PipelineRequest};
//!
//! let config = CoordinationConfig::load(Some(path))?;
//! let pipeline = AnalysisPipeline::new(&config, extractor)
//!     .with_analyzer(Specialty::Security, security_analyzer);
//! let report = pipeline.run(request, &RequestContext::new()).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod consensus;
pub mod context;
pub mod dedup;
pub mod extraction;
pub mod pipeline;
pub mod rate_limit;
pub mod resilience;

pub use config::{
    CircuitBreakerConfig, ConfigError, ConfigResult, ConsensusConfig, CoordinationConfig,
    DedupConfig, ExtractionConfig, RateLimitConfig, RetryConfig,
};
pub use consensus::{
    AnalysisResult, ConsensusAggregator, ConsensusMetrics, ConsolidatedRecommendations,
    Discussion, MessageKind, Priority, Recommendation, RecommendationSynthesizer, Specialty,
};
pub use context::{Cancelled, RequestContext};
pub use dedup::{Deduplicator, FileDescriptor, Fingerprint};
pub use extraction::{
    BatchExtraction, BatchExtractionCoordinator, ExtractionError, Extractor, FileMetadata,
    SourceFile,
};
pub use pipeline::{
    AnalysisPipeline, AnalysisReport, AnalysisRequest, Analyzer, PipelineError, PipelineRequest,
    ReportStatus,
};
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use resilience::{
    CircuitBreaker, CircuitState, ErrorClass, ExecError, ExternalError, ResilientCallExecutor,
};
