//! End-to-end analysis pipeline.
//!
//! ```text
//! run(request)
//!   ├─ validate
//!   ├─ fingerprint → dedup hit? ──────────────────────→ cached report
//!   └─ single-flight compute:
//!        extract_all(files)            bounded, per-file cached
//!        for each specialist (concurrently):
//!          rate_limiter.acquire → executor.execute(analyzer.analyze)
//!        discussion transcript
//!        consensus + recommendations
//!        store report (Complete only)
//! ```
//!
//! Per-file and per-specialist failures are reported inside the
//! [`AnalysisReport`]; the run fails only when nothing usable is left.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::config::{ConfigResult, CoordinationConfig};
use crate::consensus::{
    modal_priority, AnalysisResult, ConsensusAggregator, ConsensusMetrics,
    ConsolidatedRecommendations, Discussion, MessageKind, Priority, RecommendationSynthesizer,
    Specialty,
};
use crate::context::{Cancelled, RequestContext};
use crate::dedup::{DedupSource, Deduplicator, Fingerprint};
use crate::extraction::{
    BatchExtractionCoordinator, BatchMetrics, ExtractionError, Extractor, FileMetadata, SourceFile,
};
use crate::rate_limit::RateLimiter;
use crate::resilience::{ErrorClass, ExecError, ExternalError, ResilientCallExecutor};

/// Agent name used for coordinator-authored discussion messages.
const COORDINATOR_AGENT: &str = "coordinator";

/// Input handed to one specialist.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub specialty: Specialty,
    pub objective: Option<String>,
    /// Files whose extraction succeeded, in request order.
    pub files: Vec<SourceFile>,
    /// Metadata for `files`, index-aligned.
    pub metadata: Vec<FileMetadata>,
}

/// A specialist analyzer backed by some external service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult, ExternalError>;
}

#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub files: Vec<SourceFile>,
    pub objective: Option<String>,
    pub specialists: Vec<Specialty>,
    pub language_hint: Option<String>,
    /// Overrides the configured extraction concurrency.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Complete,
    /// Some files or specialists failed; see the report's failure lists.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecialistFailure {
    pub specialty: Specialty,
    pub error: String,
    pub class: ErrorClass,
    pub circuit_open: bool,
}

impl SpecialistFailure {
    fn new(specialty: Specialty, err: &ExecError) -> Self {
        Self {
            specialty,
            error: err.to_string(),
            class: err.class(),
            circuit_open: err.is_circuit_open(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub fingerprint: Fingerprint,
    pub status: ReportStatus,
    pub analyses: Vec<AnalysisResult>,
    pub consensus: ConsensusMetrics,
    pub recommendations: ConsolidatedRecommendations,
    pub discussion: Discussion,
    pub file_failures: Vec<FileFailure>,
    pub specialist_failures: Vec<SpecialistFailure>,
    pub extraction: BatchMetrics,
    pub generated_at: DateTime<Utc>,
    /// Served from the dedup cache rather than computed for this call.
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Analysis service overloaded, retry after {retry_after:?}")]
    Overloaded { retry_after: Duration },

    #[error("All {} specialists failed", failures.len())]
    AllSpecialistsFailed { failures: Vec<SpecialistFailure> },

    #[error("Analysis cancelled")]
    Cancelled,
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        PipelineError::Cancelled
    }
}

impl From<ExtractionError> for PipelineError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::InvalidInput(msg) => PipelineError::InvalidInput(msg),
            ExtractionError::Cancelled => PipelineError::Cancelled,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Wires the control-plane components into a single request path.
pub struct AnalysisPipeline {
    rate_limiter: Arc<RateLimiter>,
    executor: Arc<ResilientCallExecutor>,
    dedup: Deduplicator<AnalysisReport>,
    extraction: BatchExtractionCoordinator,
    aggregator: ConsensusAggregator,
    synthesizer: RecommendationSynthesizer,
    analyzers: BTreeMap<Specialty, Arc<dyn Analyzer>>,
}

impl std::fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("specialists", &self.analyzers.keys().collect::<Vec<_>>())
            .field("breaker", &self.executor.breaker().state())
            .finish_non_exhaustive()
    }
}

impl AnalysisPipeline {
    /// Build a pipeline with its own rate limiter and breaker.
    pub fn new(config: &CoordinationConfig, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            executor: Arc::new(ResilientCallExecutor::new(
                "analyzer",
                config.retry,
                config.circuit_breaker,
            )),
            dedup: Deduplicator::new(config.dedup),
            extraction: BatchExtractionCoordinator::new(extractor, config.extraction),
            aggregator: ConsensusAggregator::new(config.consensus.clone()),
            synthesizer: RecommendationSynthesizer::new(),
            analyzers: BTreeMap::new(),
        }
    }

    pub fn with_analyzer(mut self, specialty: Specialty, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.insert(specialty, analyzer);
        self
    }

    /// Share a process-wide rate limiter with other pipelines.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Share a process-wide executor (and its breaker) with other pipelines.
    pub fn with_executor(mut self, executor: Arc<ResilientCallExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn executor(&self) -> &Arc<ResilientCallExecutor> {
        &self.executor
    }

    pub fn deduplicator(&self) -> &Deduplicator<AnalysisReport> {
        &self.dedup
    }

    pub fn specialists(&self) -> impl Iterator<Item = Specialty> + '_ {
        self.analyzers.keys().copied()
    }

    /// Validate `config` and push every section into the live components.
    pub fn reload_config(&self, config: &CoordinationConfig) -> ConfigResult<()> {
        config.validate()?;
        self.rate_limiter.set_config(config.rate_limit);
        self.executor.retry_policy().set_config(config.retry);
        self.executor.breaker().set_config(config.circuit_breaker);
        self.dedup.set_config(config.dedup);
        self.extraction.set_config(config.extraction);
        self.aggregator.set_config(config.consensus.clone());
        info!("Coordination config reloaded");
        Ok(())
    }

    /// Analyze `request`, serving identical concurrent or recent requests
    /// from the dedup cache.
    pub async fn run(
        &self,
        request: PipelineRequest,
        ctx: &RequestContext,
    ) -> PipelineResult<AnalysisReport> {
        let span = ctx.span();
        self.run_in_span(request, ctx).instrument(span).await
    }

    async fn run_in_span(
        &self,
        mut request: PipelineRequest,
        ctx: &RequestContext,
    ) -> PipelineResult<AnalysisReport> {
        self.validate(&mut request)?;
        ctx.check()?;

        let descriptors: Vec<_> = request.files.iter().map(SourceFile::descriptor).collect();
        let agents: Vec<&str> = request.specialists.iter().map(|s| s.as_str()).collect();
        let fp = self.dedup.fingerprint(
            &descriptors,
            request.objective.as_deref(),
            request.language_hint.as_deref(),
            &agents,
        );

        let deduped = self
            .dedup
            .get_or_compute(
                &fp,
                ctx,
                |report: &AnalysisReport| report.status == ReportStatus::Complete,
                || self.analyze(&request, fp.clone(), ctx),
            )
            .await?;

        let mut report = deduped.value;
        report.from_cache = deduped.source != DedupSource::Computed;
        info!(
            fingerprint = %report.fingerprint,
            status = ?report.status,
            from_cache = report.from_cache,
            analyses = report.analyses.len(),
            "Analysis finished"
        );
        Ok(report)
    }

    /// Reject malformed requests and normalize the specialist list.
    fn validate(&self, request: &mut PipelineRequest) -> PipelineResult<()> {
        if request.files.is_empty() {
            return Err(PipelineError::InvalidInput("no files to analyze".into()));
        }
        let mut names = HashSet::new();
        for file in &request.files {
            if !names.insert(file.name.as_str()) {
                return Err(PipelineError::InvalidInput(format!(
                    "duplicate file name '{}'",
                    file.name
                )));
            }
        }

        request.specialists.sort();
        request.specialists.dedup();
        if request.specialists.is_empty() {
            return Err(PipelineError::InvalidInput("no specialists selected".into()));
        }
        if let Some(missing) = request
            .specialists
            .iter()
            .find(|s| !self.analyzers.contains_key(s))
        {
            return Err(PipelineError::InvalidInput(format!(
                "no analyzer registered for '{missing}'"
            )));
        }
        if request.max_concurrency == Some(0) {
            return Err(PipelineError::InvalidInput(
                "max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    async fn analyze(
        &self,
        request: &PipelineRequest,
        fingerprint: Fingerprint,
        ctx: &RequestContext,
    ) -> PipelineResult<AnalysisReport> {
        let batch = self
            .extraction
            .extract_all(
                &request.files,
                request.language_hint.as_deref(),
                request.max_concurrency,
                ctx,
            )
            .await?;

        let mut files = Vec::new();
        let mut metadata = Vec::new();
        let mut file_failures = Vec::new();
        for item in &batch.items {
            match &item.result {
                Ok(meta) => {
                    files.push(request.files[item.index].clone());
                    metadata.push(meta.clone());
                }
                Err(e) => file_failures.push(FileFailure {
                    name: item.name.clone(),
                    error: e.to_string(),
                }),
            }
        }
        if files.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "none of the {} files could be extracted",
                request.files.len()
            )));
        }

        let started_at = Utc::now();
        let calls = request.specialists.iter().map(|&specialty| {
            let analysis_request = AnalysisRequest {
                specialty,
                objective: request.objective.clone(),
                files: files.clone(),
                metadata: metadata.clone(),
            };
            async move {
                let result = self.call_specialist(analysis_request, ctx).await;
                (specialty, result)
            }
        });
        let outcomes = join_all(calls).await;
        ctx.check()?;

        let mut analyses = Vec::new();
        let mut specialist_failures = Vec::new();
        let mut retry_after: Option<Duration> = None;
        for (specialty, outcome) in outcomes {
            match outcome {
                Ok(result) => analyses.push(result),
                Err(ExecError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(specialty = %specialty, error = %e, "Specialist failed");
                    if let ExecError::CircuitOpen { retry_after: wait, .. } = &e {
                        retry_after = Some(retry_after.map_or(*wait, |w| w.max(*wait)));
                    }
                    specialist_failures.push(SpecialistFailure::new(specialty, &e));
                }
            }
        }

        if analyses.is_empty() {
            return Err(match retry_after {
                Some(retry_after) => PipelineError::Overloaded { retry_after },
                None => PipelineError::AllSpecialistsFailed {
                    failures: specialist_failures,
                },
            });
        }

        let discussion = build_discussion(started_at, &analyses);
        let consensus = self.aggregator.aggregate(&discussion, &analyses);
        let recommendations = self.synthesizer.synthesize(&analyses);
        let status = if file_failures.is_empty() && specialist_failures.is_empty() {
            ReportStatus::Complete
        } else {
            ReportStatus::Partial
        };

        Ok(AnalysisReport {
            fingerprint,
            status,
            analyses,
            consensus,
            recommendations,
            discussion,
            file_failures,
            specialist_failures,
            extraction: batch.metrics,
            generated_at: Utc::now(),
            from_cache: false,
        })
    }

    async fn call_specialist(
        &self,
        request: AnalysisRequest,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult, ExecError> {
        let analyzer = self
            .analyzers
            .get(&request.specialty)
            .ok_or_else(|| {
                ExecError::failed(
                    ExternalError::Other(format!("no analyzer for '{}'", request.specialty)),
                    ErrorClass::Permanent,
                )
            })?
            .as_ref();

        let key = format!("analyzer:{}", request.specialty);
        self.rate_limiter.acquire(&key, ctx).await?;
        debug!(specialty = %request.specialty, files = request.files.len(), "Calling analyzer");

        let request = &request;
        self.executor
            .execute(ctx, || analyzer.analyze(request, ctx))
            .await
    }
}

/// One Analysis message per result, a Challenge for each result whose
/// priority differs from the mode, and a closing Synthesis when any
/// challenge was raised.
fn build_discussion(started_at: DateTime<Utc>, analyses: &[AnalysisResult]) -> Discussion {
    let mut discussion = Discussion::new(started_at);
    for a in analyses {
        let headline = a.findings.first().map(String::as_str).unwrap_or("no findings");
        discussion.push(
            &a.agent_name,
            MessageKind::Analysis,
            format!(
                "{} priority at {:.0}% confidence: {}",
                a.priority, a.confidence_score, headline
            ),
        );
    }

    let priorities: Vec<Priority> = analyses.iter().map(|a| a.priority).collect();
    if let Some((consensus, _)) = modal_priority(&priorities) {
        let mut challenges = 0;
        for a in analyses.iter().filter(|a| a.priority != consensus) {
            challenges += 1;
            discussion.push(
                &a.agent_name,
                MessageKind::Challenge,
                format!("rates {} against team priority {}", a.priority, consensus),
            );
        }
        if challenges > 0 {
            discussion.push(
                COORDINATOR_AGENT,
                MessageKind::Synthesis,
                format!("adopted {consensus} after {challenges} challenge(s)"),
            );
        }
    }
    discussion.close(Utc::now());
    discussion
}
