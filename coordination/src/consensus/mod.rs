//! Combining specialist results.
//!
//! - [`aggregator`]: agreement, weighted team confidence and discussion metrics
//! - [`recommendations`]: flattening and bucketing recommendations
//! - [`types`]: analysis results, priorities and discussion transcripts

pub mod aggregator;
pub mod recommendations;
pub mod types;

pub use aggregator::{modal_priority, ConsensusAggregator, ConsensusMetrics};
pub use recommendations::{
    bucket_priority, AttributedRecommendation, ConsolidatedRecommendations,
    RecommendationSynthesizer,
};
pub use types::{
    AnalysisResult, Discussion, DiscussionMessage, MessageKind, Priority, Recommendation,
    Specialty, UnknownPriority, UnknownSpecialty,
};
