//! Consolidation of specialist recommendations into priority buckets.

use serde::Serialize;

use super::types::{AnalysisResult, Priority, Recommendation};

/// A recommendation tagged with the agent that proposed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributedRecommendation {
    pub source_agent: String,
    #[serde(flatten)]
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidatedRecommendations {
    /// CRITICAL and HIGH.
    pub high_priority: Vec<AttributedRecommendation>,
    /// MEDIUM, plus anything empty or unrecognized.
    pub medium_priority: Vec<AttributedRecommendation>,
    /// LOW.
    pub long_term_strategic: Vec<AttributedRecommendation>,
    pub total_estimated_effort: f64,
}

impl ConsolidatedRecommendations {
    pub fn len(&self) -> usize {
        self.high_priority.len() + self.medium_priority.len() + self.long_term_strategic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bucket for a free-form priority string.
pub fn bucket_priority(raw: &str) -> Priority {
    raw.parse().unwrap_or(Priority::Medium)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecommendationSynthesizer;

impl RecommendationSynthesizer {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(&self, analyses: &[AnalysisResult]) -> ConsolidatedRecommendations {
        let mut out = ConsolidatedRecommendations::default();
        for analysis in analyses {
            for rec in &analysis.recommendations {
                out.total_estimated_effort += rec.estimated_hours;
                let attributed = AttributedRecommendation {
                    source_agent: analysis.agent_name.clone(),
                    recommendation: rec.clone(),
                };
                match bucket_priority(&rec.priority) {
                    Priority::Critical | Priority::High => out.high_priority.push(attributed),
                    Priority::Medium => out.medium_priority.push(attributed),
                    Priority::Low => out.long_term_strategic.push(attributed),
                }
            }
        }
        out
    }
}
