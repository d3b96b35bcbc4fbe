//! Team-level consensus metrics over specialist results.
//!
//! Agreement is the share of analyses whose priority equals the modal
//! priority. Team confidence is the specialty-weighted mean of individual
//! confidence scores:
//!
//! ```text
//! team_confidence = round( Σ(confidence_i × weight_i) / Σ weight_i )
//! ```

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::ConsensusConfig;

use super::types::{AnalysisResult, Discussion, MessageKind, Priority};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusMetrics {
    pub total_messages: usize,
    pub discussion_duration: Duration,
    /// 0-100, rounded to two decimals.
    pub agreement_percentage: f64,
    pub per_agent_participation: BTreeMap<String, usize>,
    pub conflict_count: usize,
    pub resolved_conflict_count: usize,
    /// 0-100.
    pub team_confidence: u8,
    /// Most frequent priority; `None` when there were no analyses.
    pub consensus_priority: Option<Priority>,
}

/// Most frequent priority. Ties go to the value seen first.
pub fn modal_priority(priorities: &[Priority]) -> Option<(Priority, usize)> {
    let mut counts: Vec<(Priority, usize)> = Vec::new();
    for p in priorities {
        match counts.iter_mut().find(|(seen, _)| seen == p) {
            Some((_, n)) => *n += 1,
            None => counts.push((*p, 1)),
        }
    }
    // max_by_key keeps the last maximum; reverse so the first one wins.
    counts.into_iter().rev().max_by_key(|(_, n)| *n)
}

#[derive(Debug)]
pub struct ConsensusAggregator {
    config: RwLock<ConsensusConfig>,
}

impl Default for ConsensusAggregator {
    fn default() -> Self {
        Self::new(ConsensusConfig::default())
    }
}

impl ConsensusAggregator {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> ConsensusConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_config(&self, config: ConsensusConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn aggregate(&self, discussion: &Discussion, analyses: &[AnalysisResult]) -> ConsensusMetrics {
        let mut per_agent_participation = BTreeMap::new();
        let mut conflict_count = 0;
        let mut resolved_conflict_count = 0;
        for message in &discussion.messages {
            *per_agent_participation
                .entry(message.agent.clone())
                .or_insert(0) += 1;
            match message.kind {
                MessageKind::Challenge => conflict_count += 1,
                MessageKind::Synthesis => resolved_conflict_count += 1,
                MessageKind::Analysis | MessageKind::Statement => {}
            }
        }

        let priorities: Vec<Priority> = analyses.iter().map(|a| a.priority).collect();
        let modal = modal_priority(&priorities);
        let agreement_percentage = match modal {
            Some((_, matching)) => round2(100.0 * matching as f64 / analyses.len() as f64),
            None => 0.0,
        };

        let team_confidence = self.team_confidence(analyses);
        debug!(
            analyses = analyses.len(),
            agreement = agreement_percentage,
            team_confidence,
            "Aggregated consensus"
        );

        ConsensusMetrics {
            total_messages: discussion.messages.len(),
            discussion_duration: discussion.duration(),
            agreement_percentage,
            per_agent_participation,
            conflict_count,
            resolved_conflict_count,
            team_confidence,
            consensus_priority: modal.map(|(p, _)| p),
        }
    }

    /// Specialty-weighted mean confidence, rounded and clamped to 0-100.
    pub fn team_confidence(&self, analyses: &[AnalysisResult]) -> u8 {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let (weighted, total_weight) = analyses.iter().fold((0.0, 0.0), |(sum, total), a| {
            let w = config.weight_for(&a.specialty).max(0.0);
            (sum + a.confidence_score * w, total + w)
        });
        if total_weight <= 0.0 {
            return 0;
        }
        (weighted / total_weight).round().clamp(0.0, 100.0) as u8
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
