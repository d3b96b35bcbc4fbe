//! Specialist builders.
//!
//! Each specialty maps to a preamble and an agent name; [`build_specialist`]
//! turns one into an [`Analyzer`] sharing a single HTTP client.

use std::sync::Arc;

use analysis_coordination::{Analyzer, Specialty};
use anyhow::{Context, Result};

use crate::config::LlmEndpoint;
use crate::llm::LlmAnalyzer;

const RESPONSE_FORMAT: &str = "\n\nRespond with a single JSON object and nothing else:\n\
{\"confidence_score\": <0-100>, \"priority\": \"CRITICAL|HIGH|MEDIUM|LOW\", \
\"findings\": [\"...\"], \
\"recommendations\": [{\"title\": \"...\", \"estimated_hours\": <number>, \"priority\": \"CRITICAL|HIGH|MEDIUM|LOW\"}]}";

pub fn agent_name(specialty: Specialty) -> String {
    format!("{specialty}-analyst")
}

pub fn preamble(specialty: Specialty) -> String {
    let focus = match specialty {
        Specialty::Security => {
            "You are a senior application security reviewer auditing legacy code. \
             Look for injection, unsafe deserialization, hard-coded credentials, missing \
             input validation, weak cryptography and outdated dependencies. Rate priority by \
             exploitability and blast radius."
        }
        Specialty::Performance => {
            "You are a performance engineer reviewing legacy code. Look for quadratic loops, \
             N+1 queries, blocking I/O on hot paths, excessive allocation and missing caching. \
             Rate priority by user-visible latency and cost."
        }
        Specialty::Architecture => {
            "You are a software architect planning the modernization of legacy code. Assess \
             coupling, layering, testability, dead code and migration paths. Rate priority by \
             how much the issue blocks further change."
        }
    };
    format!("{focus}{RESPONSE_FORMAT}")
}

/// Shared HTTP client for all specialists.
pub fn http_client(endpoint: &LlmEndpoint) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(endpoint.timeout)
        .build()
        .context("Failed to build HTTP client")
}

pub fn build_specialist(
    specialty: Specialty,
    http: &reqwest::Client,
    endpoint: &LlmEndpoint,
) -> Arc<dyn Analyzer> {
    Arc::new(LlmAnalyzer::new(
        http.clone(),
        endpoint.clone(),
        specialty,
        agent_name(specialty),
        preamble(specialty),
    ))
}

/// Build one analyzer per requested specialty.
pub fn build_all(
    specialties: &[Specialty],
    endpoint: &LlmEndpoint,
) -> Result<Vec<(Specialty, Arc<dyn Analyzer>)>> {
    let http = http_client(endpoint)?;
    Ok(specialties
        .iter()
        .map(|&s| (s, build_specialist(s, &http, endpoint)))
        .collect())
}
