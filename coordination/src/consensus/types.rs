//! Specialist analysis results and discussion transcripts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Urgency of an analysis or recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority '{0}'")]
pub struct UnknownPriority(pub String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            _ => Err(UnknownPriority(s.to_string())),
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Specialist perspective an analyzer is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specialty {
    Security,
    Performance,
    Architecture,
}

impl Specialty {
    pub const ALL: [Specialty; 3] = [
        Specialty::Security,
        Specialty::Performance,
        Specialty::Architecture,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Architecture => "architecture",
        }
    }
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown specialty '{0}' (expected security, performance or architecture)")]
pub struct UnknownSpecialty(pub String);

impl FromStr for Specialty {
    type Err = UnknownSpecialty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => Ok(Self::Security),
            "performance" => Ok(Self::Performance),
            "architecture" => Ok(Self::Architecture),
            _ => Err(UnknownSpecialty(s.to_string())),
        }
    }
}

/// A single actionable item proposed by a specialist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    #[serde(default)]
    pub estimated_hours: f64,
    /// Free-form priority as reported; bucketed case-insensitively.
    #[serde(default)]
    pub priority: String,
}

impl Recommendation {
    pub fn new(title: impl Into<String>, estimated_hours: f64, priority: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            estimated_hours,
            priority: priority.into(),
        }
    }
}

/// One specialist's verdict on the analyzed files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub agent_name: String,
    /// Specialty name; unknown names get the default consensus weight.
    pub specialty: String,
    /// 0-100.
    pub confidence_score: f64,
    pub priority: Priority,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Analysis,
    /// Disagreement with the emerging consensus.
    Challenge,
    /// Resolution of one or more challenges.
    Synthesis,
    Statement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionMessage {
    pub agent: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered transcript of a specialist discussion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discussion {
    pub messages: Vec<DiscussionMessage>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Discussion {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            messages: Vec::new(),
            started_at,
            ended_at: None,
        }
    }

    pub fn push(&mut self, agent: impl Into<String>, kind: MessageKind, content: impl Into<String>) {
        self.messages.push(DiscussionMessage {
            agent: agent.into(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn close(&mut self, ended_at: DateTime<Utc>) {
        self.ended_at = Some(ended_at);
    }

    /// `ended_at - started_at`; zero while open or if the clock went backwards.
    pub fn duration(&self) -> Duration {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or_default()
    }
}
