//! Coordination configuration
//!
//! All tunables of the control plane live here. Values load from a TOML file
//! (every section optional, missing keys fall back to defaults) and may then
//! be overridden from `ANALYZER_*` environment variables.
//!
//! ```toml
//! [rate_limit]
//! window_secs = 60
//! max_calls = 20
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! break_duration_secs = 30
//!
//! [consensus.weights]
//! security = 1.0
//! performance = 0.85
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Sliding-window rate limiting per agent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of the trailing window in seconds.
    pub window_secs: u64,
    /// Calls admitted per key inside one window.
    pub max_calls: u32,
    /// Tracked keys before idle keys are swept.
    pub max_tracked_keys: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_calls: 20,
            max_tracked_keys: 1024,
        }
    }
}

/// Retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a trial call is admitted.
    pub break_duration_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn break_duration(&self) -> Duration {
        Duration::from_secs(self.break_duration_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration_secs: 30,
        }
    }
}

/// Request deduplication and result caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Lifetime of a cached report in seconds.
    pub ttl_secs: u64,
    /// Whether the objective text participates in the fingerprint.
    pub include_objective: bool,
    /// Whether the selected agent list participates in the fingerprint.
    pub include_agents: bool,
    /// Maximum cached reports before least-recently-used eviction.
    pub max_entries: usize,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1_800,
            include_objective: true,
            include_agents: true,
            max_entries: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Extractions allowed in flight at once (overridable per call).
    pub max_concurrency: usize,
    /// Lifetime of cached per-file metadata in seconds.
    pub cache_ttl_secs: u64,
    /// Maximum cached metadata entries.
    pub cache_max_entries: usize,
}

impl ExtractionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            cache_ttl_secs: 3_600,
            cache_max_entries: 2_048,
        }
    }
}

/// Per-specialty weights used for team confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Weight by lowercase specialty name.
    pub weights: BTreeMap<String, f64>,
    /// Weight for specialties missing from `weights`.
    pub default_weight: f64,
}

impl ConsensusConfig {
    /// Weight for a specialty (case-insensitive), falling back to the default.
    pub fn weight_for(&self, specialty: &str) -> f64 {
        self.weights
            .get(&specialty.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_weight)
    }

    /// Same weight for every specialty.
    pub fn uniform() -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: 1.0,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let weights = [
            ("security", 1.0),
            ("architecture", 0.9),
            ("performance", 0.85),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            weights,
            default_weight: 0.75,
        }
    }
}

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dedup: DedupConfig,
    pub extraction: ExtractionConfig,
    pub consensus: ConsensusConfig,
}

impl CoordinationConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file, then apply environment overrides.
    ///
    /// Without a path the defaults are used as the base.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ANALYZER_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse::<T>().ok())
        }

        if let Some(v) = parsed(&lookup, "ANALYZER_RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_RATE_LIMIT_MAX_CALLS") {
            self.rate_limit.max_calls = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_BREAKER_THRESHOLD") {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_BREAKER_DURATION_SECS") {
            self.circuit_breaker.break_duration_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_DEDUP_TTL_SECS") {
            self.dedup.ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ANALYZER_EXTRACTION_CONCURRENCY") {
            self.extraction.max_concurrency = v;
        }
    }

    /// Reject values that would stall or disable a component.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.rate_limit.max_calls == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_calls must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.extraction.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "extraction.max_concurrency must be at least 1".into(),
            ));
        }
        if self.consensus.default_weight < 0.0
            || self.consensus.weights.values().any(|w| *w < 0.0 || !w.is_finite())
        {
            return Err(ConfigError::Invalid(
                "consensus weights must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoordinationConfig::default();
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_calls, 20);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.break_duration(), Duration::from_secs(30));
        assert!(config.dedup.include_objective);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            [rate_limit]
            max_calls = 5

            [consensus]
            default_weight = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_calls, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.consensus.default_weight, 0.5);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let err = CoordinationConfig::from_toml_str("[rate_limit]\nmax_calls = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err =
            CoordinationConfig::from_toml_str("[extraction]\nmax_concurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordination.toml");
        std::fs::write(&path, "[dedup]\nttl_secs = 10\ninclude_agents = false\n").unwrap();
        let config = CoordinationConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dedup.ttl(), Duration::from_secs(10));
        assert!(!config.dedup.include_agents);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CoordinationConfig::load(Some(Path::new("/nonexistent/analyzer.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_overrides_applied_and_garbage_ignored() {
        let vars: HashMap<&str, &str> = [
            ("ANALYZER_RATE_LIMIT_MAX_CALLS", "7"),
            ("ANALYZER_BREAKER_THRESHOLD", "not-a-number"),
            ("ANALYZER_EXTRACTION_CONCURRENCY", " 9 "),
        ]
        .into_iter()
        .collect();
        let mut config = CoordinationConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.rate_limit.max_calls, 7);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.extraction.max_concurrency, 9);
    }

    #[test]
    fn test_weight_lookup_case_insensitive() {
        let consensus = ConsensusConfig::default();
        assert_eq!(consensus.weight_for("Security"), 1.0);
        assert_eq!(consensus.weight_for("documentation"), 0.75);
        assert_eq!(ConsensusConfig::uniform().weight_for("anything"), 1.0);
    }
}
