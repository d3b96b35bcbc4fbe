use std::time::Duration;

/// OpenAI-compatible chat-completions endpoint used by every specialist.
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    /// Base URL up to and including `/v1`.
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TEMPERATURE: f32 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 2_048;

impl Default for LlmEndpoint {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl LlmEndpoint {
    /// Build from `ANALYZER_LLM_*` keys, falling back to a local server.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            url: lookup("ANALYZER_LLM_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://localhost:8080/v1".into()),
            model: lookup("ANALYZER_LLM_MODEL").unwrap_or_else(|| "local-coder".into()),
            api_key: lookup("ANALYZER_LLM_API_KEY").filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(
                lookup("ANALYZER_LLM_TIMEOUT_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            temperature: lookup("ANALYZER_LLM_TEMPERATURE")
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.url)
    }
}
