//! Specialist analyzer backed by an OpenAI-compatible chat-completions API.
//!
//! Transport and HTTP failures are mapped onto [`ExternalError`] so the
//! coordination layer can classify them:
//!
//! | Failure                      | Mapped to          |
//! |------------------------------|--------------------|
//! | non-2xx status               | `Http { status }`  |
//! | request timeout              | `Timeout`          |
//! | connect / send failure       | `Network`          |
//! | unparseable body or verdict  | `InvalidResponse`  |

use analysis_coordination::{
    AnalysisRequest, AnalysisResult, Analyzer, ExternalError, Priority, Recommendation,
    RequestContext, Specialty,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmEndpoint;

/// Per-file content budget in the prompt, in bytes.
const MAX_FILE_CHARS: usize = 12_000;
/// Error bodies are truncated to this many bytes.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// JSON verdict the specialist preamble asks for.
#[derive(Debug, Deserialize)]
struct Verdict {
    confidence_score: f64,
    priority: Priority,
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    recommendations: Vec<Recommendation>,
}

pub struct LlmAnalyzer {
    http: reqwest::Client,
    endpoint: LlmEndpoint,
    specialty: Specialty,
    agent_name: String,
    preamble: String,
}

impl std::fmt::Debug for LlmAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAnalyzer")
            .field("agent_name", &self.agent_name)
            .field("model", &self.endpoint.model)
            .finish_non_exhaustive()
    }
}

impl LlmAnalyzer {
    pub fn new(
        http: reqwest::Client,
        endpoint: LlmEndpoint,
        specialty: Specialty,
        agent_name: impl Into<String>,
        preamble: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            specialty,
            agent_name: agent_name.into(),
            preamble: preamble.into(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn complete(&self, prompt: &str) -> Result<String, ExternalError> {
        let body = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.preamble,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.endpoint.max_tokens,
            temperature: self.endpoint.temperature,
        };

        let mut request = self
            .http
            .post(self.endpoint.chat_completions_url())
            .timeout(self.endpoint.timeout)
            .json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExternalError::http(status.as_u16(), truncate(&text, MAX_ERROR_BODY)));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ExternalError::Timeout(e.to_string())
            } else {
                ExternalError::InvalidResponse(e.to_string())
            }
        })?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ExternalError::InvalidResponse("response contained no message".into()))
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &RequestContext,
    ) -> Result<AnalysisResult, ExternalError> {
        let prompt = build_prompt(request);
        debug!(
            request_id = %ctx.request_id(),
            agent = %self.agent_name,
            prompt_chars = prompt.len(),
            "Sending analysis prompt"
        );
        // Cancellation is enforced by the executor, which drops this future.
        let reply = self.complete(&prompt).await?;
        parse_analysis(&reply, &self.agent_name, self.specialty)
    }
}

fn transport_error(e: reqwest::Error) -> ExternalError {
    if e.is_timeout() {
        ExternalError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        ExternalError::Network(e.to_string())
    } else if let Some(status) = e.status() {
        ExternalError::http(status.as_u16(), e.to_string())
    } else {
        ExternalError::Other(e.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// User prompt: objective, then each file with its extracted metadata.
pub fn build_prompt(request: &AnalysisRequest) -> String {
    let mut prompt = format!(
        "Objective: {}\n\nAnalyze the following {} file(s) from the {} perspective.\n",
        request.objective.as_deref().unwrap_or("general modernization review"),
        request.files.len(),
        request.specialty,
    );
    for (file, meta) in request.files.iter().zip(&request.metadata) {
        let details = serde_json::to_string(&meta.details).unwrap_or_default();
        let content = truncate(&file.content, MAX_FILE_CHARS);
        let elided = if content.len() < file.content.len() {
            "\n... (truncated)"
        } else {
            ""
        };
        prompt.push_str(&format!(
            "\n=== {} ({}) {} ===\n{}{}\n",
            file.name,
            meta.language.as_deref().unwrap_or("unknown"),
            details,
            content,
            elided,
        ));
    }
    prompt
}

/// Parse the model's JSON verdict, tolerating markdown fences and prose
/// around the object.
pub fn parse_analysis(
    reply: &str,
    agent_name: &str,
    specialty: Specialty,
) -> Result<AnalysisResult, ExternalError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => {
            return Err(ExternalError::InvalidResponse(format!(
                "no JSON object in reply: {}",
                truncate(reply, 120)
            )))
        }
    };
    let verdict: Verdict = serde_json::from_str(json)
        .map_err(|e| ExternalError::InvalidResponse(format!("malformed verdict: {e}")))?;

    Ok(AnalysisResult {
        agent_name: agent_name.to_string(),
        specialty: specialty.as_str().to_string(),
        confidence_score: verdict.confidence_score.clamp(0.0, 100.0),
        priority: verdict.priority,
        findings: verdict.findings,
        recommendations: verdict.recommendations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_coordination::{FileMetadata, SourceFile};
    use chrono::Utc;

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here is my assessment:\n```json\n{\"confidence_score\": 104, \"priority\": \"critical\", \
                     \"findings\": [\"SQL built by concatenation\"], \
                     \"recommendations\": [{\"title\": \"Use prepared statements\", \"estimated_hours\": 6, \"priority\": \"HIGH\"}]}\n```";
        let result = parse_analysis(reply, "security-analyst", Specialty::Security).unwrap();
        assert_eq!(result.priority, Priority::Critical);
        assert_eq!(result.confidence_score, 100.0);
        assert_eq!(result.specialty, "security");
        assert_eq!(result.recommendations[0].estimated_hours, 6.0);
    }

    #[test]
    fn test_parse_rejects_prose_and_bad_priority() {
        assert!(matches!(
            parse_analysis("I could not decide.", "a", Specialty::Performance),
            Err(ExternalError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_analysis(r#"{"confidence_score": 50, "priority": "urgent"}"#, "a", Specialty::Performance),
            Err(ExternalError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_prompt_truncates_large_files() {
        let big = "x".repeat(MAX_FILE_CHARS + 10);
        let request = AnalysisRequest {
            specialty: Specialty::Architecture,
            objective: None,
            files: vec![SourceFile::new("Big.java", Utc::now(), big)],
            metadata: vec![FileMetadata::new("Big.java", Some("java".into()))],
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("=== Big.java (java)"));
        assert!(prompt.contains("(truncated)"));
        assert!(prompt.contains("general modernization review"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let endpoint = LlmEndpoint {
            url: "http://127.0.0.1:9/v1".into(),
            ..LlmEndpoint::from_lookup(|_| None)
        };
        let analyzer = LlmAnalyzer::new(
            reqwest::Client::new(),
            endpoint,
            Specialty::Security,
            "security-analyst",
            "preamble",
        );
        let err = analyzer.complete("hi").await.unwrap_err();
        assert!(
            matches!(err, ExternalError::Network(_) | ExternalError::Timeout(_)),
            "{err:?}"
        );
    }
}
