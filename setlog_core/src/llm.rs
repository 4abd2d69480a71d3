//! LLM completion client.
//!
//! The pipeline treats the model as a black box `complete(prompt) -> text`
//! function and owns all response validation itself. Every call goes
//! through [`complete_with_timeout`], so no stage can hang on the network.
//!
//! [`OpenAiCompatibleClient`] talks to any endpoint implementing the
//! `chat/completions` API (OpenAI, Ollama, vLLM, LocalAI).

use crate::config::LlmConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Text-in, text-out completion service
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Run one completion under a deadline
pub async fn complete_with_timeout(
    client: &dyn LlmClient,
    prompt: &str,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, client.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(?timeout, "LLM call timed out");
            Err(Error::LlmTimeout(timeout))
        }
    }
}

/// Pull a JSON object out of model output and deserialize it.
///
/// Models often wrap JSON in markdown fences or add a sentence around it;
/// the outermost `{ ... }` span is taken. The error is a human-readable
/// description suitable for feeding back into a re-prompt.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> std::result::Result<T, String> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err("response did not contain a JSON object".to_string()),
    };
    serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))
}

// ============================================================================
// OpenAI-compatible HTTP client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// LLM client for any `OpenAI`-compatible chat completions endpoint
pub struct OpenAiCompatibleClient {
    client: Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    /// Build a client; the API key is read from the environment variable
    /// named by `config.api_key_env`.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Llm(format!("Failed to create HTTP client: {e}")))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut http_request = self.client.post(self.api_url()).json(&request);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::LlmTimeout(Duration::from_secs(self.config.timeout_secs))
            } else if e.is_connect() {
                Error::Llm(format!(
                    "Cannot connect to LLM at {}: {e}",
                    self.config.base_url
                ))
            } else {
                Error::Llm(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            tracing::error!(%status, "LLM endpoint returned an error");
            return Err(Error::Llm(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("Failed to parse response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Llm("API returned no choices".into()))?;

        tracing::debug!(chars = content.len(), model = %self.config.model, "LLM response received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("{}".into())
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let text = "Sure! Here it is:\n```json\n{\"ok\": true}\n```";
        assert_eq!(extract_json::<Verdict>(text), Ok(Verdict { ok: true }));
    }

    #[test]
    fn test_extract_json_reports_missing_object() {
        let err = extract_json::<Verdict>("I cannot help with that").unwrap_err();
        assert!(err.contains("JSON object"));
        let err = extract_json::<Verdict>("{\"ok\": \"maybe\"}").unwrap_err();
        assert!(err.starts_with("invalid JSON"));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_error() {
        let err = complete_with_timeout(&SlowLlm, "hi", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LlmTimeout(_)));
    }

    #[test]
    fn test_client_builds_url_without_double_slash() {
        let config = LlmConfig {
            base_url: "http://localhost:11434/v1/".into(),
            ..LlmConfig::default()
        };
        let client = OpenAiCompatibleClient::new(config).unwrap();
        assert_eq!(client.api_url(), "http://localhost:11434/v1/chat/completions");
    }
}
