//! Anthropic native client implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy):
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - Response text assembled from `text` content blocks

use async_trait::async_trait;
use layerflow_core::error::ProviderError;
use layerflow_core::llm::LlmClient;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http_client;

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API client.
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    context_length: usize,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        context_length: usize,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            context_length,
            client: http_client()?,
        })
    }

    /// Use a custom base URL (e.g., for proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url
            .into()
            .trim_end_matches('/')
            .trim_end_matches("/v1")
            .to_string();
        self
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": DEFAULT_MAX_TOKENS,
            "temperature": 0.0,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);

        debug!(provider = "anthropic", model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if status != 200 {
            warn!(status, body = %body, "Anthropic API error");
            return Err(crate::status_error(status, body));
        }

        parse_messages_response(&body)
    }
}

/// Join all `text` blocks of a Messages API response.
fn parse_messages_response(body: &str) -> Result<String, ProviderError> {
    let api_resp: AnthropicResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::InvalidResponse(format!("Failed to parse Anthropic response: {e}"))
    })?;

    let text: Vec<String> = api_resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseContentBlock::Text { text } => Some(text),
            ResponseContentBlock::Other => None,
        })
        .collect();

    if text.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "Anthropic response contained no text blocks".into(),
        ));
    }
    Ok(text.join(""))
}

// --- Anthropic API types ---

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let c = AnthropicClient::new("sk-ant-test", "claude-sonnet-4", 200_000).unwrap();
        assert_eq!(c.provider(), "anthropic");
        assert_eq!(c.base_url, DEFAULT_BASE_URL);
        assert_eq!(c.model(), "claude-sonnet-4");
    }

    #[test]
    fn custom_base_url_strips_version_suffix() {
        let c = AnthropicClient::new("k", "m", 1)
            .unwrap()
            .with_base_url("https://proxy.local/v1/");
        assert_eq!(c.base_url, "https://proxy.local");
    }

    #[test]
    fn request_body_carries_max_tokens() {
        let c = AnthropicClient::new("k", "claude", 1).unwrap();
        let body = c.request_body("hello");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"][0]["content"], "hello");
    }

    #[test]
    fn parse_joins_text_blocks_and_skips_others() {
        let body = r#"{"id":"msg_1","model":"claude","content":[
            {"type":"thinking","thinking":"hmm"},
            {"type":"text","text":"Hello "},
            {"type":"text","text":"world"}
        ],"usage":{"input_tokens":1,"output_tokens":2}}"#;
        assert_eq!(parse_messages_response(body).unwrap(), "Hello world");
    }

    #[test]
    fn parse_without_text_fails() {
        let body = r#"{"content":[{"type":"tool_use","id":"t","name":"x","input":{}}]}"#;
        assert!(matches!(
            parse_messages_response(body),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}
