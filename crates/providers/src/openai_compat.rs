//! OpenAI-compatible client implementation.
//!
//! Works with: OpenAI, OpenRouter, DeepSeek, Groq, Together AI, Fireworks AI,
//! Ollama, vLLM, llama.cpp, and any OpenAI-compatible endpoint.
//!
//! Only non-streaming chat completions are used: the engine sends one prompt
//! and consumes one text answer per task.

use async_trait::async_trait;
use layerflow_core::error::ProviderError;
use layerflow_core::llm::LlmClient;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http_client;

/// A single-use client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    provider: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    context_length: usize,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a new OpenAI-compatible client.
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        context_length: usize,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            provider: provider.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            context_length,
            client: http_client()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.0,
            "stream": false,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(provider = %self.provider, model = %self.model, "Sending completion request");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if status != 200 {
            warn!(provider = %self.provider, status, body = %body, "Provider returned error");
            return Err(crate::status_error(status, body));
        }

        parse_completion(&body)
    }
}

/// Extract the first choice's text from a chat-completions response body.
fn parse_completion(body: &str) -> Result<String, ProviderError> {
    let api_response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

    Ok(choice.message.content.unwrap_or_default())
}

// --- OpenAI API response types ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}
