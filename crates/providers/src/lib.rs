//! LLM client implementations for LayerFlow.
//!
//! All clients implement the `layerflow_core::LlmClient` trait.
//! The [`TieredClientFactory`] picks the client for a task from the tier
//! configuration and wraps every call in the shared timeout.

pub mod anthropic;
pub mod factory;
pub mod openai_compat;

pub use anthropic::AnthropicClient;
pub use factory::{TierRouting, TieredClientFactory, TimeoutClient, default_base_url};
pub use openai_compat::OpenAiCompatClient;

use layerflow_core::error::ProviderError;

/// Build the HTTP client for one call.
pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Network(format!("Failed to create HTTP client: {e}")))
}

/// Map a non-200 status to the matching provider error.
pub(crate) fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: 5,
        },
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        _ => ProviderError::Api {
            status_code: status,
            message: body,
        },
    }
}
