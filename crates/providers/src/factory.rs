//! Tiered client factory: task kind → tier → freshly built client.
//!
//! Every tier is checked when the factory is built, so a bad provider name or
//! a missing cloud API key stops the process at startup instead of surfacing
//! halfway through a run.

use async_trait::async_trait;
use layerflow_config::{LlmConfig, TierConfig};
use layerflow_core::error::ProviderError;
use layerflow_core::llm::{
    ComplexityTier, LlmClient, LlmClientFactory, ModelSelectionStrategy, TaskKind,
};
use layerflow_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::anthropic::AnthropicClient;
use crate::openai_compat::OpenAiCompatClient;

/// Cloud providers that refuse to run without an API key.
pub const KEYED_PROVIDERS: &[&str] = &[
    "openai",
    "openrouter",
    "deepseek",
    "groq",
    "together",
    "fireworks",
    "anthropic",
];

/// Self-hosted providers; a key is sent only if configured.
pub const LOCAL_PROVIDERS: &[&str] = &["ollama", "vllm", "llamacpp", "custom"];

/// Get the default base URL for well-known providers.
///
/// `custom` has none and must be given `base_url` explicitly.
pub fn default_base_url(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some(crate::anthropic::DEFAULT_BASE_URL),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "together" => Some("https://api.together.xyz/v1"),
        "fireworks" => Some("https://api.fireworks.ai/inference/v1"),
        "ollama" => Some("http://localhost:11434/v1"),
        "vllm" => Some("http://localhost:8000/v1"),
        "llamacpp" => Some("http://localhost:8080/v1"),
        _ => None,
    }
}

// --- Routing ---

/// Default task routing plus per-task overrides.
#[derive(Debug, Clone, Default)]
pub struct TierRouting {
    overrides: BTreeMap<TaskKind, ComplexityTier>,
}

impl TierRouting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, task: TaskKind, tier: ComplexityTier) -> Self {
        self.overrides.insert(task, tier);
        self
    }

    /// Build from the `[llm.routing]` table.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            overrides: config.routing_overrides()?,
        })
    }
}

impl ModelSelectionStrategy for TierRouting {
    fn tier_for(&self, task: TaskKind) -> ComplexityTier {
        self.overrides
            .get(&task)
            .copied()
            .unwrap_or_else(|| task.default_tier())
    }
}

// --- Factory ---

/// Creates a new, timeout-wrapped client for every LLM task.
pub struct TieredClientFactory {
    config: LlmConfig,
    routing: Arc<dyn ModelSelectionStrategy>,
}

impl TieredClientFactory {
    /// Build from config, using `[llm.routing]` for task routing.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let routing = TierRouting::from_config(config)?;
        Self::new(config.clone(), Arc::new(routing))
    }

    /// Build with an explicit routing strategy. Fails on any unusable tier.
    pub fn new(config: LlmConfig, routing: Arc<dyn ModelSelectionStrategy>) -> Result<Self> {
        if config.timeout_secs == 0 {
            return Err(Error::config("llm.timeout_secs must be > 0"));
        }
        for tier in ComplexityTier::ALL {
            check_tier(tier, config.tier(tier))?;
        }
        Ok(Self { config, routing })
    }

    pub fn routing(&self) -> &dyn ModelSelectionStrategy {
        self.routing.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    /// A raw client for a tier, without the timeout wrapper.
    pub fn client_for_tier(&self, tier: ComplexityTier) -> Result<Box<dyn LlmClient>> {
        build_client(tier, self.config.tier(tier))
    }
}

impl LlmClientFactory for TieredClientFactory {
    fn create(&self, task: TaskKind) -> Result<Box<dyn LlmClient>> {
        let tier = self.routing.tier_for(task);
        let inner = self.client_for_tier(tier)?;
        debug!(
            task = %task,
            tier = %tier,
            provider = %inner.provider(),
            model = %inner.model(),
            "Created LLM client"
        );
        Ok(Box::new(TimeoutClient::new(inner, task, self.timeout())))
    }
}

/// Check that a tier could produce a client.
fn check_tier(tier: ComplexityTier, tc: &TierConfig) -> Result<()> {
    let provider = tc.provider.as_str();
    let keyed = KEYED_PROVIDERS.contains(&provider);

    if !keyed && !LOCAL_PROVIDERS.contains(&provider) {
        return Err(Error::config(format!(
            "llm.{tier}: unsupported provider '{provider}'"
        )));
    }
    if keyed && tc.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
        return Err(Error::config(format!(
            "llm.{tier}: provider '{provider}' requires an API key \
             (set llm.{tier}.api_key or LAYERFLOW_API_KEY)"
        )));
    }
    if provider == "custom" && tc.base_url.is_none() {
        return Err(Error::config(format!(
            "llm.{tier}: provider 'custom' requires base_url"
        )));
    }
    Ok(())
}

fn build_client(tier: ComplexityTier, tc: &TierConfig) -> Result<Box<dyn LlmClient>> {
    check_tier(tier, tc)?;

    if tc.provider == "anthropic" {
        let mut client =
            AnthropicClient::new(tc.api_key.clone().unwrap_or_default(), &tc.model, tc.context_length)?;
        if let Some(url) = &tc.base_url {
            client = client.with_base_url(url);
        }
        return Ok(Box::new(client));
    }

    let base_url = match (&tc.base_url, default_base_url(&tc.provider)) {
        (Some(url), _) => url.clone(),
        (None, Some(url)) => url.to_string(),
        (None, None) => {
            return Err(Error::config(format!(
                "llm.{tier}: no base_url for provider '{}'",
                tc.provider
            )));
        }
    };

    Ok(Box::new(OpenAiCompatClient::new(
        &tc.provider,
        base_url,
        tc.api_key.clone(),
        &tc.model,
        tc.context_length,
    )?))
}

// --- Timeout wrapper ---

/// Applies the shared LLM timeout to a client's calls.
pub struct TimeoutClient {
    inner: Box<dyn LlmClient>,
    task: TaskKind,
    timeout: Duration,
}

impl TimeoutClient {
    pub fn new(inner: Box<dyn LlmClient>, task: TaskKind, timeout: Duration) -> Self {
        Self {
            inner,
            task,
            timeout,
        }
    }
}

#[async_trait]
impl LlmClient for TimeoutClient {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_length(&self) -> usize {
        self.inner.context_length()
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, ProviderError> {
        tokio::time::timeout(self.timeout, self.inner.complete(prompt))
            .await
            .map_err(|_| ProviderError::Timeout {
                task: self.task.to_string(),
                after_secs: self.timeout.as_secs(),
            })?
    }
}
