//! Configuration loading, validation, and management for LayerFlow.
//!
//! Loads configuration from `~/.layerflow/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use layerflow_core::llm::{ComplexityTier, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.layerflow/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM tiers, timeout and task routing
    #[serde(default)]
    pub llm: LlmConfig,

    /// Execution engine settings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Prompt context settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Remote HTTP layers registered at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<RemoteLayerConfig>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Timeout applied to every LLM call, whatever the tier
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_simple_tier")]
    pub simple: TierConfig,

    #[serde(default = "default_medium_tier")]
    pub medium: TierConfig,

    #[serde(default = "default_complex_tier")]
    pub complex: TierConfig,

    /// Per-task tier overrides, e.g. `plan_creation = "complex"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing: BTreeMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_simple_tier() -> TierConfig {
    TierConfig::new("openrouter", "openai/gpt-4o-mini", 16_000)
}
fn default_medium_tier() -> TierConfig {
    TierConfig::new("openrouter", "openai/gpt-4o", 64_000)
}
fn default_complex_tier() -> TierConfig {
    TierConfig::new("openrouter", "anthropic/claude-sonnet-4", 200_000)
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            simple: default_simple_tier(),
            medium: default_medium_tier(),
            complex: default_complex_tier(),
            routing: BTreeMap::new(),
        }
    }
}

impl LlmConfig {
    /// The configuration of one tier.
    pub fn tier(&self, tier: ComplexityTier) -> &TierConfig {
        match tier {
            ComplexityTier::Simple => &self.simple,
            ComplexityTier::Medium => &self.medium,
            ComplexityTier::Complex => &self.complex,
        }
    }

    fn tier_mut(&mut self, tier: ComplexityTier) -> &mut TierConfig {
        match tier {
            ComplexityTier::Simple => &mut self.simple,
            ComplexityTier::Medium => &mut self.medium,
            ComplexityTier::Complex => &mut self.complex,
        }
    }

    /// Parsed routing overrides.
    pub fn routing_overrides(&self) -> Result<BTreeMap<TaskKind, ComplexityTier>, ConfigError> {
        self.routing
            .iter()
            .map(|(task, tier)| {
                let task: TaskKind = task.parse().map_err(ConfigError::ValidationError)?;
                let tier: ComplexityTier = tier.parse().map_err(ConfigError::ValidationError)?;
                Ok((task, tier))
            })
            .collect()
    }
}

/// One complexity tier: which provider and model answer its tasks.
#[derive(Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Provider identity (e.g. "openai", "anthropic", "ollama")
    pub provider: String,

    /// Model id sent to the provider
    pub model: String,

    /// Context-length budget in tokens
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Override the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_context_length() -> usize {
    32_000
}

impl TierConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, context_length: usize) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            context_length,
            base_url: None,
            api_key: None,
        }
    }
}

impl std::fmt::Debug for TierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("context_length", &self.context_length)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

/// What to do when some nodes of an otherwise finished tree failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any unresolved failed node makes the attempt insufficient.
    #[default]
    Strict,
    /// Only the evaluator's verdict counts.
    Evaluator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How many retry strategies a run may apply after its first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Finished runs kept in memory (oldest evicted first)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Grace period for in-flight layer calls after cancellation
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Try to answer without planning first
    #[serde(default = "default_true")]
    pub direct_answer: bool,

    /// Upper bound on concurrent layer invocations per run (0 = unbounded)
    #[serde(default = "default_max_concurrent_invocations")]
    pub max_concurrent_invocations: usize,
}

fn default_max_retries() -> u32 {
    2
}
fn default_history_capacity() -> usize {
    50
}
fn default_cancel_grace_ms() -> u64 {
    2_000
}
fn default_max_concurrent_invocations() -> usize {
    32
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            history_capacity: default_history_capacity(),
            cancel_grace_ms: default_cancel_grace_ms(),
            failure_policy: FailurePolicy::default(),
            direct_answer: true,
            max_concurrent_invocations: default_max_concurrent_invocations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Directory under the project root holding rule files
    #[serde(default = "default_rules_dir")]
    pub rules_dir: String,

    #[serde(default = "default_rules_file")]
    pub rules_file: String,
}

fn default_rules_dir() -> String {
    ".layerflow".into()
}
fn default_rules_file() -> String {
    "RULES.md".into()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            rules_file: default_rules_file(),
        }
    }
}

/// A remote layer reachable over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLayerConfig {
    /// Name the planner uses to address the layer
    pub name: String,

    /// Endpoint receiving `POST {"function", "args"}`
    pub url: String,

    #[serde(default = "default_layer_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<String>,
}

fn default_layer_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from the default path (~/.layerflow/config.toml).
    ///
    /// Also checks environment variables:
    /// - `LAYERFLOW_API_KEY` / `OPENROUTER_API_KEY` fill tiers without a key
    /// - `LAYERFLOW_<TIER>_PROVIDER`, `LAYERFLOW_<TIER>_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let shared_key = lookup("LAYERFLOW_API_KEY").or_else(|| lookup("OPENROUTER_API_KEY"));

        for tier in ComplexityTier::ALL {
            let prefix = format!("LAYERFLOW_{}", tier.as_str().to_ascii_uppercase());
            let tier_config = self.llm.tier_mut(tier);

            if let Some(provider) = lookup(&format!("{prefix}_PROVIDER")) {
                tier_config.provider = provider;
            }
            if let Some(model) = lookup(&format!("{prefix}_MODEL")) {
                tier_config.model = model;
            }
            if tier_config.api_key.is_none() {
                tier_config.api_key = shared_key.clone();
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".layerflow")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "llm.timeout_secs must be > 0".into(),
            ));
        }

        for tier in ComplexityTier::ALL {
            let tc = self.llm.tier(tier);
            if tc.provider.trim().is_empty() || tc.model.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "llm.{tier}: provider and model must be set"
                )));
            }
            if tc.context_length == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "llm.{tier}.context_length must be > 0"
                )));
            }
        }

        self.llm.routing_overrides()?;

        if self.orchestrator.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.history_capacity must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for layer in &self.layers {
            if layer.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("layer name must not be empty".into()));
            }
            if !layer.url.starts_with("http://") && !layer.url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "layer '{}': url must start with http:// or https://",
                    layer.name
                )));
            }
            if !seen.insert(layer.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "layer '{}' is configured twice",
                    layer.name
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for layerflow_core::Error {
    fn from(e: ConfigError) -> Self {
        layerflow_core::Error::config(e.to_string())
    }
}
