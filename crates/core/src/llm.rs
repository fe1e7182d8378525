//! LLM abstractions — task kinds, complexity tiers and the client traits.
//!
//! The engine never talks to a provider directly. It names the *kind* of task
//! it wants done, a [`ModelSelectionStrategy`] maps that to a
//! [`ComplexityTier`], and an [`LlmClientFactory`] hands back a fresh
//! [`LlmClient`] configured for that tier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProviderError;

/// The three independently configured model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 3] = [Self::Simple, Self::Medium, Self::Complex];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            other => Err(format!("unknown complexity tier '{other}'")),
        }
    }
}

/// Named categories of LLM work the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PlanCreation,
    Evaluation,
    RetryStrategy,
    ParameterExtraction,
    DirectAnswerCheck,
    DirectAnswerGeneration,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        Self::PlanCreation,
        Self::Evaluation,
        Self::RetryStrategy,
        Self::ParameterExtraction,
        Self::DirectAnswerCheck,
        Self::DirectAnswerGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanCreation => "plan_creation",
            Self::Evaluation => "evaluation",
            Self::RetryStrategy => "retry_strategy",
            Self::ParameterExtraction => "parameter_extraction",
            Self::DirectAnswerCheck => "direct_answer_check",
            Self::DirectAnswerGeneration => "direct_answer_generation",
        }
    }

    /// The tier a task runs on when nothing overrides it.
    pub fn default_tier(&self) -> ComplexityTier {
        match self {
            Self::DirectAnswerCheck | Self::ParameterExtraction => ComplexityTier::Simple,
            Self::PlanCreation | Self::Evaluation | Self::DirectAnswerGeneration => {
                ComplexityTier::Medium
            }
            Self::RetryStrategy => ComplexityTier::Complex,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown task kind '{s}'"))
    }
}

/// Maps task kinds onto complexity tiers.
pub trait ModelSelectionStrategy: Send + Sync {
    fn tier_for(&self, task: TaskKind) -> ComplexityTier;
}

/// A single-use LLM client bound to one tier's provider and model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider identity (e.g. "openai", "anthropic").
    fn provider(&self) -> &str;

    /// Model id sent to the provider.
    fn model(&self) -> &str;

    /// Context-length budget in tokens.
    fn context_length(&self) -> usize;

    /// Send a prompt, get the completion text back.
    async fn complete(&self, prompt: &str) -> std::result::Result<String, ProviderError>;
}

/// Creates a new client for every call.
///
/// Implementations must fail here, at creation time, for an unusable tier
/// configuration rather than deferring the failure to `complete`.
pub trait LlmClientFactory: Send + Sync {
    fn create(&self, task: TaskKind) -> crate::Result<Box<dyn LlmClient>>;
}
