//! Error types for the LayerFlow domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Errors are split by blast radius: [`LayerError`] stays inside one node's
//! subtree, [`ProviderError`] belongs to a single LLM task, and the variants of
//! [`Error`] itself terminate a run or the process.

use thiserror::Error;

/// The top-level error type for all LayerFlow operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Plan errors ---
    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    // --- Layer errors ---
    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),

    // --- LLM errors ---
    #[error("LLM error: {0}")]
    Provider(#[from] ProviderError),

    // --- Run-level errors ---
    #[error("Retry budget exhausted after {attempts} attempt(s): {verdict}")]
    RetryBudgetExhausted { attempts: u32, verdict: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("A run is already in progress: {0}")]
    Busy(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of a single LLM call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {after_secs}s: {task}")]
    Timeout { task: String, after_secs: u64 },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Failures of a single layer invocation. Always contained to one node.
#[derive(Debug, Clone, Error)]
pub enum LayerError {
    #[error("Layer not found: {0}")]
    NotFound(String),

    #[error("Layer '{layer}' has no function '{function}'")]
    UnknownFunction { layer: String, function: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invocation failed: {layer}.{function}: {reason}")]
    InvocationFailed {
        layer: String,
        function: String,
        reason: String,
    },

    #[error("Invocation abandoned after {grace_ms}ms grace period: {layer}.{function}")]
    Abandoned {
        layer: String,
        function: String,
        grace_ms: u64,
    },
}
