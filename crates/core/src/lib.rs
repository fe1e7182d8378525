//! # LayerFlow Core
//!
//! Domain types, traits, and error definitions for the LayerFlow execution
//! engine. This crate has **no runtime dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator of the engine is a trait here:
//! - [`Layer`] for invocable capabilities
//! - [`LlmClient`] / [`LlmClientFactory`] for model backends
//! - [`ModelSelectionStrategy`] for tier routing
//!
//! Implementations live in their respective crates, so the engine can be
//! tested against scripted stand-ins.

pub mod error;
pub mod layer;
pub mod llm;
pub mod value;

// Re-export key types at crate root for ergonomics
pub use error::{Error, LayerError, ProviderError, Result};
pub use layer::{Layer, LayerDescriptor, LayerRegistry};
pub use llm::{ComplexityTier, LlmClient, LlmClientFactory, ModelSelectionStrategy, TaskKind};
pub use value::Value;
