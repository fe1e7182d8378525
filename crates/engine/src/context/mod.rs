//! Context composition for LLM prompts.
//!
//! - [`store`] — thread-safe key/value stores and immutable snapshots
//! - [`app_context`] — persistent vs. volatile context with server facts
//! - [`composer`] — prompt assembly with context-length trimming

pub mod app_context;
pub mod composer;
pub mod store;

pub use app_context::{
    AppContextService, CWD_KEY, FileRulesSource, PROJECT_ROOT_KEY, PROJECT_RULES_KEY, RulesSource,
};
pub use composer::{PromptComposer, estimate_tokens};
pub use store::{ContextSnapshot, ContextStore};
