//! # LayerFlow Engine
//!
//! Turns a natural-language query into an execution tree of layer calls,
//! runs it, and iterates until an evaluator is satisfied or the retry budget
//! runs out.
//!
//! - [`plan`] — planner output to an immutable [`ExecutionTree`] with stable ids
//! - [`orchestrator`] — scheduling, evaluation, retry, cancellation
//! - [`context`] — persistent / volatile prompt context
//! - [`prompts`] — task bodies and reply parsers
//! - [`state`] / [`history`] — live run snapshots and finished runs

pub mod context;
pub mod history;
pub mod orchestrator;
pub mod plan;
pub mod prompts;
pub mod state;

#[cfg(test)]
mod test_helpers;

pub use context::{AppContextService, FileRulesSource, PromptComposer, RulesSource};
pub use history::{ExecutionHistory, ExecutionHistoryStore, ExecutionResult, RunStatus};
pub use orchestrator::{
    DIRECT_ANSWER_KEY, ExecutionContext, ExecutionSnapshot, Fragment, Orchestrator,
    OrchestratorSettings,
};
pub use plan::{ExecutionNode, ExecutionTree, PlanBuilder};
pub use state::{ExecutionState, NodeStatus, StateBus, TreeView};
