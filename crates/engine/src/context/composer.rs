//! Prompt composition: persistent block + volatile block + task body.
//!
//! The task body is never trimmed. When the prompt would exceed the client's
//! context length, the persistent block gives way first, then the volatile one.

use std::sync::Arc;
use tracing::debug;

use super::app_context::AppContextService;
use super::store::ContextSnapshot;

const PERSISTENT_HEADING: &str = "## Project context";
const VOLATILE_HEADING: &str = "## Request context";
const SEPARATOR: &str = "\n\n";

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Builds prompts from the current application context.
pub struct PromptComposer {
    app_context: Arc<AppContextService>,
}

impl PromptComposer {
    pub fn new(app_context: Arc<AppContextService>) -> Self {
        Self { app_context }
    }

    pub fn app_context(&self) -> &AppContextService {
        &self.app_context
    }

    pub(crate) fn shared_app_context(&self) -> Arc<AppContextService> {
        Arc::clone(&self.app_context)
    }

    /// Compose a prompt for a client with `context_length` tokens.
    pub fn compose(&self, body: &str, context_length: usize) -> String {
        compose_blocks(
            &self.app_context.persistent(),
            &self.app_context.volatile(),
            body,
            context_length,
        )
    }
}

/// Compose from explicit snapshots.
pub fn compose_blocks(
    persistent: &ContextSnapshot,
    volatile: &ContextSnapshot,
    body: &str,
    context_length: usize,
) -> String {
    let mut persistent_block = render_block(PERSISTENT_HEADING, persistent);
    let mut volatile_block = render_block(VOLATILE_HEADING, volatile);

    let total = |p: &str, v: &str| estimate_tokens(&join_non_empty(&[p, v, body]));

    if total(&persistent_block, &volatile_block) > context_length {
        let others = total("", &volatile_block);
        persistent_block = fit_block(&persistent_block, context_length.saturating_sub(others));
        debug!(context_length, "Trimmed persistent context block");
    }
    if total(&persistent_block, &volatile_block) > context_length {
        let others = total(&persistent_block, "");
        volatile_block = fit_block(&volatile_block, context_length.saturating_sub(others));
        debug!(context_length, "Trimmed volatile context block");
    }

    join_non_empty(&[&persistent_block, &volatile_block, body])
}

fn render_block(heading: &str, snapshot: &ContextSnapshot) -> String {
    let lines = snapshot.render_lines();
    if lines.is_empty() {
        return String::new();
    }
    format!("{heading}\n{}", lines.join("\n"))
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Keep leading lines of `block` within `budget` tokens (separator included).
/// A block reduced to its heading is dropped.
fn fit_block(block: &str, budget: usize) -> String {
    let separator_cost = estimate_tokens(SEPARATOR);
    let mut kept: Vec<&str> = Vec::new();
    for line in block.lines() {
        kept.push(line);
        if estimate_tokens(&kept.join("\n")) + separator_cost > budget {
            kept.pop();
            break;
        }
    }
    if kept.len() <= 1 {
        return String::new();
    }
    kept.join("\n")
}
