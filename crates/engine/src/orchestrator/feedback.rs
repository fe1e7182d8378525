//! Result aggregation, evaluation, and applying retry strategies.

use layerflow_config::FailurePolicy;
use layerflow_core::{Error, Result, TaskKind, Value};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::tasks::LlmTasks;
use crate::plan::{ExecutionNode, ExecutionTree, PlanBuilder};
use crate::prompts::{self, Adjustment, ArgsChange, RetryAction, Verdict};

// --- Aggregation ---

/// Bottom-up result text: each completed node contributes its own output
/// followed by its completed children's text. Failed and pending nodes
/// contribute nothing.
pub(crate) fn aggregate(tree: &ExecutionTree, ctx: &ExecutionContext) -> String {
    join_lines(tree.roots().iter().filter_map(|root| node_text(root, ctx)))
}

fn node_text(node: &ExecutionNode, ctx: &ExecutionContext) -> Option<String> {
    let own = ctx.value(node.id())?.to_string();
    let children = node.children().iter().filter_map(|c| node_text(c, ctx));
    Some(join_lines(std::iter::once(own).chain(children)))
}

fn join_lines(parts: impl Iterator<Item = String>) -> String {
    parts
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Evaluation ---

/// Judge an attempt. Under the strict policy any failed node makes the
/// attempt insufficient without asking the evaluator.
pub(crate) async fn evaluate(
    policy: FailurePolicy,
    tasks: &LlmTasks<'_>,
    query: &str,
    result: &str,
    failures: &[(String, String)],
) -> Result<Verdict> {
    if policy == FailurePolicy::Strict && !failures.is_empty() {
        return Ok(Verdict::insufficient(format!(
            "{} node(s) failed: {}",
            failures.len(),
            failures
                .iter()
                .map(|(id, error)| format!("{id} ({error})"))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let body = prompts::evaluation(query, result, failures);
    match tasks.call(TaskKind::Evaluation, &body).await {
        Ok(text) => Ok(prompts::parse_verdict(&text)
            .unwrap_or_else(|| Verdict::insufficient("evaluator reply was not a verdict"))),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!(run_id = %tasks.run_id, error = %e, "Evaluation failed");
            Ok(Verdict::insufficient(format!("evaluation failed: {e}")))
        }
    }
}

// --- Retry ---

/// What to run next after a retry strategy was applied.
pub(crate) enum Applied {
    Retry {
        tree: ExecutionTree,
        ctx: Arc<ExecutionContext>,
    },
    Stop(String),
}

/// Apply a retry action to the current tree.
///
/// A replan swaps one subtree and carries every outcome it does not affect
/// into a new context. An adjustment keeps the context and returns the
/// adjusted node's dependents to pending. Later siblings in a sequential
/// group count as dependents. Only cancellation is an error here; anything unusable
/// stops the retry loop.
pub(crate) async fn apply(
    action: RetryAction,
    tree: &ExecutionTree,
    ctx: &Arc<ExecutionContext>,
    tasks: &LlmTasks<'_>,
    query: &str,
) -> Result<Applied> {
    match action {
        RetryAction::Stop { reason } => Ok(Applied::Stop(reason)),
        RetryAction::Replan { node_id, subtree } => Ok(replan(tree, ctx, &node_id, &subtree)),
        RetryAction::Adjust(adjustments) => adjust(adjustments, tree, ctx, tasks, query).await,
    }
}

/// Resolve every adjustment before touching the context, so a stop leaves
/// the recorded outcomes exactly as they ran.
async fn adjust(
    adjustments: Vec<Adjustment>,
    tree: &ExecutionTree,
    ctx: &Arc<ExecutionContext>,
    tasks: &LlmTasks<'_>,
    query: &str,
) -> Result<Applied> {
    let mut next = tree.clone();
    let mut reset = BTreeSet::new();
    for adjustment in &adjustments {
        let Some(node) = next.find(&adjustment.node_id) else {
            return Ok(Applied::Stop(format!(
                "adjustment names unknown node '{}'",
                adjustment.node_id
            )));
        };
        let args = match &adjustment.change {
            ArgsChange::Args(json) => json.clone(),
            ArgsChange::Instruction(instruction) => {
                match extract_args(tasks, query, node, instruction).await? {
                    Ok(json) => json,
                    Err(reason) => return Ok(Applied::Stop(reason)),
                }
            }
        };
        if !args.is_object() {
            return Ok(Applied::Stop(format!(
                "arguments for '{}' must be an object",
                adjustment.node_id
            )));
        }

        let (Some(dependents), Some(adjusted)) = (
            next.dependent_ids(&adjustment.node_id),
            next.with_args(&adjustment.node_id, Value::from_json(args)),
        ) else {
            return Ok(Applied::Stop(format!(
                "adjustment names unknown node '{}'",
                adjustment.node_id
            )));
        };
        reset.extend(dependents);
        next = adjusted;
    }

    ctx.reset(&reset);
    for adjustment in &adjustments {
        ctx.log(format!("Adjusted arguments of {}", adjustment.node_id));
        debug!(run_id = %tasks.run_id, node_id = %adjustment.node_id, "Adjusted node");
    }
    Ok(Applied::Retry {
        tree: next,
        ctx: Arc::clone(ctx),
    })
}

fn replan(tree: &ExecutionTree, ctx: &ExecutionContext, node_id: &str, subtree: &Json) -> Applied {
    let (Some((parent_path, index)), Some(old)) = (tree.location(node_id), tree.find(node_id)) else {
        return Applied::Stop(format!("replan names unknown node '{node_id}'"));
    };
    let replacement = match PlanBuilder::build_subtree(subtree, &parent_path, index) {
        Ok(node) => node,
        Err(e) => return Applied::Stop(format!("replacement subtree rejected: {e}")),
    };
    let Some(next) = tree.replace_subtree(node_id, replacement) else {
        return Applied::Stop(format!("replan names unknown node '{node_id}'"));
    };

    let Some(dependents) = tree.dependent_ids(node_id) else {
        return Applied::Stop(format!("replan names unknown node '{node_id}'"));
    };
    let replaced = old.node_count();
    let dropped: BTreeSet<String> = dependents.into_iter().collect();
    let keep: BTreeSet<String> = tree
        .ids()
        .into_iter()
        .filter(|id| !dropped.contains(id))
        .collect();
    let carried = ExecutionContext::carry_over(next.node_count(), ctx, &keep);
    carried.log(format!(
        "Replanned {node_id}: {replaced} node(s) replaced, tree now has {}",
        next.node_count()
    ));
    Applied::Retry {
        tree: next,
        ctx: Arc::new(carried),
    }
}

/// Turn a natural-language instruction into concrete arguments. The inner
/// `Err` is a reason to stop retrying.
async fn extract_args(
    tasks: &LlmTasks<'_>,
    query: &str,
    node: &ExecutionNode,
    instruction: &str,
) -> Result<std::result::Result<Json, String>> {
    let body = prompts::parameter_extraction(query, node, instruction);
    match tasks.call(TaskKind::ParameterExtraction, &body).await {
        Ok(text) => Ok(match prompts::extract_json(&text) {
            Some(json @ Json::Object(_)) => Ok(json),
            _ => Err(format!(
                "parameter extraction for '{}' did not produce an object",
                node.id()
            )),
        }),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => Ok(Err(format!("parameter extraction failed: {e}"))),
    }
}
