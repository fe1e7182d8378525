//! Task prompt bodies and parsers for the answers they produce.
//!
//! Bodies are plain text; the [`PromptComposer`](crate::context::PromptComposer)
//! prepends context blocks. Parsers are lenient about surrounding prose and
//! code fences but strict about the fields they need.

use layerflow_core::LayerDescriptor;
use serde_json::Value as Json;

use crate::plan::{ExecutionNode, ExecutionTree};

// --- Bodies ---

fn render_layers(layers: &[LayerDescriptor]) -> String {
    if layers.is_empty() {
        return "(no layers registered)".into();
    }
    layers
        .iter()
        .map(|l| {
            let mut line = format!("- {}", l.name);
            if !l.description.is_empty() {
                line.push_str(&format!(": {}", l.description));
            }
            if !l.functions.is_empty() {
                line.push_str(&format!(" (functions: {})", l.functions.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, error)| format!("- {id}: {error}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn direct_answer_check(query: &str, layers: &[LayerDescriptor]) -> String {
    format!(
        "Decide whether the query below can be answered directly from general knowledge, \
         without calling any of the available layers.\n\n\
         Available layers:\n{}\n\nQuery: {query}\n\n\
         Reply with exactly YES or NO.",
        render_layers(layers)
    )
}

pub fn direct_answer(query: &str) -> String {
    format!("Answer the query below concisely and accurately.\n\nQuery: {query}")
}

pub fn plan_creation(query: &str, layers: &[LayerDescriptor]) -> String {
    format!(
        "Plan how to answer the query by calling layers. Respond with JSON only.\n\n\
         Available layers:\n{}\n\n\
         Format: a list of root nodes. Each node is\n\
         {{\"layer\": \"<name>\", \"function\": \"<function>\", \"args\": {{...}}, \
         \"parallel\": false, \"children\": [...]}}\n\
         Children run after their parent succeeds, concurrently when \"parallel\" is true, \
         otherwise in order. An argument value \"$parent\" is replaced by the parent's output \
         and \"$prev\" by the previous sibling's output.\n\n\
         Query: {query}",
        render_layers(layers)
    )
}

pub fn evaluation(query: &str, result: &str, failures: &[(String, String)]) -> String {
    let mut body = format!(
        "Judge whether the result below fully answers the query.\n\n\
         Query: {query}\n\nResult:\n{}\n",
        if result.is_empty() { "(empty)" } else { result }
    );
    if !failures.is_empty() {
        body.push_str(&format!("\nFailed steps:\n{}\n", render_failures(failures)));
    }
    body.push_str("\nRespond with JSON only: {\"sufficient\": true|false, \"reason\": \"...\"}");
    body
}

pub fn retry_strategy(
    query: &str,
    tree: &ExecutionTree,
    result: &str,
    reason: &str,
    failures: &[(String, String)],
) -> String {
    let tree_json = serde_json::to_string_pretty(tree).unwrap_or_default();
    let mut body = format!(
        "A plan was executed but its result was judged insufficient.\n\n\
         Query: {query}\n\nReason: {reason}\n\nCurrent plan (node ids included):\n{tree_json}\n\n\
         Result so far:\n{}\n",
        if result.is_empty() { "(empty)" } else { result }
    );
    if !failures.is_empty() {
        body.push_str(&format!("\nFailed steps:\n{}\n", render_failures(failures)));
    }
    body.push_str(
        "\nChoose one action and respond with JSON only:\n\
         {\"action\": \"replan\", \"node_id\": \"<id>\", \"subtree\": {<node>}}\n\
         {\"action\": \"adjust\", \"adjustments\": [{\"node_id\": \"<id>\", \"args\": {...}}]}\n\
         {\"action\": \"adjust\", \"adjustments\": [{\"node_id\": \"<id>\", \"instruction\": \"...\"}]}\n\
         {\"action\": \"none\", \"reason\": \"...\"}",
    );
    body
}

pub fn parameter_extraction(query: &str, node: &ExecutionNode, instruction: &str) -> String {
    format!(
        "Produce new arguments for one step of a plan.\n\n\
         Query: {query}\nStep: {}.{}\nCurrent args: {}\nInstruction: {instruction}\n\n\
         Respond with the new args as a JSON object only.",
        node.layer_name(),
        node.function(),
        node.args().to_json()
    )
}

// --- Parsers ---

/// Find the JSON payload in LLM output: the whole text, a fenced block, or
/// the first balanced `{...}` / `[...]` span that parses.
pub fn extract_json(text: &str) -> Option<Json> {
    let trimmed = text.trim();
    if let Ok(json @ (Json::Object(_) | Json::Array(_))) = serde_json::from_str::<Json>(trimmed) {
        return Some(json);
    }

    let mut rest = trimmed;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let Some(end) = body.find("```") else { break };
        if let Ok(json) = serde_json::from_str::<Json>(body[..end].trim()) {
            return Some(json);
        }
        rest = &body[end + 3..];
    }

    let bytes = trimmed.as_bytes();
    let mut from = 0;
    while let Some(offset) = trimmed[from..].find(['{', '[']) {
        let start = from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            if let Ok(json) = serde_json::from_str::<Json>(&trimmed[start..=end]) {
                return Some(json);
            }
        }
        from = start + 1;
    }
    None
}

/// Index of the bracket closing the one at `start`, honoring JSON strings.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Whether a YES/NO answer says yes.
pub fn parse_yes_no(text: &str) -> bool {
    let word: String = text
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .chars()
        .take_while(|c| c.is_alphanumeric())
        .collect();
    word.eq_ignore_ascii_case("yes")
}

/// The evaluator's judgement of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub sufficient: bool,
    pub reason: String,
}

impl Verdict {
    pub fn insufficient(reason: impl Into<String>) -> Self {
        Self {
            sufficient: false,
            reason: reason.into(),
        }
    }
}

pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let json = extract_json(text)?;
    let sufficient = match json.get("sufficient")? {
        Json::Bool(b) => *b,
        Json::String(s) if s.eq_ignore_ascii_case("true") => true,
        Json::String(s) if s.eq_ignore_ascii_case("false") => false,
        _ => return None,
    };
    let reason = json
        .get("reason")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string();
    Some(Verdict { sufficient, reason })
}

/// New arguments for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgsChange {
    /// Concrete replacement arguments (a JSON object).
    Args(Json),
    /// Natural-language instruction, resolved by a parameter-extraction call.
    Instruction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub node_id: String,
    pub change: ArgsChange,
}

/// What the retry strategist wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    Replan { node_id: String, subtree: Json },
    Adjust(Vec<Adjustment>),
    Stop { reason: String },
}

fn node_id_of(json: &Json) -> Option<String> {
    json.get("node_id")
        .or_else(|| json.get("nodeId"))
        .and_then(Json::as_str)
        .map(str::to_string)
}

/// Parse a retry strategy. Anything unusable becomes [`RetryAction::Stop`].
pub fn parse_retry_action(text: &str) -> RetryAction {
    let Some(json) = extract_json(text) else {
        return RetryAction::Stop {
            reason: "retry strategy was not valid JSON".into(),
        };
    };

    let action = json
        .get("action")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase();

    match action.as_str() {
        "replan" => match (node_id_of(&json), json.get("subtree")) {
            (Some(node_id), Some(subtree @ Json::Object(_))) => RetryAction::Replan {
                node_id,
                subtree: subtree.clone(),
            },
            _ => RetryAction::Stop {
                reason: "replan action is missing node_id or subtree".into(),
            },
        },
        "adjust" => {
            let adjustments: Vec<Adjustment> = json
                .get("adjustments")
                .and_then(Json::as_array)
                .map(|items| items.iter().filter_map(parse_adjustment).collect())
                .unwrap_or_default();
            if adjustments.is_empty() {
                RetryAction::Stop {
                    reason: "adjust action has no usable adjustments".into(),
                }
            } else {
                RetryAction::Adjust(adjustments)
            }
        }
        "none" => RetryAction::Stop {
            reason: json
                .get("reason")
                .and_then(Json::as_str)
                .unwrap_or("no further action proposed")
                .to_string(),
        },
        other => RetryAction::Stop {
            reason: format!("unknown retry action '{other}'"),
        },
    }
}

fn parse_adjustment(json: &Json) -> Option<Adjustment> {
    let node_id = node_id_of(json)?;
    let change = match (json.get("args"), json.get("instruction")) {
        (Some(args @ Json::Object(_)), _) => ArgsChange::Args(args.clone()),
        (_, Some(Json::String(instruction))) if !instruction.trim().is_empty() => {
            ArgsChange::Instruction(instruction.clone())
        }
        _ => return None,
    };
    Some(Adjustment { node_id, change })
}
