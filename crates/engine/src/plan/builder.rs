//! Plan construction: planner output → [`ExecutionTree`].
//!
//! Untrusted JSON is validated and converted to [`Value`] here, once. Node ids
//! are derived from `(parent id, layer, function, sibling index)` with SHA-256,
//! so identical plans always get identical ids and repeated siblings never
//! collide.

use layerflow_core::{Error, Result, Value};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::tree::{ExecutionNode, ExecutionTree};
use crate::prompts::extract_json;

const LAYER_KEYS: &[&str] = &["layer", "layerName", "layer_name"];
const FUNCTION_KEYS: &[&str] = &["function", "fn"];
const ARGS_KEYS: &[&str] = &["args", "arguments"];

/// Deterministic node id: `n-` followed by 16 hex chars.
pub fn node_id(parent_path: &str, layer: &str, function: &str, index: usize) -> String {
    let index = index.to_string();
    let mut hasher = Sha256::new();
    for part in [parent_path, layer, function, index.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    format!("n-{}", hex::encode(&digest[..8]))
}

pub struct PlanBuilder;

impl PlanBuilder {
    /// Parse raw planner text (fenced or bare JSON) into a tree.
    pub fn from_llm_output(text: &str) -> Result<ExecutionTree> {
        let json = extract_json(text)
            .ok_or_else(|| malformed("planner output contains no JSON plan"))?;
        Self::from_json(&json)
    }

    /// Build a tree from a root object, a list of roots, or a
    /// `{"roots": [...]}` / `{"plan": ...}` wrapper.
    pub fn from_json(json: &Json) -> Result<ExecutionTree> {
        let roots_json = root_list(json)?;
        if roots_json.is_empty() {
            return Err(malformed("plan has no roots"));
        }

        let roots = roots_json
            .iter()
            .enumerate()
            .map(|(index, node)| build_node(node, "", index))
            .collect::<Result<Vec<_>>>()?;

        let tree = ExecutionTree::new(roots);
        let mut seen = HashSet::new();
        if let Some(dup) = tree.ids().into_iter().find(|id| !seen.insert(id.clone())) {
            return Err(malformed(format!("duplicate node id {dup}")));
        }
        Ok(tree)
    }

    /// Build a replacement for the node at (`parent_path`, `index`). The new
    /// subtree's ids are derived from the same position, so the rest of the
    /// tree keeps its ids.
    pub fn build_subtree(json: &Json, parent_path: &str, index: usize) -> Result<ExecutionNode> {
        let node = match json {
            Json::Object(map) if map.contains_key("subtree") => &map["subtree"],
            other => other,
        };
        build_node(node, parent_path, index)
    }
}

fn malformed(message: impl Into<String>) -> Error {
    Error::MalformedPlan(message.into())
}

fn root_list(json: &Json) -> Result<Vec<Json>> {
    match json {
        Json::Array(items) => Ok(items.clone()),
        Json::Object(map) => {
            if let Some(roots) = map.get("roots") {
                return match roots {
                    Json::Array(items) => Ok(items.clone()),
                    _ => Err(malformed("'roots' must be an array")),
                };
            }
            if let Some(plan) = map.get("plan") {
                return root_list(plan);
            }
            Ok(vec![json.clone()])
        }
        _ => Err(malformed("plan must be an object or an array")),
    }
}

fn field<'a>(map: &'a Map<String, Json>, keys: &[&str]) -> Option<&'a Json> {
    keys.iter().find_map(|k| map.get(*k))
}

fn required_str(map: &Map<String, Json>, keys: &[&str], what: &str) -> Result<String> {
    match field(map, keys) {
        Some(Json::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Json::String(_)) | None => Err(malformed(format!("node is missing '{what}'"))),
        Some(other) => Err(malformed(format!("'{what}' must be a string, got {other}"))),
    }
}

fn build_node(json: &Json, parent_path: &str, index: usize) -> Result<ExecutionNode> {
    let map = json
        .as_object()
        .ok_or_else(|| malformed(format!("plan node must be an object, got {json}")))?;

    let layer = required_str(map, LAYER_KEYS, "layer")?;
    let function = required_str(map, FUNCTION_KEYS, "function")?;

    let args = match field(map, ARGS_KEYS) {
        None | Some(Json::Null) => Value::empty_map(),
        Some(obj @ Json::Object(_)) => Value::from_json(obj.clone()),
        Some(other) => {
            return Err(malformed(format!(
                "args of {layer}.{function} must be an object, got {other}"
            )));
        }
    };

    let parallel = match map.get("parallel") {
        Some(Json::Bool(b)) => *b,
        Some(Json::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };

    let id = node_id(parent_path, &layer, &function, index);

    let children = match map.get("children") {
        None | Some(Json::Null) => Vec::new(),
        Some(Json::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, child)| build_node(child, &id, i))
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(malformed(format!("children must be an array, got {other}")));
        }
    };

    Ok(ExecutionNode::new(id, layer, function, args, children, parallel))
}
