//! The closed value type that flows between plans, layers and results.
//!
//! Planner output arrives as arbitrary JSON. It is converted into [`Value`]
//! exactly once, when the plan is built; from then on the engine only deals
//! with these four shapes.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Argument placeholder replaced by the parent node's output.
pub const PARENT_REF: &str = "$parent";

/// Argument placeholder replaced by the preceding sibling's output.
pub const PREV_REF: &str = "$prev";

/// A string, a number, an ordered list, or a string-keyed mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Str(String),
    Num(f64),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// An empty mapping, the default argument set.
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Build a `Str` value.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Convert untrusted JSON into a `Value`.
    ///
    /// Booleans become `"true"` / `"false"` and `null` becomes the empty
    /// string; numbers that do not fit an `f64` fall back to their text form.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Str(String::new()),
            serde_json::Value::Bool(b) => Self::Str(b.to_string()),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Self::Num(f),
                None => Self::Str(n.to_string()),
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON (for remote layers and serialized results).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Num(n) => {
                if is_integral(*n) {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view. Numeric strings such as `"42"` are accepted too.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Whether the value carries no content at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Str(s) => s.is_empty(),
            Self::Num(_) => false,
            Self::List(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }

    /// Replace `$parent` / `$prev` placeholders with upstream outputs.
    ///
    /// Placeholders with no corresponding upstream value are left untouched.
    pub fn resolve_refs(&self, parent: Option<&Value>, prev: Option<&Value>) -> Value {
        match self {
            Self::Str(s) if s == PARENT_REF => parent.cloned().unwrap_or_else(|| self.clone()),
            Self::Str(s) if s == PREV_REF => prev.cloned().unwrap_or_else(|| self.clone()),
            Self::List(items) => {
                Self::List(items.iter().map(|v| v.resolve_refs(parent, prev)).collect())
            }
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolve_refs(parent, prev)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn is_integral(n: f64) -> bool {
    n.fract() == 0.0 && n.abs() < 1e15
}

impl fmt::Display for Value {
    /// Text rendering used for result aggregation and prompts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Num(n) if is_integral(*n) => write!(f, "{}", *n as i64),
            Self::Num(n) => write!(f, "{n}"),
            Self::List(items) => {
                let lines: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", lines.join("\n"))
            }
            Self::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Num(n)
    }
}
