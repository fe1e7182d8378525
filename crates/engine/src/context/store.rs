//! Key/value context stores and their immutable snapshots.

use layerflow_core::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// A thread-safe mapping of context keys to values.
#[derive(Default)]
pub struct ContextStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    /// Drop every entry and install `entries` instead.
    pub fn replace_all(&self, entries: BTreeMap<String, Value>) {
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = entries;
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy. Later writes to the store do not show up in it.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            entries: Arc::new(self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }
}

/// Immutable view of a [`ContextStore`] at one moment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSnapshot {
    entries: Arc<BTreeMap<String, Value>>,
}

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `key: value` line per entry, in key order. Empty values are skipped.
    pub fn render_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}: {v}"))
            .collect()
    }
}
