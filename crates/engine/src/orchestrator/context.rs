//! Run-scoped execution bookkeeping.
//!
//! The completed / failed / running sets are pairwise disjoint and their
//! union never exceeds `total_node_count`, which is fixed when the context is
//! built. A retry that changes the node count builds a fresh context through
//! [`ExecutionContext::carry_over`].

use layerflow_core::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::state::NodeStatus;

/// Outcome recorded for one node (or the direct answer).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Fragment {
    Completed { value: Value },
    Failed { error: String },
}

#[derive(Default)]
struct Inner {
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    running: BTreeSet<String>,
    logs: Vec<String>,
    fragments: BTreeMap<String, Fragment>,
}

pub struct ExecutionContext {
    total_node_count: usize,
    inner: Mutex<Inner>,
}

/// Serializable copy of an [`ExecutionContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionSnapshot {
    pub total_node_count: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub running: Vec<String>,
    pub logs: Vec<String>,
    pub fragments: BTreeMap<String, Fragment>,
}

impl ExecutionContext {
    pub fn new(total_node_count: usize) -> Self {
        Self {
            total_node_count,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A new context for a reshaped tree. Logs are kept, and so are the
    /// outcomes of the nodes in `keep`; everything else starts pending.
    pub fn carry_over(total_node_count: usize, from: &ExecutionContext, keep: &BTreeSet<String>) -> Self {
        let old = from.lock();
        let mut inner = Inner {
            logs: old.logs.clone(),
            ..Inner::default()
        };
        for id in keep {
            match old.fragments.get(id) {
                Some(fragment @ Fragment::Completed { .. }) if old.completed.contains(id) => {
                    inner.completed.insert(id.clone());
                    inner.fragments.insert(id.clone(), fragment.clone());
                }
                Some(fragment @ Fragment::Failed { .. }) if old.failed.contains(id) => {
                    inner.failed.insert(id.clone());
                    inner.fragments.insert(id.clone(), fragment.clone());
                }
                _ => {}
            }
        }
        drop(old);
        Self {
            total_node_count,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn total_node_count(&self) -> usize {
        self.total_node_count
    }

    /// Move a pending node to running. Returns `false` for a node that is
    /// already running or terminal.
    pub fn mark_running(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.completed.contains(id) || inner.failed.contains(id) || inner.running.contains(id) {
            return false;
        }
        inner.running.insert(id.to_string())
    }

    pub fn mark_completed(&self, id: &str, value: Value) {
        let mut inner = self.lock();
        inner.running.remove(id);
        inner.failed.remove(id);
        inner.completed.insert(id.to_string());
        inner
            .fragments
            .insert(id.to_string(), Fragment::Completed { value });
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) {
        let mut inner = self.lock();
        inner.running.remove(id);
        inner.completed.remove(id);
        inner.failed.insert(id.to_string());
        inner.fragments.insert(
            id.to_string(),
            Fragment::Failed {
                error: error.into(),
            },
        );
    }

    /// Record an outcome that is not tied to a tree node (the direct answer).
    pub fn record_fragment(&self, key: &str, fragment: Fragment) {
        self.lock().fragments.insert(key.to_string(), fragment);
    }

    /// Return nodes to pending, dropping their outcomes.
    pub fn reset<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        let mut inner = self.lock();
        for id in ids {
            inner.completed.remove(id);
            inner.failed.remove(id);
            inner.running.remove(id);
            inner.fragments.remove(id);
        }
    }

    pub fn status(&self, id: &str) -> NodeStatus {
        let inner = self.lock();
        if inner.completed.contains(id) {
            NodeStatus::Completed
        } else if inner.failed.contains(id) {
            NodeStatus::Failed
        } else if inner.running.contains(id) {
            NodeStatus::Running
        } else {
            NodeStatus::Pending
        }
    }

    /// Output of a completed node.
    pub fn value(&self, id: &str) -> Option<Value> {
        let inner = self.lock();
        if !inner.completed.contains(id) {
            return None;
        }
        match inner.fragments.get(id) {
            Some(Fragment::Completed { value }) => Some(value.clone()),
            _ => None,
        }
    }

    /// `(node id, error)` for every failed node, in id order.
    pub fn failures(&self) -> Vec<(String, String)> {
        let inner = self.lock();
        inner
            .failed
            .iter()
            .filter_map(|id| match inner.fragments.get(id) {
                Some(Fragment::Failed { error }) => Some((id.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(completed, failed, running)`
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.lock();
        (inner.completed.len(), inner.failed.len(), inner.running.len())
    }

    pub fn log(&self, line: impl Into<String>) {
        self.lock().logs.push(line.into());
    }

    pub fn logs(&self) -> Vec<String> {
        self.lock().logs.clone()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let inner = self.lock();
        ExecutionSnapshot {
            total_node_count: self.total_node_count,
            completed: inner.completed.iter().cloned().collect(),
            failed: inner.failed.iter().cloned().collect(),
            running: inner.running.iter().cloned().collect(),
            logs: inner.logs.clone(),
            fragments: inner.fragments.clone(),
        }
    }
}
