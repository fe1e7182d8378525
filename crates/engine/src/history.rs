//! Bounded in-memory history of finished runs.
//!
//! The store is append-only from the orchestrator's side and evicts the
//! oldest entry once `capacity` is reached. Nothing is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::orchestrator::context::ExecutionSnapshot;
use crate::plan::ExecutionTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        })
    }
}

/// What a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Aggregated result text (partial when the run failed).
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub context: ExecutionSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<ExecutionTree>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One finished (or, while current, in-flight) run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHistory {
    pub id: String,
    pub query: String,
    pub result: ExecutionResult,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
}

pub struct ExecutionHistoryStore {
    capacity: usize,
    entries: RwLock<VecDeque<ExecutionHistory>>,
}

impl ExecutionHistoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, entry: ExecutionHistory) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` entries, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionHistory> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ExecutionHistory> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
