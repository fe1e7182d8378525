//! Run state snapshots and the broadcast channel that pushes them.
//!
//! Every node transition and phase change publishes a full
//! [`ExecutionState`]. Subscribers that fall behind skip ahead; the latest
//! state always supersedes older ones.

use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::history::RunStatus;

/// Per-node status, derived from the run's execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The tree shape with a status on every node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeView {
    pub id: String,
    pub layer: String,
    pub function: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeView>,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionState {
    pub id: String,
    pub query: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub running_nodes: usize,
    /// Evaluated attempts so far (0 before the first tree runs).
    pub attempt: u32,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree: Option<Vec<TreeView>>,
}

/// Broadcast channel for run states.
pub struct StateBus {
    sender: broadcast::Sender<Arc<ExecutionState>>,
}

impl StateBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all subscribers. No subscribers is fine.
    pub fn publish(&self, state: ExecutionState) {
        let _ = self.sender.send(Arc::new(state));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ExecutionState>> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream; lagged gaps are skipped silently.
    pub fn subscribe_stream(&self) -> impl Stream<Item = Arc<ExecutionState>> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| item.ok())
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new(256)
    }
}
