//! Tree traversal against the layer registry.
//!
//! A node is invoked only after its parent completed. Parallel children are
//! all issued before any is awaited; sequential children run one subtree at a
//! time, each seeing the previous sibling's output as `$prev`. A failed node's
//! children never start. Completed nodes from an earlier attempt are not
//! invoked again, but their children are visited.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use layerflow_core::{LayerError, LayerRegistry, Value};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use crate::plan::{ExecutionNode, ExecutionTree};
use crate::state::NodeStatus;

pub(crate) struct Scheduler<'a> {
    pub registry: &'a LayerRegistry,
    pub ctx: &'a ExecutionContext,
    pub cancel: &'a CancellationToken,
    /// How long an in-flight call may keep running after cancellation.
    pub grace: Duration,
    pub permits: Option<&'a Semaphore>,
    pub run_id: &'a str,
    pub on_change: &'a (dyn Fn() + Send + Sync),
}

impl Scheduler<'_> {
    /// Run every root concurrently until nothing is left to start.
    pub async fn run_tree(&self, tree: &ExecutionTree) {
        join_all(
            tree.roots()
                .iter()
                .map(|root| self.run_node(root, None, None)),
        )
        .await;
    }

    /// Run a node and its subtree. Resolves to the node's output when it
    /// completed (now or in an earlier attempt).
    fn run_node<'s>(
        &'s self,
        node: &'s ExecutionNode,
        parent: Option<Value>,
        prev: Option<Value>,
    ) -> BoxFuture<'s, Option<Value>> {
        async move {
            let output = match self.ctx.status(node.id()) {
                NodeStatus::Completed => self.ctx.value(node.id())?,
                NodeStatus::Failed | NodeStatus::Running => return None,
                NodeStatus::Pending => {
                    self.invoke_node(node, parent.as_ref(), prev.as_ref())
                        .await?
                }
            };
            self.run_children(node, &output).await;
            Some(output)
        }
        .boxed()
    }

    async fn run_children(&self, node: &ExecutionNode, output: &Value) {
        let children = node.children();
        if children.is_empty() {
            return;
        }

        if node.is_parallel() {
            join_all(
                children
                    .iter()
                    .map(|child| self.run_node(child, Some(output.clone()), None)),
            )
            .await;
        } else {
            let mut prev = None;
            for child in children {
                if self.cancel.is_cancelled() {
                    break;
                }
                prev = self.run_node(child, Some(output.clone()), prev).await;
            }
        }
    }

    async fn invoke_node(
        &self,
        node: &ExecutionNode,
        parent: Option<&Value>,
        prev: Option<&Value>,
    ) -> Option<Value> {
        let _permit = match self.permits {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    permit = semaphore.acquire() => permit.ok(),
                    _ = self.cancel.cancelled() => None,
                };
                Some(acquired?)
            }
            None => None,
        };

        if self.cancel.is_cancelled() || !self.ctx.mark_running(node.id()) {
            return None;
        }
        (self.on_change)();

        let args = node.args().resolve_refs(parent, prev);
        debug!(
            run_id = %self.run_id,
            node_id = %node.id(),
            layer = %node.layer_name(),
            function = %node.function(),
            "Invoking layer"
        );

        let outcome = match self.call_with_grace(node, args).await {
            Ok(value) => {
                self.ctx.log(format!(
                    "{} {}.{} completed",
                    node.id(),
                    node.layer_name(),
                    node.function()
                ));
                self.ctx.mark_completed(node.id(), value.clone());
                Some(value)
            }
            Err(e) => {
                warn!(
                    run_id = %self.run_id,
                    node_id = %node.id(),
                    layer = %node.layer_name(),
                    error = %e,
                    "Node failed"
                );
                self.ctx.log(format!(
                    "{} {}.{} failed: {e}",
                    node.id(),
                    node.layer_name(),
                    node.function()
                ));
                self.ctx.mark_failed(node.id(), e.to_string());
                None
            }
        };
        (self.on_change)();
        outcome
    }

    /// Invoke the layer; on cancellation, wait up to `grace` before abandoning.
    async fn call_with_grace(&self, node: &ExecutionNode, args: Value) -> Result<Value, LayerError> {
        let call = self
            .registry
            .invoke(node.layer_name(), node.function(), args);
        tokio::pin!(call);

        tokio::select! {
            result = &mut call => result,
            _ = self.cancel.cancelled() => {
                match tokio::time::timeout(self.grace, &mut call).await {
                    Ok(result) => result,
                    Err(_) => Err(LayerError::Abandoned {
                        layer: node.layer_name().to_string(),
                        function: node.function().to_string(),
                        grace_ms: self.grace.as_millis() as u64,
                    }),
                }
            }
        }
    }
}
