//! The execution tree: parent-owned nodes with path-derived ids.
//!
//! Trees are immutable. Retry edits ([`ExecutionTree::replace_subtree`],
//! [`ExecutionTree::with_args`]) return a new tree and leave ids outside the
//! edited subtree untouched.

use layerflow_core::Value;
use serde::Serialize;

use crate::state::{NodeStatus, TreeView};

/// One layer invocation plus the work that depends on its output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionNode {
    id: String,
    #[serde(rename = "layer")]
    layer_name: String,
    function: String,
    args: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<ExecutionNode>,
    parallel: bool,
}

impl ExecutionNode {
    pub(crate) fn new(
        id: String,
        layer_name: String,
        function: String,
        args: Value,
        children: Vec<ExecutionNode>,
        parallel: bool,
    ) -> Self {
        Self {
            id,
            layer_name,
            function,
            args,
            children,
            parallel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn children(&self) -> &[ExecutionNode] {
        &self.children
    }

    /// Whether children run concurrently (otherwise strictly in order).
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Nodes in this subtree, including this one.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ExecutionNode::node_count).sum::<usize>()
    }

    pub fn find(&self, id: &str) -> Option<&ExecutionNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    fn collect_ids(&self, out: &mut Vec<String>) {
        out.push(self.id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Ids in this subtree, pre-order.
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    /// Rebuild this subtree with `target` swapped out by `edit`.
    fn edited(&self, target: &str, edit: &dyn Fn(&ExecutionNode) -> ExecutionNode) -> ExecutionNode {
        if self.id == target {
            return edit(self);
        }
        ExecutionNode {
            children: self
                .children
                .iter()
                .map(|c| c.edited(target, edit))
                .collect(),
            ..self.clone()
        }
    }

    fn view(&self, status: &dyn Fn(&str) -> NodeStatus) -> TreeView {
        TreeView {
            id: self.id.clone(),
            layer: self.layer_name.clone(),
            function: self.function.clone(),
            status: status(&self.id),
            children: self.children.iter().map(|c| c.view(status)).collect(),
        }
    }
}

/// Ordered list of root nodes. All roots start together.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionTree {
    roots: Vec<ExecutionNode>,
}

impl ExecutionTree {
    pub(crate) fn new(roots: Vec<ExecutionNode>) -> Self {
        Self { roots }
    }

    /// A tree with no nodes (used by direct answers).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> &[ExecutionNode] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.roots.iter().map(ExecutionNode::node_count).sum()
    }

    /// Every id, pre-order, roots in order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for root in &self.roots {
            root.collect_ids(&mut ids);
        }
        ids
    }

    pub fn find(&self, id: &str) -> Option<&ExecutionNode> {
        self.roots.iter().find_map(|r| r.find(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// The parent path and sibling index of a node (`""` for roots).
    pub fn location(&self, id: &str) -> Option<(String, usize)> {
        if let Some(index) = self.roots.iter().position(|r| r.id == id) {
            return Some((String::new(), index));
        }
        fn search(node: &ExecutionNode, id: &str) -> Option<(String, usize)> {
            if let Some(index) = node.children.iter().position(|c| c.id == id) {
                return Some((node.id.clone(), index));
            }
            node.children.iter().find_map(|c| search(c, id))
        }
        self.roots.iter().find_map(|r| search(r, id))
    }

    /// Ids whose outcome depends on node `id`: its own subtree, plus the
    /// subtrees of the siblings after it when its group is sequential
    /// (they may read it through `$prev`).
    pub fn dependent_ids(&self, id: &str) -> Option<Vec<String>> {
        let (parent_path, index) = self.location(id)?;
        let mut ids = Vec::new();
        match self.find(&parent_path) {
            Some(parent) if !parent.parallel => {
                for sibling in &parent.children[index..] {
                    sibling.collect_ids(&mut ids);
                }
            }
            _ => self.find(id)?.collect_ids(&mut ids),
        }
        Some(ids)
    }

    /// A copy of this tree with node `id` replaced by `replacement`.
    pub fn replace_subtree(&self, id: &str, replacement: ExecutionNode) -> Option<ExecutionTree> {
        self.find(id)?;
        Some(self.edit(id, &|_| replacement.clone()))
    }

    /// A copy of this tree with new arguments on node `id`.
    pub fn with_args(&self, id: &str, args: Value) -> Option<ExecutionTree> {
        self.find(id)?;
        Some(self.edit(id, &|node| ExecutionNode {
            args: args.clone(),
            ..node.clone()
        }))
    }

    fn edit(&self, id: &str, edit: &dyn Fn(&ExecutionNode) -> ExecutionNode) -> ExecutionTree {
        ExecutionTree {
            roots: self.roots.iter().map(|r| r.edited(id, edit)).collect(),
        }
    }

    /// Mirror of the tree annotated with per-node status.
    pub fn view(&self, status: &dyn Fn(&str) -> NodeStatus) -> Vec<TreeView> {
        self.roots.iter().map(|r| r.view(status)).collect()
    }
}
