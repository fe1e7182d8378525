//! Plan model and construction.

pub mod builder;
pub mod tree;

pub use builder::{PlanBuilder, node_id};
pub use tree::{ExecutionNode, ExecutionTree};
