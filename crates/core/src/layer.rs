//! Layer trait — the abstraction over invocable capabilities.
//!
//! A layer is a named provider of functions (local code or a remote HTTP
//! endpoint). The orchestrator only ever sees the [`Layer::invoke`] contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::LayerError;
use crate::value::Value;

/// A summary of a layer, sent to the planner so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// The registered name
    pub name: String,

    /// What the layer does
    pub description: String,

    /// Function names the layer accepts (empty = not advertised)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<String>,
}

/// The core Layer trait.
#[async_trait]
pub trait Layer: Send + Sync {
    /// A description of what this layer does (sent to the planner).
    fn description(&self) -> &str {
        ""
    }

    /// The functions this layer exposes.
    fn functions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoke `function` with `args`.
    async fn invoke(&self, function: &str, args: Value) -> std::result::Result<Value, LayerError>;
}

/// The process-wide registry of available layers.
///
/// Lookups take a read lock just long enough to clone the `Arc`; the lock is
/// never held while a layer runs.
pub struct LayerRegistry {
    layers: RwLock<HashMap<String, Arc<dyn Layer>>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self {
            layers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a layer. Replaces any existing layer with the same name.
    pub fn register(&self, name: impl Into<String>, layer: Arc<dyn Layer>) {
        let name = name.into();
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        if layers.insert(name.clone(), layer).is_some() {
            debug!(layer = %name, "Replaced existing layer registration");
        }
    }

    /// Get a layer by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Layer>> {
        self.layers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Whether a layer with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Invoke a function on a named layer.
    pub async fn invoke(
        &self,
        name: &str,
        function: &str,
        args: Value,
    ) -> std::result::Result<Value, LayerError> {
        let layer = self
            .get(name)
            .ok_or_else(|| LayerError::NotFound(name.to_string()))?;
        layer.invoke(function, args).await
    }

    /// Descriptors of all registered layers, sorted by name.
    pub fn describe(&self) -> Vec<LayerDescriptor> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        let mut descriptors: Vec<LayerDescriptor> = layers
            .iter()
            .map(|(name, layer)| LayerDescriptor {
                name: name.clone(),
                description: layer.description().to_string(),
                functions: layer.functions(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// List all registered layer names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .layers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.layers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
