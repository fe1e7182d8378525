//! Built-in layer implementations for LayerFlow.
//!
//! Layers are what a plan's nodes call: echo text back, do math,
//! transform strings, or forward the call to a remote HTTP endpoint.

pub mod echo;
pub mod math;
pub mod remote;
pub mod text;

use layerflow_config::RemoteLayerConfig;
use layerflow_core::{LayerError, LayerRegistry, Value};
use std::sync::Arc;
use tracing::info;

pub use remote::RemoteLayer;

/// Create a registry holding all built-in local layers.
pub fn default_registry() -> LayerRegistry {
    let registry = LayerRegistry::new();
    registry.register("echo", Arc::new(echo::EchoLayer));
    registry.register("math", Arc::new(math::MathLayer));
    registry.register("text", Arc::new(text::TextLayer));
    registry
}

/// Register every configured remote layer. Returns how many were added.
pub fn register_remote_layers(
    registry: &LayerRegistry,
    configs: &[RemoteLayerConfig],
) -> layerflow_core::Result<usize> {
    for config in configs {
        let layer = RemoteLayer::from_config(config)?;
        info!(layer = %config.name, url = %config.url, "Registered remote layer");
        registry.register(config.name.clone(), Arc::new(layer));
    }
    Ok(configs.len())
}

// --- Argument helpers shared by the local layers ---

/// A required argument rendered as text.
pub(crate) fn text_arg(args: &Value, key: &str) -> Result<String, LayerError> {
    args.get(key)
        .map(|v| v.to_string())
        .ok_or_else(|| LayerError::InvalidArguments(format!("Missing '{key}' argument")))
}

/// A required numeric argument.
pub(crate) fn num_arg(args: &Value, key: &str) -> Result<f64, LayerError> {
    let value = args
        .get(key)
        .ok_or_else(|| LayerError::InvalidArguments(format!("Missing '{key}' argument")))?;
    value
        .as_f64()
        .ok_or_else(|| LayerError::InvalidArguments(format!("'{key}' must be a number, got '{value}'")))
}

pub(crate) fn unknown(layer: &str, function: &str) -> LayerError {
    LayerError::UnknownFunction {
        layer: layer.into(),
        function: function.into(),
    }
}
