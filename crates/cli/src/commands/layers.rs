//! `layerflow layers` — List the layers a plan can call.

use layerflow_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let registry = layerflow_layers::default_registry();
    let remote = layerflow_layers::register_remote_layers(&registry, &config.layers)?;

    println!("Registered layers ({} local, {remote} remote)", registry.len() - remote);
    println!("=================");
    for layer in registry.describe() {
        println!("\n  {}", layer.name);
        if !layer.description.is_empty() {
            println!("    {}", layer.description);
        }
        if !layer.functions.is_empty() {
            println!("    functions: {}", layer.functions.join(", "));
        }
    }
    println!();

    Ok(())
}
