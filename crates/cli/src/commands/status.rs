//! `layerflow status` — Show configuration and whether it is usable.

use layerflow_config::{AppConfig, TierConfig};
use layerflow_core::{ComplexityTier, ModelSelectionStrategy, TaskKind};
use layerflow_providers::{TierRouting, TieredClientFactory, default_base_url};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    println!("LayerFlow Status");
    println!("================");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  LLM timeout:  {}s", config.llm.timeout_secs);

    println!("\n  Tiers:");
    for tier in ComplexityTier::ALL {
        println!("    {:<8} {}", tier.as_str(), describe_tier(config.llm.tier(tier)));
    }

    println!("\n  Routing:");
    let routing = TierRouting::from_config(&config.llm)?;
    for task in TaskKind::ALL {
        println!("    {:<26} {}", task.as_str(), routing.tier_for(task));
    }

    let orchestrator = &config.orchestrator;
    println!("\n  Orchestrator:");
    println!("    max_retries:                {}", orchestrator.max_retries);
    println!("    failure_policy:             {:?}", orchestrator.failure_policy);
    println!("    direct_answer:              {}", orchestrator.direct_answer);
    println!("    cancel_grace_ms:            {}", orchestrator.cancel_grace_ms);
    println!("    max_concurrent_invocations: {}", orchestrator.max_concurrent_invocations);
    println!("    history_capacity:           {}", orchestrator.history_capacity);
    println!("  Remote layers: {}", config.layers.len());

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file — run `layerflow init` first");
    }

    match TieredClientFactory::from_config(&config.llm) {
        Ok(_) => println!("  ✅ Tier configuration is usable"),
        Err(e) => println!("  ❌ {e}"),
    }

    Ok(())
}

/// One line per tier; the key itself is never shown.
fn describe_tier(tier: &TierConfig) -> String {
    let endpoint = tier
        .base_url
        .as_deref()
        .or_else(|| default_base_url(&tier.provider))
        .unwrap_or("(no endpoint)");
    let key = if tier.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        "key set"
    } else {
        "no key"
    };
    format!(
        "{}/{} ({} tokens, {endpoint}, {key})",
        tier.provider, tier.model, tier.context_length
    )
}
