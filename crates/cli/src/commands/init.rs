//! `layerflow init` — First-time setup.

use layerflow_config::AppConfig;

pub async fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("LayerFlow — Setup");
    println!("=================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() && !force {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force.\n");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("✅ Wrote config.toml at: {}", config_path.display());
    println!("\n📝 Next steps:");
    println!("   1. Set LAYERFLOW_API_KEY (or OPENROUTER_API_KEY), or add api_key to each tier");
    println!("   2. Check the setup:  layerflow status");
    println!("   3. Try a query:      layerflow run \"what is 6 * 7, in words?\"");
    println!(
        "\n   Project rules are read from <projectRoot>/.layerflow/RULES.md when present.\n"
    );

    Ok(())
}
