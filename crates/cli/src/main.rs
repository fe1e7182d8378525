//! LayerFlow CLI — the main entry point.
//!
//! Commands:
//! - `init`    — Write a default config file
//! - `run`     — Plan and execute a query
//! - `layers`  — List the layers a plan can call
//! - `status`  — Show tiers, routing and orchestrator settings

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "layerflow",
    about = "LayerFlow — LLM-planned, tree-structured capability execution",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write ~/.layerflow/config.toml with defaults
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Plan and execute a query
    Run {
        /// The query to answer
        query: String,

        /// Request context entry (repeatable), e.g. -c projectRoot=/src/app
        #[arg(short = 'c', long = "context", value_parser = commands::run::parse_key_val)]
        context: Vec<(String, String)>,

        /// Print the full execution result as JSON
        #[arg(long)]
        json: bool,

        /// Don't stream progress to stderr
        #[arg(short, long)]
        quiet: bool,
    },

    /// List registered layers and their functions
    Layers,

    /// Show configuration and whether the tier setup is usable
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { force } => commands::init::run(force).await?,
        Commands::Run {
            query,
            context,
            json,
            quiet,
        } => commands::run::run(query, context, json, quiet).await?,
        Commands::Layers => commands::layers::run().await?,
        Commands::Status => commands::status::run().await?,
    }

    Ok(())
}
