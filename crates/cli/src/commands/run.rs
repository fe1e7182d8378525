//! `layerflow run` — Plan and execute one query.

use layerflow_config::AppConfig;
use layerflow_core::Value;
use layerflow_engine::context::PROJECT_ROOT_KEY;
use layerflow_engine::{ExecutionState, Orchestrator, RunStatus};
use layerflow_providers::TieredClientFactory;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run(
    query: String,
    context: Vec<(String, String)>,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let factory = TieredClientFactory::from_config(&config.llm)?;

    let registry = Arc::new(layerflow_layers::default_registry());
    layerflow_layers::register_remote_layers(&registry, &config.layers)?;

    let orchestrator = Orchestrator::from_config(&config, registry, Arc::new(factory));
    let cwd = std::env::current_dir().ok().map(|p| p.display().to_string());
    let request = request_context(context, cwd);

    let progress = (!quiet).then(|| tokio::spawn(print_progress(orchestrator.subscribe())));

    let result = tokio::select! {
        result = orchestrator.execute(query, request) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n  Interrupted, cancelling...");
            orchestrator.cancel_current();
            orchestrator.shutdown().await;
            return Err("Run cancelled".into());
        }
    };
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    match result.error {
        None => {
            println!("{}", result.result);
            Ok(())
        }
        Some(error) => {
            if !result.result.is_empty() {
                eprintln!("  Partial result:");
                println!("{}", result.result);
            }
            Err(error.into())
        }
    }
}

/// Parse a `key=value` context entry.
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Build the request context. The working directory stands in for
/// `projectRoot` unless one was given.
fn request_context(entries: Vec<(String, String)>, cwd: Option<String>) -> BTreeMap<String, Value> {
    let mut context: BTreeMap<String, Value> = entries
        .into_iter()
        .map(|(k, v)| (k, Value::text(v)))
        .collect();
    if let Some(cwd) = cwd {
        context
            .entry(PROJECT_ROOT_KEY.to_string())
            .or_insert_with(|| Value::text(cwd));
    }
    context
}

async fn print_progress(mut states: broadcast::Receiver<Arc<ExecutionState>>) {
    let mut previous: Option<Arc<ExecutionState>> = None;
    loop {
        match states.recv().await {
            Ok(state) => {
                for line in progress_lines(previous.as_deref(), &state) {
                    eprintln!("{line}");
                }
                if state.status != RunStatus::Running {
                    break;
                }
                previous = Some(state);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// What changed between two states of the same run.
fn progress_lines(previous: Option<&ExecutionState>, state: &ExecutionState) -> Vec<String> {
    let mut lines = Vec::new();
    let seen_logs = previous
        .filter(|p| p.id == state.id)
        .map_or(0, |p| p.logs.len().min(state.logs.len()));
    for log in &state.logs[seen_logs..] {
        lines.push(format!("  · {log}"));
    }

    let counts = |s: &ExecutionState| (s.completed_nodes, s.failed_nodes, s.running_nodes, s.total_nodes);
    if previous.map(counts) != Some(counts(state)) && state.total_nodes > 0 {
        lines.push(format!(
            "  [attempt {}] {}/{} completed, {} failed, {} running",
            state.attempt.max(1),
            state.completed_nodes,
            state.total_nodes,
            state.failed_nodes,
            state.running_nodes
        ));
    }

    if state.status != RunStatus::Running {
        lines.push(format!("  Run {}", state.status));
    }
    lines
}
