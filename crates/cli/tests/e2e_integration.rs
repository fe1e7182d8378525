//! End-to-end tests for the LayerFlow pipeline.
//!
//! These wire the real built-in layers, configuration and orchestrator
//! together; only the LLM is scripted.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use layerflow_config::{AppConfig, FailurePolicy};
use layerflow_core::{Error, LlmClient, LlmClientFactory, ProviderError, TaskKind, Value};
use layerflow_engine::{Orchestrator, PlanBuilder, RunStatus};
use layerflow_providers::TieredClientFactory;

// ── Scripted LLM ─────────────────────────────────────────────────────────

/// Pops one reply per call, per task kind.
struct ScriptedFactory {
    replies: Mutex<BTreeMap<TaskKind, VecDeque<String>>>,
    calls: Mutex<Vec<TaskKind>>,
    prompts: Arc<Mutex<Vec<(TaskKind, String)>>>,
}

impl ScriptedFactory {
    fn new(script: &[(TaskKind, &str)]) -> Self {
        let mut replies: BTreeMap<TaskKind, VecDeque<String>> = BTreeMap::new();
        for (task, reply) in script {
            replies.entry(*task).or_default().push_back(reply.to_string());
        }
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self, task: TaskKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| **t == task).count()
    }

    fn prompts(&self, task: TaskKind) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl LlmClientFactory for ScriptedFactory {
    fn create(&self, task: TaskKind) -> layerflow_core::Result<Box<dyn LlmClient>> {
        self.calls.lock().unwrap().push(task);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front);
        Ok(Box::new(ScriptedClient {
            task,
            reply,
            prompts: Arc::clone(&self.prompts),
        }))
    }
}

struct ScriptedClient {
    task: TaskKind,
    reply: Option<String>,
    prompts: Arc<Mutex<Vec<(TaskKind, String)>>>,
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    fn provider(&self) -> &str {
        "e2e_mock"
    }

    fn model(&self) -> &str {
        "e2e-model"
    }

    fn context_length(&self) -> usize {
        16_000
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts
            .lock()
            .unwrap()
            .push((self.task, prompt.to_string()));
        self.reply
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse("script exhausted".into()))
    }
}

const SUFFICIENT: &str = r#"{"sufficient": true, "reason": "answers the query"}"#;

fn orchestrator(config: &AppConfig, factory: Arc<ScriptedFactory>) -> Orchestrator {
    let registry = Arc::new(layerflow_layers::default_registry());
    Orchestrator::from_config(config, registry, factory)
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.direct_answer = false;
    config
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn math_result_flows_into_text_child() {
    let plan = r#"```json
    [{"layer": "math", "function": "evaluate", "args": {"expression": "6 * 7"},
      "children": [{"layer": "text", "function": "concat",
                    "args": {"parts": ["answer: ", "$parent"]}}]}]
    ```"#;
    let factory = Arc::new(ScriptedFactory::new(&[
        (TaskKind::PlanCreation, plan),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config(), factory.clone());

    let result = orch.execute("what is 6 * 7?", BTreeMap::new()).await.unwrap();
    assert!(result.succeeded(), "{:?}", result.error);
    assert_eq!(result.result, "42\nanswer: 42");
    assert_eq!(result.context.total_node_count, 2);
    assert_eq!(factory.calls(TaskKind::Evaluation), 1);
}

#[tokio::test]
async fn sequential_pipeline_uses_previous_output() {
    let plan = r#"{"roots": [
        {"layer": "echo", "function": "say", "args": {"text": "start"},
         "children": [
            {"layer": "text", "function": "upper", "args": {"text": "hello"}},
            {"layer": "text", "function": "length", "args": {"text": "$prev"}}
         ]}
    ]}"#;
    let factory = Arc::new(ScriptedFactory::new(&[
        (TaskKind::PlanCreation, plan),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config(), factory);

    let result = orch.execute("shout hello and count", BTreeMap::new()).await.unwrap();
    assert_eq!(result.result, "start\nHELLO\n5");
}

#[test]
fn identical_plans_produce_identical_ids() {
    let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "a"},
                    "parallel": true,
                    "children": [{"layer": "echo", "function": "say", "args": {"text": "b"}},
                                 {"layer": "echo", "function": "say", "args": {"text": "c"}}]}]"#;
    let first = PlanBuilder::from_llm_output(plan).unwrap();
    let second = PlanBuilder::from_llm_output(plan).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.ids().len(), 3);
    assert_eq!(first.node_count(), 3);
}

#[tokio::test]
async fn failed_math_is_replanned_and_recovers() {
    let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "header"}},
                   {"layer": "math", "function": "evaluate", "args": {"expression": "1 / 0"}}]"#;
    let broken_id = PlanBuilder::from_llm_output(plan).unwrap().roots()[1]
        .id()
        .to_string();
    let strategy = format!(
        r#"{{"action": "adjust", "adjustments": [{{"node_id": "{broken_id}", "args": {{"expression": "1 / 4"}}}}]}}"#
    );
    let factory = Arc::new(ScriptedFactory::new(&[
        (TaskKind::PlanCreation, plan),
        (TaskKind::RetryStrategy, &strategy),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config(), factory.clone());

    let result = orch.execute("header and a quarter", BTreeMap::new()).await.unwrap();
    assert!(result.succeeded(), "{:?}", result.error);
    assert_eq!(result.result, "header\n0.25");
    assert_eq!(factory.calls(TaskKind::RetryStrategy), 1);

    let history = orch.history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Completed);
}

#[tokio::test]
async fn evaluator_policy_from_config_accepts_partial_results() {
    let mut config = config();
    config.orchestrator.failure_policy = FailurePolicy::Evaluator;
    let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "ok"}},
                   {"layer": "weather", "function": "today"}]"#;
    let factory = Arc::new(ScriptedFactory::new(&[
        (TaskKind::PlanCreation, plan),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config, factory);

    let result = orch.execute("q", BTreeMap::new()).await.unwrap();
    assert!(result.succeeded());
    assert_eq!(result.result, "ok");
    assert_eq!(result.context.failed.len(), 1);
}

#[tokio::test]
async fn direct_answer_from_default_config() {
    let factory = Arc::new(ScriptedFactory::new(&[
        (TaskKind::DirectAnswerCheck, "Yes."),
        (TaskKind::DirectAnswerGeneration, "Blue."),
    ]));
    let orch = orchestrator(&AppConfig::default(), factory.clone());

    let result = orch.execute("what color is the sky?", BTreeMap::new()).await.unwrap();
    assert_eq!(result.result, "Blue.");
    assert_eq!(factory.calls(TaskKind::PlanCreation), 0);
    assert_eq!(
        result.context.fragments.get(layerflow_engine::DIRECT_ANSWER_KEY),
        Some(&layerflow_engine::Fragment::Completed {
            value: Value::text("Blue.")
        })
    );
}

#[tokio::test]
async fn execution_result_serializes_for_json_output() {
    let factory = Arc::new(ScriptedFactory::new(&[
        (
            TaskKind::PlanCreation,
            r#"[{"layer": "echo", "function": "say", "args": {"text": "hi"}}]"#,
        ),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config(), factory);

    let result = orch.execute("say hi", BTreeMap::new()).await.unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["result"], "hi");
    assert_eq!(json["context"]["total_node_count"], 1);
    assert!(json.get("error").is_none());
    assert_eq!(json["tree"]["roots"][0]["layer"], "echo");
}

#[tokio::test]
async fn config_file_and_project_rules_shape_the_prompts() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        "[orchestrator]\ndirect_answer = false\nmax_retries = 0\n",
    )
    .unwrap();
    let config = AppConfig::load_from(&config_path).unwrap();
    assert_eq!(config.orchestrator.max_retries, 0);

    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join(".layerflow")).unwrap();
    std::fs::write(project.join(".layerflow").join("RULES.md"), "Numbers in words.").unwrap();

    let factory = Arc::new(ScriptedFactory::new(&[
        (
            TaskKind::PlanCreation,
            r#"[{"layer": "echo", "function": "say", "args": {"text": "forty-two"}}]"#,
        ),
        (TaskKind::Evaluation, SUFFICIENT),
    ]));
    let orch = orchestrator(&config, factory.clone());
    let request = BTreeMap::from([
        (
            "projectRoot".to_string(),
            Value::text(project.display().to_string()),
        ),
        ("user".to_string(), Value::text("ada")),
    ]);

    let result = orch.execute("6 * 7?", request).await.unwrap();
    assert_eq!(result.result, "forty-two");

    let plan_prompt = &factory.prompts(TaskKind::PlanCreation)[0];
    assert!(plan_prompt.contains("Numbers in words."));
    assert!(plan_prompt.contains("user: ada"));
    assert!(plan_prompt.contains("Query: 6 * 7?"));
}

#[test]
fn default_tiers_without_keys_are_rejected_at_startup() {
    let err = TieredClientFactory::from_config(&AppConfig::default().llm)
        .err()
        .expect("keyless cloud tiers must be rejected");
    assert!(matches!(err, Error::Config { .. }));
}
