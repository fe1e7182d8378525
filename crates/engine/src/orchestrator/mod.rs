//! The run driver.
//!
//! One run at a time: apply the request context, optionally answer directly,
//! otherwise plan, execute the tree, evaluate, and retry within budget. Every
//! run that starts ends in exactly one history entry and one final state
//! broadcast.

pub mod context;
mod feedback;
mod scheduler;
mod tasks;

pub use context::{ExecutionContext, ExecutionSnapshot, Fragment};

use chrono::{DateTime, Utc};
use layerflow_config::{AppConfig, FailurePolicy, OrchestratorConfig};
use layerflow_core::{Error, LayerRegistry, LlmClientFactory, Result, TaskKind, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::feedback::Applied;
use self::scheduler::Scheduler;
use self::tasks::LlmTasks;
use crate::context::{AppContextService, FileRulesSource, PromptComposer};
use crate::history::{ExecutionHistory, ExecutionHistoryStore, ExecutionResult, RunStatus};
use crate::plan::{ExecutionTree, PlanBuilder};
use crate::prompts::{self, RetryAction};
use crate::state::{ExecutionState, StateBus};

/// Fragment key of a direct answer.
pub const DIRECT_ANSWER_KEY: &str = "direct-answer";

/// Runtime knobs, usually taken from `[orchestrator]`.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_retries: u32,
    pub failure_policy: FailurePolicy,
    pub direct_answer: bool,
    pub cancel_grace: Duration,
    /// 0 = unbounded
    pub max_concurrent_invocations: usize,
    pub history_capacity: usize,
}

impl From<&OrchestratorConfig> for OrchestratorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            failure_policy: config.failure_policy,
            direct_answer: config.direct_answer,
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            max_concurrent_invocations: config.max_concurrent_invocations,
            history_capacity: config.history_capacity,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

// --- Run handle ---

struct RunHandle {
    id: String,
    query: String,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    attempt: AtomicU32,
    tree: Mutex<Option<ExecutionTree>>,
    ctx: Mutex<Arc<ExecutionContext>>,
    result: Mutex<String>,
}

impl RunHandle {
    fn new(query: String, cancel: CancellationToken) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query,
            started_at: Utc::now(),
            cancel,
            attempt: AtomicU32::new(0),
            tree: Mutex::new(None),
            ctx: Mutex::new(Arc::new(ExecutionContext::new(0))),
            result: Mutex::new(String::new()),
        }
    }

    fn ctx(&self) -> Arc<ExecutionContext> {
        Arc::clone(&self.ctx.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_ctx(&self, ctx: Arc<ExecutionContext>) {
        *self.ctx.lock().unwrap_or_else(|e| e.into_inner()) = ctx;
    }

    fn tree(&self) -> Option<ExecutionTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_tree(&self, tree: ExecutionTree) {
        *self.tree.lock().unwrap_or_else(|e| e.into_inner()) = Some(tree);
    }

    fn result(&self) -> String {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_result(&self, result: String) {
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = result;
    }

    fn log(&self, line: impl Into<String>) {
        self.ctx().log(line);
    }

    fn state(&self, status: RunStatus, result: Option<String>, error: Option<String>) -> ExecutionState {
        let ctx = self.ctx();
        let (completed, failed, running) = ctx.counts();
        let tree = self
            .tree
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tree| tree.view(&|id| ctx.status(id)));
        ExecutionState {
            id: self.id.clone(),
            query: self.query.clone(),
            status,
            result,
            error,
            total_nodes: ctx.total_node_count(),
            completed_nodes: completed,
            failed_nodes: failed,
            running_nodes: running,
            attempt: self.attempt.load(Ordering::SeqCst),
            logs: ctx.logs(),
            tree,
        }
    }
}

// --- Orchestrator ---

struct Inner {
    registry: Arc<LayerRegistry>,
    factory: Arc<dyn LlmClientFactory>,
    composer: PromptComposer,
    settings: OrchestratorSettings,
    permits: Option<Semaphore>,
    history: ExecutionHistoryStore,
    bus: StateBus,
    shutdown: CancellationToken,
    active: Mutex<Option<Arc<RunHandle>>>,
    idle: watch::Sender<bool>,
}

/// Plans and executes queries against a layer registry. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LayerRegistry>,
        factory: Arc<dyn LlmClientFactory>,
        app_context: Arc<AppContextService>,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = (settings.max_concurrent_invocations > 0)
            .then(|| Semaphore::new(settings.max_concurrent_invocations));
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                registry,
                factory,
                composer: PromptComposer::new(app_context),
                history: ExecutionHistoryStore::new(settings.history_capacity),
                settings,
                permits,
                bus: StateBus::default(),
                shutdown: CancellationToken::new(),
                active: Mutex::new(None),
                idle,
            }),
        }
    }

    /// Wire an orchestrator from loaded configuration. Project rules are read
    /// from the configured rules file.
    pub fn from_config(
        config: &AppConfig,
        registry: Arc<LayerRegistry>,
        factory: Arc<dyn LlmClientFactory>,
    ) -> Self {
        let rules = Arc::new(FileRulesSource::from_config(&config.context));
        Self::new(
            registry,
            factory,
            Arc::new(AppContextService::new(rules)),
            OrchestratorSettings::from(&config.orchestrator),
        )
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn app_context(&self) -> &AppContextService {
        self.inner.composer.app_context()
    }

    /// Start a run in the background and return its id.
    pub fn submit(
        &self,
        query: impl Into<String>,
        request_context: BTreeMap<String, Value>,
    ) -> Result<String> {
        let run = self.begin(query.into())?;
        let id = run.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(run, request_context).await;
        });
        Ok(id)
    }

    /// Run a query to completion. A failed run is still `Ok`, with the error
    /// recorded on the result.
    pub async fn execute(
        &self,
        query: impl Into<String>,
        request_context: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let run = self.begin(query.into())?;
        let this = self.clone();
        // Dropping this future must not strand the active run.
        tokio::spawn(async move { this.drive(run, request_context).await })
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))
    }

    /// State of the active run, if any.
    pub fn current_state(&self) -> Option<ExecutionState> {
        self.active()
            .map(|run| run.state(RunStatus::Running, None, None))
    }

    /// Finished runs, most recent first.
    pub fn history(&self, limit: usize) -> Vec<ExecutionHistory> {
        self.inner.history.recent(limit)
    }

    /// A finished run by id, while it is still within the history capacity.
    pub fn history_entry(&self, run_id: &str) -> Option<ExecutionHistory> {
        self.inner.history.get(run_id)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<ExecutionState>> {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_stream(&self) -> impl futures::Stream<Item = Arc<ExecutionState>> + Send + 'static {
        self.inner.bus.subscribe_stream()
    }

    /// Cancel the active run. Returns `false` when nothing is running.
    pub fn cancel_current(&self) -> bool {
        match self.active() {
            Some(run) => {
                info!(run_id = %run.id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the active run, refuse new ones, and wait until the active run
    /// has been finalized.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
        info!("Orchestrator shut down");
    }

    fn active(&self) -> Option<Arc<RunHandle>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn begin(&self, query: String) -> Result<Arc<RunHandle>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let run = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = active.as_ref() {
                return Err(Error::Busy(current.id.clone()));
            }
            let run = Arc::new(RunHandle::new(query, self.inner.shutdown.child_token()));
            *active = Some(Arc::clone(&run));
            run
        };
        self.inner.idle.send_replace(false);
        info!(run_id = %run.id, query = %run.query, "Run started");
        self.publish(&run);
        Ok(run)
    }

    fn publish(&self, run: &RunHandle) {
        self.inner.bus.publish(run.state(RunStatus::Running, None, None));
    }

    async fn drive(&self, run: Arc<RunHandle>, request_context: BTreeMap<String, Value>) -> ExecutionResult {
        let outcome = self.run_phases(&run, request_context).await;
        self.finish(&run, outcome)
    }

    async fn run_phases(&self, run: &RunHandle, request_context: BTreeMap<String, Value>) -> Result<()> {
        // Refreshing project rules reads from disk.
        let app_context = self.inner.composer.shared_app_context();
        let refreshed = tokio::task::spawn_blocking(move || app_context.apply_request(request_context))
            .await
            .map_err(|e| Error::Internal(format!("context refresh task failed: {e}")))?;
        if refreshed {
            run.log("Project context refreshed");
        }

        let tasks = LlmTasks {
            factory: &self.inner.factory,
            composer: &self.inner.composer,
            cancel: &run.cancel,
            run_id: &run.id,
        };

        if self.inner.settings.direct_answer {
            if let Some(answer) = self.try_direct_answer(run, &tasks).await? {
                run.ctx().record_fragment(
                    DIRECT_ANSWER_KEY,
                    Fragment::Completed {
                        value: Value::text(answer.clone()),
                    },
                );
                run.set_tree(ExecutionTree::empty());
                run.set_result(answer);
                run.log("Answered directly");
                return Ok(());
            }
        }

        let layers = self.inner.registry.describe();
        let plan = tasks
            .call(TaskKind::PlanCreation, &prompts::plan_creation(&run.query, &layers))
            .await?;
        let mut tree = PlanBuilder::from_llm_output(&plan)?;
        let mut ctx = Arc::new(ExecutionContext::carry_over(
            tree.node_count(),
            &run.ctx(),
            &Default::default(),
        ));
        ctx.log(format!("Planned {} node(s)", tree.node_count()));
        info!(run_id = %run.id, nodes = tree.node_count(), "Plan built");
        run.set_tree(tree.clone());
        run.set_ctx(Arc::clone(&ctx));
        self.publish(run);

        let max_retries = self.inner.settings.max_retries;
        let mut retries = 0;
        loop {
            let attempt = run.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            self.execute_tree(run, &tree, &ctx).await;
            if run.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let result = feedback::aggregate(&tree, &ctx);
            run.set_result(result.clone());
            let failures = ctx.failures();
            let verdict = feedback::evaluate(
                self.inner.settings.failure_policy,
                &tasks,
                &run.query,
                &result,
                &failures,
            )
            .await?;

            if verdict.sufficient {
                ctx.log(format!("Attempt {attempt} sufficient"));
                return Ok(());
            }
            ctx.log(format!("Attempt {attempt} insufficient: {}", verdict.reason));
            info!(run_id = %run.id, attempt, reason = %verdict.reason, "Result insufficient");

            if retries >= max_retries {
                return Err(Error::RetryBudgetExhausted {
                    attempts: attempt,
                    verdict: verdict.reason,
                });
            }
            retries += 1;

            let body = prompts::retry_strategy(&run.query, &tree, &result, &verdict.reason, &failures);
            let action = match tasks.call(TaskKind::RetryStrategy, &body).await {
                Ok(text) => prompts::parse_retry_action(&text),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => RetryAction::Stop {
                    reason: format!("retry strategy failed: {e}"),
                },
            };

            match feedback::apply(action, &tree, &ctx, &tasks, &run.query).await? {
                Applied::Retry {
                    tree: next_tree,
                    ctx: next_ctx,
                } => {
                    tree = next_tree;
                    ctx = next_ctx;
                    run.set_tree(tree.clone());
                    run.set_ctx(Arc::clone(&ctx));
                    self.publish(run);
                }
                Applied::Stop(reason) => {
                    ctx.log(format!("Retry stopped: {reason}"));
                    return Err(Error::RetryBudgetExhausted {
                        attempts: attempt,
                        verdict: format!("{}; retry stopped: {reason}", verdict.reason),
                    });
                }
            }
        }
    }

    /// `Some(answer)` when the check says the query needs no layers. A failed
    /// check falls through to planning.
    async fn try_direct_answer(&self, run: &RunHandle, tasks: &LlmTasks<'_>) -> Result<Option<String>> {
        let body = prompts::direct_answer_check(&run.query, &self.inner.registry.describe());
        match tasks.call(TaskKind::DirectAnswerCheck, &body).await {
            Ok(text) if prompts::parse_yes_no(&text) => {}
            Ok(_) => return Ok(None),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Direct answer check failed");
                run.log(format!("Direct answer check failed: {e}"));
                return Ok(None);
            }
        }

        let answer = tasks
            .call(TaskKind::DirectAnswerGeneration, &prompts::direct_answer(&run.query))
            .await?;
        Ok(Some(answer.trim().to_string()))
    }

    async fn execute_tree(&self, run: &RunHandle, tree: &ExecutionTree, ctx: &ExecutionContext) {
        let on_change = || self.publish(run);
        let scheduler = Scheduler {
            registry: &self.inner.registry,
            ctx,
            cancel: &run.cancel,
            grace: self.inner.settings.cancel_grace,
            permits: self.inner.permits.as_ref(),
            run_id: &run.id,
            on_change: &on_change,
        };
        scheduler.run_tree(tree).await;
    }

    fn finish(&self, run: &Arc<RunHandle>, outcome: Result<()>) -> ExecutionResult {
        let ctx = run.ctx();
        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Run failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
        };
        ctx.log(format!("Run {status}"));
        info!(run_id = %run.id, status = %status, "Run finished");

        let result = ExecutionResult {
            result: run.result(),
            error: error.clone(),
            context: ctx.snapshot(),
            tree: run.tree(),
        };
        self.inner.history.push(ExecutionHistory {
            id: run.id.clone(),
            query: run.query.clone(),
            result: result.clone(),
            status,
            start_time: run.started_at,
            end_time: Some(Utc::now()),
            logs: ctx.logs(),
        });

        let final_state = run.state(status, Some(result.result.clone()), error);
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, run)) {
                *active = None;
            }
        }
        self.inner.idle.send_replace(true);
        self.inner.bus.publish(final_state);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PROJECT_ROOT_KEY, RulesSource};
    use crate::state::NodeStatus;
    use crate::test_helpers::{EchoLayer, NoRules, ScriptedFactory, SlowLayer};
    use layerflow_core::ProviderError;
    use std::path::Path;

    const SUFFICIENT: &str = r#"{"sufficient": true, "reason": "ok"}"#;
    const INSUFFICIENT: &str = r#"{"sufficient": false, "reason": "not enough"}"#;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            max_retries: 2,
            failure_policy: FailurePolicy::Strict,
            direct_answer: false,
            cancel_grace: Duration::from_millis(50),
            max_concurrent_invocations: 8,
            history_capacity: 10,
        }
    }

    fn orchestrator_with(
        factory: Arc<ScriptedFactory>,
        settings: OrchestratorSettings,
        rules: Arc<dyn RulesSource>,
    ) -> Orchestrator {
        let registry = Arc::new(LayerRegistry::new());
        registry.register("echo", Arc::new(EchoLayer));
        registry.register("slow", Arc::new(SlowLayer::new(Duration::from_secs(60))));
        Orchestrator::new(
            registry,
            factory,
            Arc::new(AppContextService::new(rules)),
            settings,
        )
    }

    fn orchestrator(factory: Arc<ScriptedFactory>, settings: OrchestratorSettings) -> Orchestrator {
        orchestrator_with(factory, settings, Arc::new(NoRules))
    }

    #[tokio::test]
    async fn single_echo_root_completes() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "hi"}}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(factory, settings());

        let result = orch.execute("say hi", BTreeMap::new()).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.result, "hi");
        assert_eq!(result.context.total_node_count, 1);
        assert_eq!(result.context.completed.len(), 1);
        assert!(result.context.failed.is_empty());

        let history = orch.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
        assert!(orch.current_state().is_none());
    }

    #[tokio::test]
    async fn submitted_run_is_found_in_history_by_id() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "hi"}}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(factory, settings());
        let mut states = orch.subscribe();

        let id = orch.submit("say hi", BTreeMap::new()).unwrap();
        loop {
            let state = states.recv().await.unwrap();
            if state.id == id && state.status != RunStatus::Running {
                break;
            }
        }

        let entry = orch.history_entry(&id).unwrap();
        assert_eq!(entry.status, RunStatus::Completed);
        assert_eq!(entry.result.result, "hi");
        assert!(orch.history_entry("missing").is_none());
    }

    #[tokio::test]
    async fn unregistered_layer_fails_run_under_strict_policy() {
        let factory = Arc::new(ScriptedFactory::new().reply(
            TaskKind::PlanCreation,
            r#"[{"layer": "echo", "function": "say", "args": {"text": "ok"}},
                {"layer": "ghost", "function": "boo"}]"#,
        ));
        let orch = orchestrator(
            factory.clone(),
            OrchestratorSettings {
                max_retries: 0,
                ..settings()
            },
        );

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert_eq!(result.result, "ok");
        assert_eq!(result.context.completed.len(), 1);
        assert_eq!(result.context.failed.len(), 1);
        let error = result.error.unwrap();
        assert!(error.contains("Retry budget exhausted"));
        assert!(error.contains("Layer not found: ghost"));
        assert_eq!(factory.call_count(TaskKind::Evaluation), 0);
        assert_eq!(orch.history(1)[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn evaluator_policy_lets_a_partial_result_pass() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "ok"}},
                        {"layer": "ghost", "function": "boo"}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(
            factory,
            OrchestratorSettings {
                failure_policy: FailurePolicy::Evaluator,
                ..settings()
            },
        );

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.result, "ok");
    }

    #[tokio::test]
    async fn retries_never_exceed_the_budget() {
        let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "a"}}]"#;
        let root_id = PlanBuilder::from_llm_output(plan).unwrap().roots()[0]
            .id()
            .to_string();
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(TaskKind::PlanCreation, plan)
                .always(TaskKind::Evaluation, INSUFFICIENT)
                .always(
                    TaskKind::RetryStrategy,
                    &format!(
                        r#"{{"action": "adjust", "adjustments": [{{"node_id": "{root_id}", "args": {{"text": "b"}}}}]}}"#
                    ),
                ),
        );
        let orch = orchestrator(factory.clone(), settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert_eq!(factory.call_count(TaskKind::Evaluation), 3);
        assert_eq!(factory.call_count(TaskKind::RetryStrategy), 2);
        assert_eq!(result.result, "b");
        let error = result.error.unwrap();
        assert!(error.contains("3 attempt(s)"));
        assert!(error.contains("not enough"));
    }

    #[tokio::test]
    async fn replan_recovers_a_failed_subtree() {
        let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "keep"}},
                       {"layer": "ghost", "function": "boo"}]"#;
        let failed_id = PlanBuilder::from_llm_output(plan).unwrap().roots()[1]
            .id()
            .to_string();
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(TaskKind::PlanCreation, plan)
                .reply(
                    TaskKind::RetryStrategy,
                    &format!(
                        r#"{{"action": "replan", "node_id": "{failed_id}",
                             "subtree": {{"layer": "echo", "function": "say", "args": {{"text": "fixed"}}}}}}"#
                    ),
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(factory.clone(), settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert!(result.succeeded(), "{:?}", result.error);
        assert_eq!(result.result, "keep\nfixed");
        assert_eq!(result.context.completed.len(), 2);
        assert_eq!(factory.call_count(TaskKind::RetryStrategy), 1);
        assert_eq!(orch.history(10).len(), 1);
    }

    #[tokio::test]
    async fn stop_action_fails_with_the_verdict() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "a"}}]"#,
                )
                .reply(TaskKind::Evaluation, INSUFFICIENT)
                .reply(
                    TaskKind::RetryStrategy,
                    r#"{"action": "none", "reason": "cannot do better"}"#,
                ),
        );
        let orch = orchestrator(factory.clone(), settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        let error = result.error.unwrap();
        assert!(error.contains("not enough"));
        assert!(error.contains("cannot do better"));
        assert_eq!(factory.call_count(TaskKind::Evaluation), 1);
    }

    #[tokio::test]
    async fn failing_strategy_call_stops_retrying() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "a"}}]"#,
                )
                .reply(TaskKind::Evaluation, INSUFFICIENT)
                .fail(
                    TaskKind::RetryStrategy,
                    ProviderError::RateLimited {
                        retry_after_secs: 30,
                    },
                ),
        );
        let orch = orchestrator(factory.clone(), settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert_eq!(result.result, "a");
        assert_eq!(result.context.completed.len(), 1);
        let error = result.error.unwrap();
        assert!(error.contains("1 attempt(s)"), "{error}");
        assert!(error.contains("retry strategy failed"), "{error}");
        assert_eq!(factory.call_count(TaskKind::Evaluation), 1);
        assert_eq!(orch.history(1)[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn adjusting_a_sequential_step_reruns_the_steps_after_it() {
        let plan = r#"[{"layer": "echo", "function": "say", "args": {"text": "root"},
                        "children": [{"layer": "echo", "function": "say", "args": {"text": "a"}},
                                     {"layer": "echo", "function": "say", "args": {"text": "$prev"}}]}]"#;
        let first_id = PlanBuilder::from_llm_output(plan).unwrap().roots()[0].children()[0]
            .id()
            .to_string();
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(TaskKind::PlanCreation, plan)
                .reply(TaskKind::Evaluation, INSUFFICIENT)
                .reply(
                    TaskKind::RetryStrategy,
                    &format!(
                        r#"{{"action": "adjust", "adjustments": [{{"node_id": "{first_id}", "args": {{"text": "z"}}}}]}}"#
                    ),
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(factory, settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert!(result.succeeded(), "{:?}", result.error);
        assert_eq!(result.result, "root\nz\nz");
        assert_eq!(result.context.completed.len(), 3);
    }

    #[tokio::test]
    async fn malformed_plan_fails_the_run() {
        let factory = Arc::new(
            ScriptedFactory::new().reply(TaskKind::PlanCreation, "I would call some layers."),
        );
        let orch = orchestrator(factory, settings());

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert!(result.error.unwrap().contains("Malformed plan"));
        assert_eq!(orch.history(10)[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn direct_answer_skips_planning() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(TaskKind::DirectAnswerCheck, "YES")
                .reply(TaskKind::DirectAnswerGeneration, " Paris \n"),
        );
        let orch = orchestrator(
            factory.clone(),
            OrchestratorSettings {
                direct_answer: true,
                ..settings()
            },
        );

        let result = orch.execute("capital of France?", BTreeMap::new()).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(result.result, "Paris");
        assert_eq!(result.context.total_node_count, 0);
        assert_eq!(
            result.context.fragments.get(DIRECT_ANSWER_KEY),
            Some(&Fragment::Completed {
                value: Value::text("Paris")
            })
        );
        assert!(result.tree.unwrap().is_empty());
        assert_eq!(factory.call_count(TaskKind::PlanCreation), 0);
        assert_eq!(orch.history(10).len(), 1);
    }

    #[tokio::test]
    async fn failing_direct_answer_check_falls_through_to_planning() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .fail(
                    TaskKind::DirectAnswerCheck,
                    ProviderError::Network("connection reset".into()),
                )
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "planned"}}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(
            factory,
            OrchestratorSettings {
                direct_answer: true,
                ..settings()
            },
        );

        let result = orch.execute("q", BTreeMap::new()).await.unwrap();
        assert_eq!(result.result, "planned");
        assert!(result.context.logs.iter().any(|l| l.contains("Direct answer check failed")));
    }

    #[tokio::test]
    async fn second_submit_while_running_is_busy() {
        let factory = Arc::new(ScriptedFactory::new().hang(TaskKind::PlanCreation));
        let orch = orchestrator(factory, settings());

        let id = orch.submit("first", BTreeMap::new()).unwrap();
        assert!(matches!(
            orch.submit("second", BTreeMap::new()),
            Err(Error::Busy(active)) if active == id
        ));
        assert_eq!(orch.current_state().unwrap().id, id);

        assert!(orch.cancel_current());
        orch.shutdown().await;
        let history = orch.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result.error.as_deref(), Some("Run cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_execution_finalizes_failed() {
        let factory = Arc::new(ScriptedFactory::new().reply(
            TaskKind::PlanCreation,
            r#"[{"layer": "slow", "function": "wait"}]"#,
        ));
        let orch = orchestrator(factory, settings());
        let mut states = orch.subscribe();

        orch.submit("q", BTreeMap::new()).unwrap();
        loop {
            let state = states.recv().await.unwrap();
            if state.running_nodes == 1 {
                break;
            }
        }
        assert!(orch.cancel_current());
        orch.shutdown().await;

        let entry = &orch.history(1)[0];
        assert_eq!(entry.status, RunStatus::Failed);
        assert_eq!(entry.result.error.as_deref(), Some("Run cancelled"));
        assert!(orch.submit("after shutdown", BTreeMap::new()).is_err());
    }

    #[tokio::test]
    async fn states_stream_until_the_final_one() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "hi"}}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(factory, settings());
        let mut states = orch.subscribe();

        orch.execute("q", BTreeMap::new()).await.unwrap();

        let mut last = None;
        while let Ok(state) = states.try_recv() {
            last = Some(state);
        }
        let last = last.unwrap();
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.result.as_deref(), Some("hi"));
        let tree = last.tree.as_ref().unwrap();
        assert_eq!(tree[0].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_bounded() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .always(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "x"}}]"#,
                )
                .always(TaskKind::Evaluation, SUFFICIENT),
        );
        let orch = orchestrator(
            factory,
            OrchestratorSettings {
                history_capacity: 2,
                ..settings()
            },
        );

        for query in ["one", "two", "three"] {
            orch.execute(query, BTreeMap::new()).await.unwrap();
        }
        let queries: Vec<_> = orch.history(10).into_iter().map(|h| h.query).collect();
        assert_eq!(queries, vec!["three", "two"]);
        assert_eq!(orch.history(1).len(), 1);
    }

    struct CountingRules(std::sync::atomic::AtomicUsize);

    impl RulesSource for CountingRules {
        fn load_rules(&self, project_root: &Path) -> Option<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(format!("rules for {}", project_root.display()))
        }
    }

    #[tokio::test]
    async fn project_rules_reach_the_planner_prompt() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .always(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "x"}}]"#,
                )
                .always(TaskKind::Evaluation, SUFFICIENT),
        );
        let rules = Arc::new(CountingRules(Default::default()));
        let orch = orchestrator_with(factory.clone(), settings(), rules.clone());
        let request = |root: &str| BTreeMap::from([(PROJECT_ROOT_KEY.to_string(), Value::text(root))]);

        orch.execute("q", request("/a")).await.unwrap();
        orch.execute("q", request("/a")).await.unwrap();
        orch.execute("q", request("/b")).await.unwrap();

        assert_eq!(rules.0.load(Ordering::SeqCst), 2);
        let prompts = factory.prompts(TaskKind::PlanCreation);
        assert!(prompts[0].contains("rules for /a"));
        assert!(prompts[2].contains("rules for /b"));
    }

    struct GatedRules(Mutex<std::sync::mpsc::Receiver<()>>);

    impl RulesSource for GatedRules {
        fn load_rules(&self, _project_root: &Path) -> Option<String> {
            let gate = self.0.lock().unwrap();
            gate.recv_timeout(Duration::from_secs(5))
                .ok()
                .map(|()| "gated rules".to_string())
        }
    }

    #[tokio::test]
    async fn rules_are_loaded_off_the_runtime_thread() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .reply(
                    TaskKind::PlanCreation,
                    r#"[{"layer": "echo", "function": "say", "args": {"text": "x"}}]"#,
                )
                .reply(TaskKind::Evaluation, SUFFICIENT),
        );
        let (open, gate) = std::sync::mpsc::channel();
        let orch = orchestrator_with(factory.clone(), settings(), Arc::new(GatedRules(Mutex::new(gate))));

        // Single-threaded runtime: this task only runs if loading the rules
        // does not hold the runtime thread.
        tokio::spawn(async move {
            let _ = open.send(());
        });
        let request = BTreeMap::from([(PROJECT_ROOT_KEY.to_string(), Value::text("/gated"))]);
        let result = orch.execute("q", request).await.unwrap();

        assert!(result.succeeded(), "{:?}", result.error);
        assert!(factory.prompts(TaskKind::PlanCreation)[0].contains("gated rules"));
    }
}
