//! Scripted LLM clients and instrumented layers for engine tests.

use async_trait::async_trait;
use layerflow_core::{
    Layer, LayerError, LlmClient, LlmClientFactory, ProviderError, TaskKind, Value,
};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::RulesSource;

// --- LLM ---

#[derive(Clone)]
enum Reply {
    Text(String),
    Fail(ProviderError),
    Hang,
}

/// Replies per task kind: queued replies first, then the standing reply.
/// Unscripted tasks fail with `InvalidResponse`.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    queued: Mutex<BTreeMap<TaskKind, VecDeque<Reply>>>,
    standing: BTreeMap<TaskKind, Reply>,
    prompts: Arc<Mutex<Vec<(TaskKind, String)>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply.
    pub fn reply(self, task: TaskKind, text: &str) -> Self {
        self.queue(task, Reply::Text(text.to_string()))
    }

    /// Queue a one-shot failure.
    pub fn fail(self, task: TaskKind, error: ProviderError) -> Self {
        self.queue(task, Reply::Fail(error))
    }

    /// Reply with `text` whenever nothing is queued.
    pub fn always(mut self, task: TaskKind, text: &str) -> Self {
        self.standing.insert(task, Reply::Text(text.to_string()));
        self
    }

    /// Never answer `task`.
    pub fn hang(mut self, task: TaskKind) -> Self {
        self.standing.insert(task, Reply::Hang);
        self
    }

    fn queue(self, task: TaskKind, reply: Reply) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(task)
            .or_default()
            .push_back(reply);
        self
    }

    /// Completed calls for `task`.
    pub fn call_count(&self, task: TaskKind) -> usize {
        self.prompts(task).len()
    }

    pub fn prompts(&self, task: TaskKind) -> Vec<String> {
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
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front);
        let reply = queued
            .or_else(|| self.standing.get(&task).cloned())
            .unwrap_or_else(|| {
                Reply::Fail(ProviderError::InvalidResponse(format!(
                    "no scripted reply for {task}"
                )))
            });
        Ok(Box::new(ScriptedClient {
            task,
            reply,
            prompts: Arc::clone(&self.prompts),
        }))
    }
}

struct ScriptedClient {
    task: TaskKind,
    reply: Reply,
    prompts: Arc<Mutex<Vec<(TaskKind, String)>>>,
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn context_length(&self) -> usize {
        32_000
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        if let Reply::Hang = self.reply {
            std::future::pending::<()>().await;
        }
        self.prompts
            .lock()
            .unwrap()
            .push((self.task, prompt.to_string()));
        match &self.reply {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail(e) => Err(e.clone()),
            Reply::Hang => unreachable!(),
        }
    }
}

pub(crate) struct NoRules;

impl RulesSource for NoRules {
    fn load_rules(&self, _project_root: &Path) -> Option<String> {
        None
    }
}

// --- Layers ---

/// `say{text}` returns `text`.
pub(crate) struct EchoLayer;

#[async_trait]
impl Layer for EchoLayer {
    fn description(&self) -> &str {
        "Echo"
    }

    fn functions(&self) -> Vec<String> {
        vec!["say".into()]
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<Value, LayerError> {
        match (function, args.get("text")) {
            ("say", Some(text)) => Ok(text.clone()),
            ("say", None) => Err(LayerError::InvalidArguments("missing 'text'".into())),
            _ => Err(LayerError::UnknownFunction {
                layer: "echo".into(),
                function: function.into(),
            }),
        }
    }
}

/// Accepts any function, records the call order, returns the function name.
#[derive(Default)]
pub(crate) struct RecordingLayer {
    calls: Mutex<Vec<String>>,
}

impl RecordingLayer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Layer for RecordingLayer {
    fn description(&self) -> &str {
        "Records calls"
    }

    fn functions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, function: &str, _args: Value) -> Result<Value, LayerError> {
        self.calls.lock().unwrap().push(function.to_string());
        tokio::task::yield_now().await;
        Ok(Value::text(function))
    }
}

/// Every call waits until `n` calls are in flight at once.
pub(crate) struct BarrierLayer {
    barrier: tokio::sync::Barrier,
}

impl BarrierLayer {
    pub fn new(n: usize) -> Self {
        Self {
            barrier: tokio::sync::Barrier::new(n),
        }
    }
}

#[async_trait]
impl Layer for BarrierLayer {
    fn description(&self) -> &str {
        "Barrier"
    }

    fn functions(&self) -> Vec<String> {
        vec!["wait".into()]
    }

    async fn invoke(&self, _function: &str, _args: Value) -> Result<Value, LayerError> {
        self.barrier.wait().await;
        Ok(Value::text("released"))
    }
}

/// Sleeps for `delay` per call and tracks peak concurrency.
pub(crate) struct SlowLayer {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowLayer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Layer for SlowLayer {
    fn description(&self) -> &str {
        "Slow"
    }

    fn functions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, function: &str, _args: Value) -> Result<Value, LayerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::text(function))
    }
}
