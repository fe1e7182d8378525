//! One LLM call per task: fresh client, composed prompt, cancellable.

use layerflow_core::{Error, LlmClientFactory, Result, TaskKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::PromptComposer;

pub(crate) struct LlmTasks<'a> {
    pub factory: &'a Arc<dyn LlmClientFactory>,
    pub composer: &'a PromptComposer,
    pub cancel: &'a CancellationToken,
    pub run_id: &'a str,
}

impl LlmTasks<'_> {
    /// Create a client for `task`, wrap `body` in the current context blocks
    /// and send it. Cancellation wins over an in-flight completion.
    pub async fn call(&self, task: TaskKind, body: &str) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let client = self.factory.create(task)?;
        let prompt = self.composer.compose(body, client.context_length());
        debug!(
            run_id = %self.run_id,
            task = %task,
            provider = %client.provider(),
            model = %client.model(),
            prompt_chars = prompt.len(),
            "LLM call"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            completion = client.complete(&prompt) => completion.map_err(Error::from),
        }
    }
}
