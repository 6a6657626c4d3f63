//! Built-in handlers for the `worker` and `demo` commands.

use async_trait::async_trait;
use jobwire_core::domain::{ChatMessage, JobStatusError, ModelOptions, PromptTransaction};
use jobwire_core::typed::Handler;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Serialize)]
struct EchoReply<'a> {
    model: Option<&'a str>,
    temperature: Option<f32>,
    reply: String,
}

/// Answers a `generate` task with the last user message.
///
/// Stands in for a model call; `"fail"` as the prompt produces a job error.
pub struct EchoHandler {
    defaults: ModelOptions,
}

impl EchoHandler {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            defaults: ModelOptions::default().with_model(model),
        }
    }
}

#[async_trait]
impl Handler<PromptTransaction> for EchoHandler {
    async fn handle(&self, task: PromptTransaction) -> Result<String, JobStatusError> {
        let mut options = ModelOptions::from_meta(task.meta());
        if options.model().is_none()
            && let Some(model) = self.defaults.model()
        {
            options = options.with_model(model);
        }

        let chat = task.into_chat();
        let last_user = chat
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m, ChatMessage::User { .. }))
            .map(|m| m.content().text())
            .ok_or_else(|| JobStatusError::new("ValidationError", "no user message"))?;
        debug!(messages = chat.messages.len(), "echoing prompt");

        if last_user.trim() == "fail" {
            return Err(JobStatusError::new("LLMError", "model refused the prompt"));
        }

        let reply = EchoReply {
            model: options.model(),
            temperature: options.temperature(),
            reply: last_user,
        };
        serde_json::to_string(&reply).map_err(|e| JobStatusError::new("SerializationError", e.to_string()))
    }
}
