//! Prompt payloads carried in the `kwargs` of a `"generate"` task.
//!
//! - [`ChatMessage`]: role ごとの閉じた enum。未知の role は受け付けない
//! - [`PromptTransaction`]: single generation / chat completion の 2 形態（`prompt_type` で判別）
//! - [`ModelOptions`]: 不変の設定値。`with_*` は新しい値を返し、元の値は変えない

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::TaskEnvelope;
use super::ids::JobId;
use crate::error::JobwireError;
use crate::typed::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    #[serde(rename = "type", default)]
    pub kind: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// `data:image/<fmt>;base64,...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ContentUnit {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentType::Text,
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn validate(&self) -> Result<(), JobwireError> {
        match self.kind {
            ContentType::Text if self.text.is_none() => Err(JobwireError::validation(
                "text content must be provided for type 'text'",
            )),
            ContentType::Image => match self.image.as_deref() {
                Some(data) if data.starts_with("data:image/") && data.contains(";base64,") => Ok(()),
                Some(_) => Err(JobwireError::validation("image content is not a base64 data url")),
                None => Err(JobwireError::validation(
                    "image content must be provided for type 'image'",
                )),
            },
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentUnit>),
}

impl MessageContent {
    /// Text parts joined by newlines; images are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn validate(&self) -> Result<(), JobwireError> {
        match self {
            Self::Text(_) => Ok(()),
            Self::Parts(parts) => parts.iter().try_for_each(ContentUnit::validate),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// `{"role": "...", "content": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System { content: MessageContent },
    User { content: MessageContent },
    Assistant { content: MessageContent },
}

impl ChatMessage {
    pub fn from_role(role: &str, content: impl Into<MessageContent>) -> Result<Self, JobwireError> {
        let content = content.into();
        match role {
            "system" => Ok(Self::System { content }),
            "user" => Ok(Self::User { content }),
            "assistant" => Ok(Self::Assistant { content }),
            other => Err(JobwireError::validation(format!("unknown message role '{other}'"))),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMeta {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub tokens_limit: Option<u32>,
    #[serde(default)]
    pub stop_words: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for PromptMeta {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            tokens_limit: Some(8096),
            stop_words: None,
            model: None,
        }
    }
}

/// Single prompt, sent to the model as one user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptModel {
    #[serde(default = "JobId::generate")]
    pub job_id: JobId,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub meta: PromptMeta,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default = "JobId::generate")]
    pub job_id: JobId,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub meta: PromptMeta,
    pub messages: Vec<ChatMessage>,
}

fn default_source() -> String {
    "local".to_string()
}

impl From<PromptModel> for ChatCompletion {
    fn from(prompt: PromptModel) -> Self {
        Self {
            job_id: prompt.job_id,
            priority: prompt.priority,
            source: default_source(),
            meta: prompt.meta,
            messages: vec![ChatMessage::User {
                content: prompt.content,
            }],
        }
    }
}

/// Payload of a `"generate"` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "prompt_type", content = "prompt", rename_all = "snake_case")]
pub enum PromptTransaction {
    SingleGeneration(PromptModel),
    ChatCompletion(ChatCompletion),
}

impl Task for PromptTransaction {
    const TYPE: &'static str = "generate";
}

impl PromptTransaction {
    pub fn single(content: impl Into<MessageContent>) -> Self {
        Self::SingleGeneration(PromptModel {
            job_id: JobId::generate(),
            priority: None,
            meta: PromptMeta::default(),
            content: content.into(),
        })
    }

    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        Self::ChatCompletion(ChatCompletion {
            job_id: JobId::generate(),
            priority: None,
            source: default_source(),
            meta: PromptMeta::default(),
            messages,
        })
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        match &mut self {
            Self::SingleGeneration(p) => p.job_id = job_id,
            Self::ChatCompletion(c) => c.job_id = job_id,
        }
        self
    }

    pub fn with_priority(mut self, priority: Option<u8>) -> Self {
        match &mut self {
            Self::SingleGeneration(p) => p.priority = priority,
            Self::ChatCompletion(c) => c.priority = priority,
        }
        self
    }

    pub fn with_meta(mut self, meta: PromptMeta) -> Self {
        match &mut self {
            Self::SingleGeneration(p) => p.meta = meta,
            Self::ChatCompletion(c) => c.meta = meta,
        }
        self
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            Self::SingleGeneration(p) => &p.job_id,
            Self::ChatCompletion(c) => &c.job_id,
        }
    }

    pub fn priority(&self) -> Option<u8> {
        match self {
            Self::SingleGeneration(p) => p.priority,
            Self::ChatCompletion(c) => c.priority,
        }
    }

    pub fn meta(&self) -> &PromptMeta {
        match self {
            Self::SingleGeneration(p) => &p.meta,
            Self::ChatCompletion(c) => &c.meta,
        }
    }

    /// Both forms as a chat history.
    pub fn into_chat(self) -> ChatCompletion {
        match self {
            Self::SingleGeneration(p) => p.into(),
            Self::ChatCompletion(c) => c,
        }
    }

    pub fn validate(&self) -> Result<(), JobwireError> {
        match self {
            Self::SingleGeneration(p) => p.content.validate(),
            Self::ChatCompletion(c) => {
                if c.messages.is_empty() {
                    return Err(JobwireError::validation("chat completion needs at least one message"));
                }
                c.messages.iter().try_for_each(|m| m.content().validate())
            }
        }
    }

    /// Wrap into a task envelope keyed by the transaction's job id.
    pub fn into_envelope(self) -> Result<TaskEnvelope, JobwireError> {
        self.validate()?;
        let id = self.job_id().clone();
        let priority = self.priority();
        let mut envelope = TaskEnvelope::new(id, Self::TYPE, serde_json::to_value(&self)?);
        if let Some(priority) = priority {
            envelope = envelope.with_priority(priority);
        }
        Ok(envelope)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Model invocation settings. Binding tools or a response format yields a
/// new value; the receiver is left untouched so one base configuration can
/// be shared between requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    model: Option<String>,
    temperature: Option<f32>,
    tokens_limit: Option<u32>,
    stop_words: Vec<String>,
    tools: Vec<ToolSpec>,
    response_format: Option<Value>,
}

impl ModelOptions {
    pub fn from_meta(meta: &PromptMeta) -> Self {
        Self {
            model: meta.model.clone(),
            temperature: meta.temperature,
            tokens_limit: meta.tokens_limit,
            stop_words: meta.stop_words.clone().unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..self.clone()
        }
    }

    pub fn with_temperature(&self, temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..self.clone()
        }
    }

    pub fn with_tools(&self, tools: Vec<ToolSpec>) -> Self {
        Self {
            tools,
            ..self.clone()
        }
    }

    pub fn with_response_format(&self, schema: Value) -> Self {
        Self {
            response_format: Some(schema),
            ..self.clone()
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn tokens_limit(&self) -> Option<u32> {
        self.tokens_limit
    }

    pub fn stop_words(&self) -> &[String] {
        &self.stop_words
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn response_format(&self) -> Option<&Value> {
        self.response_format.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_message_wire_shape() {
        let msg = ChatMessage::from_role("assistant", "hello").unwrap();
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "assistant", "content": "hello"})
        );
        assert_eq!(msg.role(), "assistant");
    }

    #[test]
    fn unknown_roles_are_rejected() {
        assert!(matches!(
            ChatMessage::from_role("tool", "x"),
            Err(JobwireError::Validation(_))
        ));
        assert!(serde_json::from_value::<ChatMessage>(json!({"role": "tool", "content": "x"})).is_err());
    }

    #[test]
    fn multi_part_content() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
        }))
        .unwrap();
        assert_eq!(msg.content().text(), "a\nb");

        let bad = MessageContent::Parts(vec![ContentUnit {
            kind: ContentType::Image,
            text: None,
            image: Some("not-a-data-url".into()),
        }]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn transaction_is_tagged_by_prompt_type() {
        let tx = PromptTransaction::single("2+2?").with_job_id(JobId::new("j1"));
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["prompt_type"], "single_generation");
        assert_eq!(value["prompt"]["job_id"], "j1");
        assert_eq!(value["prompt"]["meta"]["tokens_limit"], 8096);
    }

    #[test]
    fn single_generation_becomes_one_user_message() {
        let chat = PromptTransaction::single("hi").into_chat();
        assert_eq!(chat.messages, vec![ChatMessage::user("hi")]);
        assert_eq!(chat.source, "local");
    }

    #[test]
    fn envelope_uses_the_transaction_identity() {
        let envelope = PromptTransaction::single("hi")
            .with_job_id(JobId::new("j9"))
            .with_priority(Some(4))
            .into_envelope()
            .unwrap();

        assert_eq!(envelope.id().as_str(), "j9");
        assert_eq!(envelope.task().as_str(), "generate");
        assert_eq!(envelope.priority(), Some(4));
        let back: PromptTransaction = serde_json::from_value(envelope.kwargs().clone()).unwrap();
        assert_eq!(back.job_id().as_str(), "j9");
    }

    #[test]
    fn empty_chat_is_invalid() {
        assert!(PromptTransaction::chat(vec![]).into_envelope().is_err());
    }

    #[test]
    fn model_options_bindings_do_not_mutate_the_base() {
        let base = ModelOptions::from_meta(&PromptMeta::default());
        let tool = ToolSpec {
            name: "search".into(),
            description: "web search".into(),
            parameters: json!({"type": "object"}),
        };

        let with_tools = base.with_tools(vec![tool.clone()]);
        let structured = with_tools.with_response_format(json!({"type": "object"}));

        assert!(base.tools().is_empty());
        assert!(base.response_format().is_none());
        assert_eq!(with_tools.tools(), &[tool]);
        assert!(with_tools.response_format().is_none());
        assert!(structured.response_format().is_some());
        assert_eq!(structured.temperature(), Some(0.2));
        assert_eq!(base.with_temperature(0.9).temperature(), Some(0.9));
    }
}
