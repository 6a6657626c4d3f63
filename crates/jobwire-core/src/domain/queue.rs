//! Named queue: declaration, stored metadata, and live broker views.
//!
//! metadata record と broker のライブ状態（consumer 数 / message 数）は別物。
//! 一覧表示のときに突き合わせる（[`QueueSummary`]）。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declaration argument carrying the priority bound (RabbitMQ naming).
pub const MAX_PRIORITY_ARG: &str = "x-max-priority";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Enables priority mode; higher values are delivered first.
    #[serde(default)]
    pub max_priority: Option<u8>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl QueueDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            max_priority: None,
            arguments: Map::new(),
        }
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// The explicit bound, else the `x-max-priority` argument.
    pub fn effective_max_priority(&self) -> Option<u8> {
        self.max_priority
            .or_else(|| max_priority_from(&self.arguments))
    }
}

pub(crate) fn max_priority_from(arguments: &Map<String, Value>) -> Option<u8> {
    arguments
        .get(MAX_PRIORITY_ARG)
        .and_then(Value::as_u64)
        .map(|v| v.min(u64::from(u8::MAX)) as u8)
}

/// Descriptive record kept next to the broker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    pub id: String,
    pub queue_name: String,
    /// Model / worker type the queue routes to.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub durable: bool,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl QueueMetadata {
    pub fn from_declaration(
        declaration: &QueueDeclaration,
        model: Option<String>,
        description: Option<String>,
    ) -> Self {
        let mut arguments = declaration.arguments.clone();
        if let Some(max) = declaration.max_priority {
            arguments.insert(MAX_PRIORITY_ARG.to_string(), Value::from(max));
        }
        Self {
            id: ulid::Ulid::new().to_string().to_ascii_lowercase(),
            queue_name: declaration.name.clone(),
            model,
            description,
            durable: declaration.durable,
            arguments,
        }
    }

    pub fn max_priority(&self) -> Option<u8> {
        max_priority_from(&self.arguments)
    }
}

/// Mutable part of [`QueueMetadata`]. Durability and arguments are fixed
/// at declaration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadataUpdate {
    pub model: Option<String>,
    pub description: Option<String>,
}

impl QueueMetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.description.is_none()
    }

    /// Returns whether anything changed.
    pub fn apply(&self, metadata: &mut QueueMetadata) -> bool {
        let mut changed = false;
        if let Some(model) = &self.model
            && metadata.model.as_ref() != Some(model)
        {
            metadata.model = Some(model.clone());
            changed = true;
        }
        if let Some(description) = &self.description
            && metadata.description.as_ref() != Some(description)
        {
            metadata.description = Some(description.clone());
            changed = true;
        }
        changed
    }
}

/// Live broker counters for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub consumers: u32,
    pub messages: u32,
}

/// Metadata merged with live counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub id: String,
    pub queue_name: String,
    pub model: Option<String>,
    pub description: Option<String>,
    pub consumers_count: u32,
    pub messages_count: u32,
}

impl QueueSummary {
    pub fn merge(metadata: QueueMetadata, stats: &QueueStats) -> Self {
        Self {
            id: metadata.id,
            queue_name: metadata.queue_name,
            model: metadata.model,
            description: metadata.description,
            consumers_count: stats.consumers,
            messages_count: stats.messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub queue: String,
    pub consumer_tag: String,
    pub active: bool,
    pub prefetch: u16,
    pub ack_required: bool,
}
