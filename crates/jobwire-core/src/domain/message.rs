//! Consumption-side message types and per-call options.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::envelope::TaskEnvelope;
use crate::error::JobwireError;

/// Message headers (AMQP-style application headers).
pub type Headers = serde_json::Map<String, Value>;

/// Opaque handle for a fetched, not yet settled message.
///
/// Valid only on the backend that produced it and only until the message is
/// acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag {
    queue: String,
    value: String,
}

impl DeliveryTag {
    pub fn new(queue: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            value: value.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queue, self.value)
    }
}

/// A message between fetch and acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub body: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    pub headers: Headers,
    pub routing_key: Option<String>,
    /// Priority as observed by the backend.
    pub priority: Option<u8>,
    pub redelivered: bool,
}

impl ReceivedMessage {
    pub fn envelope(&self) -> Result<TaskEnvelope, JobwireError> {
        TaskEnvelope::from_message(self)
    }

    /// Body parsed as JSON, or the lossy text when it is not JSON.
    pub fn body_json(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub priority: Option<u8>,
    pub headers: Headers,
    /// Survive a broker restart (AMQP delivery mode 2).
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            priority: None,
            headers: Headers::new(),
            persistent: true,
        }
    }
}

impl PublishOptions {
    pub fn with_priority(mut self, priority: Option<u8>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    /// `None` polls once and returns immediately.
    pub timeout: Option<Duration>,
    pub auto_ack: bool,
}

impl GetOptions {
    pub fn wait(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            auto_ack: false,
        }
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    /// Max unacked deliveries per consumer; 0 means unbounded.
    pub prefetch: u16,
    /// Generated when absent.
    pub consumer_tag: Option<String>,
    /// Cancelling this token ends the subscription like `cancel(tag)`,
    /// including before the consumer is registered.
    pub shutdown: Option<CancellationToken>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            prefetch: 1,
            consumer_tag: None,
            shutdown: None,
        }
    }
}

impl ConsumeOptions {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Token for one subscription. Backends stop the consume loop on it and
    /// unregister the consumer on the way out.
    pub fn subscription_token(&self) -> CancellationToken {
        self.shutdown
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default()
    }
}
