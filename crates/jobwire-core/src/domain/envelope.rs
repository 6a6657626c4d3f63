//! TaskEnvelope - キューに載る 1 件の仕事
//!
//! wire 形式（JSON）:
//! ```json
//! {"type":"task","task":"generate","args":[],"kwargs":{...},"id":"<jobId>","retries":0,"eta":null}
//! ```
//! `priority` はこの形式に無いフィールドなので、値があるときだけ追加で書き出す。
//! 古い producer が書いた（priority なしの）body は broker 側の priority
//! プロパティから [`TaskEnvelope::from_message`] で補う。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{JobId, TaskType};
use super::message::ReceivedMessage;
use crate::error::JobwireError;

/// Value of the `type` discriminator every envelope carries.
pub const ENVELOPE_KIND: &str = "task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    kind: String,
    task: TaskType,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Value,
    id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
    /// Reserved for a redelivery policy; always 0 today.
    #[serde(default)]
    retries: u32,
    /// Reserved for delayed delivery; always null today.
    #[serde(default)]
    eta: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    pub fn new(id: JobId, task: impl Into<TaskType>, kwargs: Value) -> Self {
        Self {
            kind: ENVELOPE_KIND.to_string(),
            task: task.into(),
            args: Vec::new(),
            kwargs,
            id,
            priority: None,
            retries: 0,
            eta: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn task(&self) -> &TaskType {
        &self.task
    }

    pub fn kwargs(&self) -> &Value {
        &self.kwargs
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    /// Check the envelope against the target queue's declared priority bound.
    pub fn validate(&self, max_priority: Option<u8>) -> Result<(), JobwireError> {
        if self.id.is_blank() {
            return Err(JobwireError::validation("job id must not be empty"));
        }
        if self.task.as_str().is_empty() {
            return Err(JobwireError::validation("task type must not be empty"));
        }
        validate_priority(self.priority, max_priority)
    }

    pub fn encode(&self) -> Result<Vec<u8>, JobwireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body. Anything that is not a task envelope is a
    /// protocol error so the consumer can drop it instead of looping on it.
    pub fn decode(body: &[u8]) -> Result<Self, JobwireError> {
        let envelope: Self = serde_json::from_slice(body)
            .map_err(|e| JobwireError::protocol(format!("malformed task envelope: {e}")))?;
        if envelope.kind != ENVELOPE_KIND {
            return Err(JobwireError::protocol(format!(
                "unexpected message type '{}'",
                envelope.kind
            )));
        }
        Ok(envelope)
    }

    pub fn from_message(message: &ReceivedMessage) -> Result<Self, JobwireError> {
        let mut envelope = Self::decode(&message.body)?;
        if envelope.priority.is_none() {
            envelope.priority = message.priority;
        }
        Ok(envelope)
    }
}

/// Priority must fit the queue's declared bound. Without a bound the value
/// is accepted and has no effect on ordering.
pub fn validate_priority(priority: Option<u8>, max_priority: Option<u8>) -> Result<(), JobwireError> {
    match (priority, max_priority) {
        (Some(p), Some(max)) if p > max => Err(JobwireError::validation(format!(
            "priority {p} exceeds the queue's max priority {max}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::DeliveryTag;
    use rstest::rstest;
    use serde_json::json;

    fn sample() -> TaskEnvelope {
        TaskEnvelope::new(
            JobId::new("j1"),
            "generate",
            json!({"messages": [{"role": "user", "content": "hi"}], "meta": {"nested": [1, 2, {"x": null}]}}),
        )
    }

    #[test]
    fn wire_shape_matches_the_task_protocol() {
        let value: Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["task"], "generate");
        assert_eq!(value["args"], json!([]));
        assert_eq!(value["id"], "j1");
        assert_eq!(value["retries"], 0);
        assert_eq!(value["eta"], Value::Null);
        // priority なしのときはキー自体を出さない
        assert!(value.get("priority").is_none());
    }

    #[test]
    fn survives_the_wire_with_priority_and_nested_payload() {
        let original = sample().with_priority(7);
        let decoded = TaskEnvelope::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.priority(), Some(7));
    }

    #[test]
    fn decodes_envelopes_from_other_producers() {
        let body = br#"{"type":"task","task":"generate","args":[],"kwargs":{"a":1},"id":"x","retries":0,"eta":null}"#;
        let envelope = TaskEnvelope::decode(body).unwrap();
        assert_eq!(envelope.id().as_str(), "x");
        assert_eq!(envelope.kwargs()["a"], 1);
        assert_eq!(envelope.priority(), None);
    }

    #[rstest]
    #[case(b"not json".as_slice())]
    #[case(br#"{"type":"event","task":"t","id":"x"}"#.as_slice())]
    #[case(br#"{"type":"task","task":"t","id":"x","priority":-1}"#.as_slice())]
    fn rejects_malformed_bodies_as_protocol_errors(#[case] body: &[u8]) {
        let err = TaskEnvelope::decode(body).unwrap_err();
        assert!(matches!(err, JobwireError::Protocol(_)), "{err}");
    }

    #[rstest]
    #[case(Some(5), Some(10), true)]
    #[case(Some(10), Some(10), true)]
    #[case(Some(11), Some(10), false)]
    #[case(Some(200), None, true)]
    #[case(None, Some(10), true)]
    fn priority_bound(#[case] priority: Option<u8>, #[case] max: Option<u8>, #[case] ok: bool) {
        assert_eq!(validate_priority(priority, max).is_ok(), ok);
    }

    #[test]
    fn blank_job_id_is_rejected() {
        let envelope = TaskEnvelope::new(JobId::new(""), "generate", json!({}));
        assert!(matches!(envelope.validate(None), Err(JobwireError::Validation(_))));
    }

    #[test]
    fn observed_priority_fills_a_missing_field() {
        let message = ReceivedMessage {
            body: sample().encode().unwrap(),
            delivery_tag: DeliveryTag::new("q", "1"),
            headers: Default::default(),
            routing_key: Some("q".into()),
            priority: Some(3),
            redelivered: false,
        };
        assert_eq!(TaskEnvelope::from_message(&message).unwrap().priority(), Some(3));
    }
}
