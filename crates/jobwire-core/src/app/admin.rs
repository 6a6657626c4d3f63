//! QueueAdmin - queue の管理操作
//!
//! # 二段階の書き込み
//! 1. broker（配送可否の正本）
//! 2. metadata store（説明用。失敗しても `warn!` だけで操作自体は成功扱い）
//!
//! メッセージ単位の操作（一覧・削除）は broker API の制約で drain して戻す O(n) の処理。
//! 管理用の稀な操作としてだけ使うこと。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    ConsumerInfo, GetOptions, Headers, QueueDeclaration, QueueMetadata, QueueMetadataUpdate,
    QueueSummary, ReceivedMessage,
};
use crate::error::JobwireError;
use crate::ports::{MessageQueue, QueueMetadataStore};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclarationRequest {
    pub declaration: QueueDeclaration,
    pub model: Option<String>,
    pub description: Option<String>,
}

impl QueueDeclarationRequest {
    pub fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            model: None,
            description: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A resident message as seen by [`QueueAdmin::list_messages`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectedMessage {
    /// Envelope id when the body is a task envelope.
    pub job_id: Option<String>,
    pub priority: Option<u8>,
    pub headers: Headers,
    pub body: Value,
}

impl InspectedMessage {
    fn from_received(message: &ReceivedMessage) -> Self {
        Self {
            job_id: message.envelope().ok().map(|e| e.id().to_string()),
            priority: message.priority,
            headers: message.headers.clone(),
            body: message.body_json(),
        }
    }
}

pub struct QueueAdmin {
    queue: Arc<dyn MessageQueue>,
    metadata: Arc<dyn QueueMetadataStore>,
}

impl QueueAdmin {
    pub fn new(queue: Arc<dyn MessageQueue>, metadata: Arc<dyn QueueMetadataStore>) -> Self {
        Self { queue, metadata }
    }

    /// Declare at the broker, then record metadata. Redeclaring keeps the
    /// existing metadata id.
    #[instrument(skip_all, fields(queue = %request.declaration.name))]
    pub async fn declare_queue(
        &self,
        request: QueueDeclarationRequest,
    ) -> Result<QueueMetadata, JobwireError> {
        self.queue.declare_queue(&request.declaration).await?;

        let mut metadata =
            QueueMetadata::from_declaration(&request.declaration, request.model, request.description);
        match self.metadata.get(&metadata.queue_name).await {
            Ok(Some(existing)) => metadata.id = existing.id,
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not read existing queue metadata"),
        }
        if let Err(err) = self.metadata.insert(metadata.clone()).await {
            warn!(error = %err, "queue declared but metadata was not stored");
        }
        info!(id = %metadata.id, "queue declared");
        Ok(metadata)
    }

    /// Returns the number of messages dropped with the queue.
    #[instrument(skip_all, fields(queue = %name))]
    pub async fn delete_queue(&self, name: &str) -> Result<u32, JobwireError> {
        let dropped = self.queue.delete_queue(name).await?;
        match self.metadata.delete(name).await {
            Ok(true) => {}
            Ok(false) => debug!("queue had no metadata record"),
            Err(err) => warn!(error = %err, "queue deleted but metadata was not removed"),
        }
        info!(dropped, "queue deleted");
        Ok(dropped)
    }

    /// Only model / description change; durability and arguments are fixed.
    #[instrument(skip_all, fields(queue = %name))]
    pub async fn update_queue(
        &self,
        name: &str,
        update: QueueMetadataUpdate,
    ) -> Result<QueueMetadata, JobwireError> {
        if !self.metadata.update(name, &update).await? {
            return Err(JobwireError::not_found("queue metadata", name));
        }
        let metadata = self
            .metadata
            .get(name)
            .await?
            .ok_or_else(|| JobwireError::not_found("queue metadata", name))?;
        info!("queue metadata updated");
        Ok(metadata)
    }

    /// Irreversible.
    #[instrument(skip_all, fields(queue = %name))]
    pub async fn purge_queue(&self, name: &str) -> Result<u32, JobwireError> {
        let purged = self.queue.purge_queue(name).await?;
        info!(purged, "queue purged");
        Ok(purged)
    }

    /// Broker counters merged with metadata. Queues without metadata are skipped.
    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>, JobwireError> {
        let mut summaries = Vec::new();
        for stats in self.queue.list_queues().await? {
            match self.metadata.get(&stats.name).await? {
                Some(metadata) => summaries.push(QueueSummary::merge(metadata, &stats)),
                None => debug!(queue = %stats.name, "skipping queue without metadata"),
            }
        }
        Ok(summaries)
    }

    pub async fn active_workers(&self) -> Result<Vec<ConsumerInfo>, JobwireError> {
        let consumers = self.queue.active_consumers().await?;
        Ok(consumers.into_iter().filter(|c| c.active).collect())
    }

    /// Snapshot of every resident message. Messages are fetched without ack
    /// and requeued, so they stay in the queue with their priority.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn list_messages(&self, queue: &str) -> Result<Vec<InspectedMessage>, JobwireError> {
        let drained = self.drain(queue).await?;
        let inspected = drained.iter().map(InspectedMessage::from_received).collect();
        self.requeue_all(drained).await?;
        Ok(inspected)
    }

    /// Remove every message whose envelope id is `message_id`.
    ///
    /// Returns `false` when nothing matched. The rest of the queue goes back
    /// with its original priority and headers.
    #[instrument(skip_all, fields(queue = %queue, message_id = %message_id))]
    pub async fn remove_message(&self, queue: &str, message_id: &str) -> Result<bool, JobwireError> {
        let drained = self.drain(queue).await?;
        let (matched, kept): (Vec<_>, Vec<_>) = drained.into_iter().partition(|m| {
            m.envelope()
                .map(|e| e.id().as_str() == message_id)
                .unwrap_or(false)
        });

        for message in &matched {
            if let Err(err) = self.queue.ack(&message.delivery_tag).await {
                // 残りは戻してからエラーを返す
                self.requeue_all(kept).await?;
                return Err(err);
            }
        }
        self.requeue_all(kept).await?;

        if matched.is_empty() {
            debug!("no message matched");
            return Ok(false);
        }
        info!(removed = matched.len(), "message removed from queue");
        Ok(true)
    }

    /// Fetch without ack until the queue is empty. On failure whatever was
    /// taken goes back before the error is returned.
    async fn drain(&self, queue: &str) -> Result<Vec<ReceivedMessage>, JobwireError> {
        let mut drained = Vec::new();
        loop {
            match self.queue.get(queue, GetOptions::default()).await {
                Ok(Some(message)) => drained.push(message),
                Ok(None) => return Ok(drained),
                Err(err) => {
                    if let Err(requeue_err) = self.requeue_all(drained).await {
                        warn!(error = %requeue_err, "failed to requeue drained messages");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Nack with requeue, newest first so list-mode backends end up in the
    /// original order.
    async fn requeue_all(&self, messages: Vec<ReceivedMessage>) -> Result<(), JobwireError> {
        let mut first_err = None;
        for message in messages.into_iter().rev() {
            if let Err(err) = self.queue.nack(&message.delivery_tag, true).await {
                warn!(tag = %message.delivery_tag, error = %err, "requeue failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConsumeOptions, JobId, PublishOptions, TaskEnvelope};
    use crate::impls::{InMemoryBroker, InMemoryMetadataStore};
    use serde_json::json;
    use std::time::Duration;

    async fn admin() -> (Arc<InMemoryBroker>, Arc<InMemoryMetadataStore>, QueueAdmin) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let admin = QueueAdmin::new(broker.clone(), metadata.clone());
        (broker, metadata, admin)
    }

    async fn publish_job(broker: &InMemoryBroker, queue: &str, id: &str, priority: Option<u8>) {
        let envelope = TaskEnvelope::new(JobId::new(id), "generate", json!({}));
        broker
            .publish(
                queue,
                &envelope.encode().unwrap(),
                PublishOptions::default()
                    .with_priority(priority)
                    .with_header("job_id", id),
            )
            .await
            .unwrap();
    }

    async fn drain_ids(broker: &InMemoryBroker, queue: &str) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(m) = broker.get(queue, GetOptions::default().auto_ack()).await.unwrap() {
            ids.push(m.envelope().unwrap().id().to_string());
        }
        ids
    }

    #[tokio::test]
    async fn declare_records_metadata_and_keeps_id_on_redeclare() {
        let (_broker, metadata, admin) = admin().await;
        let request = QueueDeclarationRequest::new(QueueDeclaration::new("q").with_max_priority(10))
            .with_model("gpt")
            .with_description("chat jobs");

        let first = admin.declare_queue(request.clone()).await.unwrap();
        let second = admin.declare_queue(request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.max_priority(), Some(10));
        assert_eq!(metadata.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_touches_only_descriptive_fields() {
        let (_broker, _metadata, admin) = admin().await;
        admin
            .declare_queue(QueueDeclarationRequest::new(
                QueueDeclaration::new("q").with_max_priority(5),
            ))
            .await
            .unwrap();

        let updated = admin
            .update_queue(
                "q",
                QueueMetadataUpdate {
                    model: Some("llama".into()),
                    description: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.model.as_deref(), Some("llama"));
        assert_eq!(updated.max_priority(), Some(5));

        let err = admin
            .update_queue("unknown", QueueMetadataUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_skips_queues_without_metadata() {
        let (broker, _metadata, admin) = admin().await;
        admin
            .declare_queue(QueueDeclarationRequest::new(QueueDeclaration::new("described")))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDeclaration::new("bare"))
            .await
            .unwrap();
        publish_job(&broker, "described", "a", None).await;

        let summaries = admin.list_queues().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].queue_name, "described");
        assert_eq!(summaries[0].messages_count, 1);
    }

    #[tokio::test]
    async fn delete_removes_both_sides() {
        let (broker, metadata, admin) = admin().await;
        admin
            .declare_queue(QueueDeclarationRequest::new(QueueDeclaration::new("q")))
            .await
            .unwrap();
        publish_job(&broker, "q", "a", None).await;

        assert_eq!(admin.delete_queue("q").await.unwrap(), 1);
        assert!(metadata.get("q").await.unwrap().is_none());
        assert!(admin.delete_queue("q").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn purge_empties_the_queue() {
        let (broker, _metadata, admin) = admin().await;
        broker.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        for id in ["a", "b", "c"] {
            publish_job(&broker, "q", id, None).await;
        }

        assert_eq!(admin.purge_queue("q").await.unwrap(), 3);
        assert!(broker.get("q", GetOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_messages_is_non_destructive() {
        let (broker, _metadata, admin) = admin().await;
        broker
            .declare_queue(&QueueDeclaration::new("q").with_max_priority(10))
            .await
            .unwrap();
        publish_job(&broker, "q", "low", Some(1)).await;
        publish_job(&broker, "q", "high", Some(9)).await;

        let listed = admin.list_messages("q").await.unwrap();
        let ids: Vec<_> = listed.iter().filter_map(|m| m.job_id.clone()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert_eq!(listed[0].priority, Some(9));
        assert_eq!(listed[0].headers["job_id"], json!("high"));

        assert_eq!(broker.unacked_count().await, 0);
        assert_eq!(drain_ids(&broker, "q").await, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn remove_message_keeps_the_rest_in_order() {
        let (broker, _metadata, admin) = admin().await;
        broker
            .declare_queue(&QueueDeclaration::new("q").with_max_priority(10))
            .await
            .unwrap();
        publish_job(&broker, "q", "a", Some(1)).await;
        publish_job(&broker, "q", "b", Some(5)).await;
        publish_job(&broker, "q", "c", Some(1)).await;

        assert!(admin.remove_message("q", "b").await.unwrap());
        assert!(!admin.remove_message("q", "b").await.unwrap());
        assert_eq!(drain_ids(&broker, "q").await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn active_workers_lists_running_consumers() {
        let (broker, _metadata, admin) = admin().await;
        broker.declare_queue(&QueueDeclaration::new("q")).await.unwrap();

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let callback = Arc::new(|_m: ReceivedMessage| async {});
                broker
                    .consume(
                        "q",
                        callback,
                        ConsumeOptions::default().with_consumer_tag("w1"),
                    )
                    .await
            })
        };
        // consumer が登録されるまで待つ
        let mut workers = Vec::new();
        for _ in 0..50 {
            workers = admin.active_workers().await.unwrap();
            if !workers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].consumer_tag, "w1");

        broker.cancel("w1").await.unwrap();
        consumer.await.unwrap().unwrap();
    }
}
