//! Dispatcher - publish 側の薄いオーケストレーション
//!
//! 守るべき性質は 1 つだけ: **status を作ってから publish する**。
//! 逆順だと速い worker が status record の無い job を完了させてしまう。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::WaitConfig;
use crate::domain::{
    JobId, JobStatusError, JobStatusType, PublishOptions, QueueDeclaration, TaskEnvelope,
};
use crate::error::JobwireError;
use crate::ports::{MessageQueue, QueueMetadataStore, ResultStorage};
use crate::retry::RetryPolicy;

/// Header carrying the job id next to the body.
pub const JOB_ID_HEADER: &str = "job_id";

/// Unwrapped terminal status.
///
/// ジョブの失敗（`Failed`）と待ちのタイムアウト（`Err(Timeout)`）は別物として返す。
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Option<String>),
    Failed(JobStatusError),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// # 使用例
/// ```ignore
/// let dispatcher = Dispatcher::new(queue, storage).with_metadata(metadata);
/// let job_id = dispatcher.submit("llm-api-queue", envelope).await?;
/// match dispatcher.get_result(&job_id, None).await? {
///     JobOutcome::Completed(result) => println!("{result:?}"),
///     JobOutcome::Failed(err) => eprintln!("{}: {}", err.kind, err.msg),
/// }
/// ```
pub struct Dispatcher {
    queue: Arc<dyn MessageQueue>,
    storage: Arc<dyn ResultStorage>,
    metadata: Option<Arc<dyn QueueMetadataStore>>,
    declarations: RwLock<HashMap<String, Option<u8>>>,
    wait: WaitConfig,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>, storage: Arc<dyn ResultStorage>) -> Self {
        Self {
            queue,
            storage,
            metadata: None,
            declarations: RwLock::new(HashMap::new()),
            wait: WaitConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn QueueMetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remember a queue's priority bound without a metadata round trip.
    pub async fn remember(&self, declaration: &QueueDeclaration) {
        self.declarations
            .write()
            .await
            .insert(declaration.name.clone(), declaration.effective_max_priority());
    }

    /// Declared bound from the local cache, then the metadata store.
    async fn max_priority(&self, queue: &str) -> Result<Option<u8>, JobwireError> {
        if let Some(max) = self.declarations.read().await.get(queue) {
            return Ok(*max);
        }
        let Some(metadata) = &self.metadata else {
            return Ok(None);
        };
        let max = metadata.get(queue).await?.and_then(|m| m.max_priority());
        if max.is_some() {
            self.declarations.write().await.insert(queue.to_string(), max);
        }
        Ok(max)
    }

    /// Publish without touching the status store.
    ///
    /// Callers that want to wait must create the status first (see [`Self::submit`]).
    #[instrument(skip_all, fields(queue = %queue, job_id = %envelope.id()))]
    pub async fn send_task(&self, queue: &str, envelope: &TaskEnvelope) -> Result<(), JobwireError> {
        let max_priority = self.max_priority(queue).await?;
        envelope.validate(max_priority)?;
        let body = envelope.encode()?;

        self.retry
            .run("publish", || {
                let options = PublishOptions::default()
                    .with_priority(envelope.priority())
                    .with_header(JOB_ID_HEADER, envelope.id().as_str());
                self.queue.publish(queue, &body, options)
            })
            .await?;
        info!(task = %envelope.task(), priority = ?envelope.priority(), "task published");
        Ok(())
    }

    /// `create_job_status` → `send_task`.
    ///
    /// publish に失敗した場合は status を ERROR(`PublishError`) にしてから元のエラーを返す。
    /// そうしないと待ち手が PENDING のまま deadline まで待ってしまう。
    #[instrument(skip_all, fields(queue = %queue, job_id = %envelope.id()))]
    pub async fn submit(&self, queue: &str, envelope: TaskEnvelope) -> Result<JobId, JobwireError> {
        let job_id = envelope.id().clone();
        // 形式エラーで status だけ残らないよう先に検証
        envelope.validate(self.max_priority(queue).await?)?;

        self.retry
            .run("create_job_status", || self.storage.create_job_status(&job_id))
            .await?;

        if let Err(err) = self.send_task(queue, &envelope).await {
            let marked = self
                .storage
                .complete_job(
                    &job_id,
                    None,
                    Some(JobStatusError::new("PublishError", err.to_string())),
                    Some("Job could not be queued".into()),
                )
                .await;
            if let Err(mark_err) = marked {
                warn!(error = %mark_err, "failed to record publish failure");
            }
            return Err(err);
        }
        Ok(job_id)
    }

    /// Wait for the job and unwrap its terminal status.
    ///
    /// `timeout` overrides the per-cycle wait; the cycle count comes from config.
    /// Timeout and NotFound surface unchanged.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn get_result(
        &self,
        job_id: &JobId,
        timeout: Option<Duration>,
    ) -> Result<JobOutcome, JobwireError> {
        let timeout = timeout.unwrap_or(self.wait.timeout);
        let status = self
            .storage
            .wait_for_completion(job_id, timeout, self.wait.update_cycles)
            .await?;
        debug!(status = %status.status, "job finished");

        match status.status {
            JobStatusType::Completed => Ok(JobOutcome::Completed(status.result)),
            JobStatusType::Error => Ok(JobOutcome::Failed(status.error.unwrap_or_else(|| {
                JobStatusError::new("JobError", status.status_message.unwrap_or_default())
            }))),
            other => Err(JobwireError::protocol(format!(
                "wait returned a non-terminal status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GetOptions, QueueMetadata};
    use crate::impls::{InMemoryBroker, InMemoryMetadataStore, InMemoryResultStorage};
    use serde_json::json;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        storage: Arc<InMemoryResultStorage>,
        dispatcher: Dispatcher,
    }

    async fn fixture(declaration: QueueDeclaration) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        broker.declare_queue(&declaration).await.unwrap();
        let storage = Arc::new(InMemoryResultStorage::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata
            .insert(QueueMetadata::from_declaration(&declaration, None, None))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(broker.clone(), storage.clone())
            .with_metadata(metadata)
            .with_retry(RetryPolicy::none())
            .with_wait(WaitConfig {
                timeout: Duration::from_secs(1),
                update_cycles: 2,
            });
        Fixture {
            broker,
            storage,
            dispatcher,
        }
    }

    fn envelope(id: &str, priority: Option<u8>) -> TaskEnvelope {
        let envelope = TaskEnvelope::new(JobId::new(id), "generate", json!({"prompt": id}));
        match priority {
            Some(p) => envelope.with_priority(p),
            None => envelope,
        }
    }

    #[tokio::test]
    async fn submit_creates_status_before_publishing() {
        let f = fixture(QueueDeclaration::new("q").with_max_priority(10)).await;
        let id = f.dispatcher.submit("q", envelope("j1", Some(5))).await.unwrap();

        let status = f.storage.get_job_status(&id).await.unwrap();
        assert_eq!(status.status, JobStatusType::Pending);

        let message = f.broker.get("q", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(message.priority, Some(5));
        assert_eq!(message.headers[JOB_ID_HEADER], json!("j1"));
        assert_eq!(message.envelope().unwrap(), envelope("j1", Some(5)));
    }

    #[tokio::test]
    async fn priority_above_metadata_bound_is_rejected_before_anything_is_written() {
        let f = fixture(QueueDeclaration::new("q").with_max_priority(3)).await;
        let err = f
            .dispatcher
            .submit("q", envelope("j1", Some(9)))
            .await
            .unwrap_err();

        assert!(matches!(err, JobwireError::Validation(_)));
        assert!(
            f.storage
                .get_job_status(&JobId::new("j1"))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(f.broker.get("q", GetOptions::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remembered_declaration_bounds_priority_without_metadata() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.connect().await.unwrap();
        let declaration = QueueDeclaration::new("q").with_max_priority(2);
        broker.declare_queue(&declaration).await.unwrap();
        let dispatcher = Dispatcher::new(broker, Arc::new(InMemoryResultStorage::new()));
        dispatcher.remember(&declaration).await;

        let err = dispatcher.send_task("q", &envelope("j", Some(3))).await.unwrap_err();
        assert!(matches!(err, JobwireError::Validation(_)));
    }

    #[tokio::test]
    async fn publish_failure_marks_the_job_as_failed() {
        let f = fixture(QueueDeclaration::new("q")).await;
        let err = f
            .dispatcher
            .submit("missing", envelope("j1", None))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let status = f.storage.get_job_status(&JobId::new("j1")).await.unwrap();
        assert_eq!(status.status, JobStatusType::Error);
        assert_eq!(status.error.unwrap().kind, "PublishError");
    }

    #[tokio::test]
    async fn get_result_unwraps_completed_and_failed_jobs() {
        let f = fixture(QueueDeclaration::new("q")).await;
        let ok = f.dispatcher.submit("q", envelope("ok", None)).await.unwrap();
        let bad = f.dispatcher.submit("q", envelope("bad", None)).await.unwrap();
        f.storage
            .complete_job(&ok, Some("42".into()), None, None)
            .await
            .unwrap();
        f.storage
            .complete_job(&bad, None, Some(JobStatusError::new("LLMError", "boom")), None)
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.get_result(&ok, None).await.unwrap(),
            JobOutcome::Completed(Some("42".into()))
        );
        assert_eq!(
            f.dispatcher.get_result(&bad, None).await.unwrap(),
            JobOutcome::Failed(JobStatusError::new("LLMError", "boom"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn get_result_distinguishes_timeout_from_failure() {
        let f = fixture(QueueDeclaration::new("q")).await;
        let id = f.dispatcher.submit("q", envelope("slow", None)).await.unwrap();

        let err = f.dispatcher.get_result(&id, None).await.unwrap_err();
        assert!(err.is_timeout());

        let err = f
            .dispatcher
            .get_result(&JobId::new("never-created"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
