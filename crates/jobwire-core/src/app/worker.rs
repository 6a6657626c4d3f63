//! Worker - consume → IN_PROGRESS → handler → terminal status → ack
//!
//! # 配送 1 件の扱い
//! | 状況 | status | broker |
//! |---|---|---|
//! | envelope が壊れている | 触らない | nack(requeue=false) |
//! | handler 成功 / 失敗 / 未登録 | COMPLETED / ERROR | ack |
//! | status store に書けない | そのまま | nack(requeue=true) |
//! | すでに終端状態（再配送） | そのまま | ack |
//!
//! 重要: handler の実行は consume の callback 内で完結させる（prefetch 件数までしか並ばない）。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use ulid::Ulid;

use crate::domain::{
    ConsumeOptions, JobId, JobStatusError, JobStatusType, ReceivedMessage, TaskEnvelope,
};
use crate::error::JobwireError;
use crate::ports::{MessageCallback, MessageQueue, ResultStorage};
use crate::retry::RetryPolicy;
use crate::typed::HandlerRegistry;

pub const IN_PROGRESS_MESSAGE: &str = "Job running on worker";
pub const COMPLETED_MESSAGE: &str = "Job completed";
pub const FAILED_MESSAGE: &str = "Job failed";

/// Built by [`super::WorkerBuilder`].
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn MessageQueue>,
    storage: Arc<dyn ResultStorage>,
    registry: Arc<HandlerRegistry>,
    options: ConsumeOptions,
    retry: RetryPolicy,
}

/// What to do with the delivery once processing stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    Drop,
}

impl Worker {
    pub(crate) fn new(
        queue: Arc<dyn MessageQueue>,
        storage: Arc<dyn ResultStorage>,
        registry: Arc<HandlerRegistry>,
        options: ConsumeOptions,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            storage,
            registry,
            options,
            retry,
        }
    }

    /// Consume `queue` until the subscription is cancelled.
    pub async fn run(&self, queue: &str) -> Result<(), JobwireError> {
        info!(
            queue,
            backend = self.queue.backend_name(),
            prefetch = self.options.prefetch,
            handlers = ?self.registry.registered_types(),
            "worker starting"
        );
        let callback: Arc<dyn MessageCallback> = Arc::new(self.clone());
        self.queue
            .consume(queue, callback, self.options.clone())
            .await
    }

    /// Run on a dedicated tokio task.
    pub fn spawn(mut self, queue: impl Into<String>) -> WorkerHandle {
        let queue_name = queue.into();
        let consumer_tag = self
            .options
            .consumer_tag
            .get_or_insert_with(|| format!("worker-{}", Ulid::new().to_string().to_ascii_lowercase()))
            .clone();
        // run() は途中で落とさない。consume の終了処理（consumer の登録解除）を必ず通す
        let token = CancellationToken::new();
        self.options.shutdown = Some(token.clone());

        let join = {
            let queue_name = queue_name.clone();
            tokio::spawn(async move { self.run(&queue_name).await })
        };

        WorkerHandle {
            consumer_tag,
            queue_name,
            token,
            join,
        }
    }

    async fn handle_delivery(&self, message: ReceivedMessage) {
        let settlement = match TaskEnvelope::from_message(&message) {
            Ok(envelope) => {
                let span = info_span!("job", job_id = %envelope.id(), task = %envelope.task());
                self.process(envelope).instrument(span).await
            }
            Err(err) => {
                error!(tag = %message.delivery_tag, error = %err, "poison message, dropping");
                Settlement::Drop
            }
        };

        if self.options.auto_ack {
            return;
        }
        let result = match settlement {
            Settlement::Ack => self.queue.ack(&message.delivery_tag).await,
            Settlement::Requeue => self.queue.nack(&message.delivery_tag, true).await,
            Settlement::Drop => self.queue.nack(&message.delivery_tag, false).await,
        };
        if let Err(err) = result {
            warn!(tag = %message.delivery_tag, ?settlement, error = %err, "failed to settle delivery");
        }
    }

    async fn process(&self, envelope: TaskEnvelope) -> Settlement {
        let job_id = envelope.id().clone();

        match self.mark_in_progress(&job_id).await {
            Ok(()) => {}
            Err(JobwireError::TerminalState(_)) => {
                info!("job already finished, acknowledging redelivery");
                return Settlement::Ack;
            }
            Err(err) => {
                error!(error = %err, "could not mark job in progress");
                return Settlement::Requeue;
            }
        }

        let outcome = match self.registry.get(envelope.task().as_str()) {
            Some(handler) => handler.handle_dyn(envelope.kwargs().clone()).await,
            None => Err(JobStatusError::new(
                "HandlerNotFound",
                format!("no handler registered for task type '{}'", envelope.task()),
            )),
        };

        let (result, job_error, message) = match outcome {
            Ok(result) => (Some(result), None, COMPLETED_MESSAGE),
            Err(job_error) => {
                warn!(error = %job_error, "job failed");
                (None, Some(job_error), FAILED_MESSAGE)
            }
        };

        let stored = self
            .retry
            .run("complete_job", || {
                self.storage.complete_job(
                    &job_id,
                    result.clone(),
                    job_error.clone(),
                    Some(message.to_string()),
                )
            })
            .await;
        match stored {
            Ok(()) => {
                debug!(failed = job_error.is_some(), "job settled");
                Settlement::Ack
            }
            Err(JobwireError::TerminalState(_)) => Settlement::Ack,
            Err(err) => {
                error!(error = %err, "could not store job result");
                Settlement::Requeue
            }
        }
    }

    /// A missing status record is recreated so that the result is not lost.
    async fn mark_in_progress(&self, job_id: &JobId) -> Result<(), JobwireError> {
        let update = || {
            self.storage.update_job_status(
                job_id,
                JobStatusType::InProgress,
                Some(IN_PROGRESS_MESSAGE.to_string()),
            )
        };
        match self.retry.run("update_job_status", update).await {
            Err(err) if err.is_not_found() => {
                warn!("job has no status record, creating one");
                self.retry
                    .run("create_job_status", || self.storage.create_job_status(job_id))
                    .await?;
                self.retry.run("update_job_status", update).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl MessageCallback for Worker {
    async fn on_message(&self, message: ReceivedMessage) {
        self.handle_delivery(message).await;
    }
}

/// Handle to a spawned [`Worker`].
/// - `shutdown()` で subscription を cancel し、task の終了を待つ
/// - 実行中の handler は中断しない（今の 1 件を終えてから止まる）
pub struct WorkerHandle {
    consumer_tag: String,
    queue_name: String,
    token: CancellationToken,
    join: JoinHandle<Result<(), JobwireError>>,
}

impl WorkerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Cancel the subscription and wait for the worker task.
    ///
    /// Works before the consumer is registered too: the backend sees the
    /// cancelled token, registers nothing that outlives the call, and returns.
    pub async fn shutdown(self) -> Result<(), JobwireError> {
        self.token.cancel();
        self.join
            .await
            .map_err(|e| JobwireError::Connection(format!("worker task failed: {e}")))?
    }
}
