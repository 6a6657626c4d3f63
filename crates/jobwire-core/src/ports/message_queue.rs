//! MessageQueue port - broker-backed / store-backed で共通の契約
//!
//! # 設計原則
//! - priority 付きで宣言された queue は、その時点で滞留しているメッセージの中で
//!   priority の高いものから配送する。同じ priority 内は FIFO
//! - 空の queue は `Ok(None)` であってエラーではない
//! - transport エラーはここではリトライしない（呼び出し側の [`crate::retry::RetryPolicy`]）
//! - `consume` は cancel されるまで返らない。専用の tokio task で回すこと

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    ConsumeOptions, ConsumerInfo, DeliveryTag, GetOptions, PublishOptions, QueueDeclaration,
    QueueStats, ReceivedMessage,
};
use crate::error::JobwireError;

/// Invoked once per delivery by [`MessageQueue::consume`].
///
/// The callback owns settling the message (ack / nack) unless the
/// subscription uses `auto_ack`.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    async fn on_message(&self, message: ReceivedMessage);
}

#[async_trait]
impl<F, Fut> MessageCallback for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_message(&self, message: ReceivedMessage) {
        (self)(message).await
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Idempotent.
    async fn connect(&self) -> Result<(), JobwireError>;

    /// Idempotent for identical arguments; a differing redeclaration is a
    /// validation error.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), JobwireError>;

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), JobwireError>;

    /// Single-shot fetch honoring priority order.
    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<ReceivedMessage>, JobwireError>;

    /// Standing subscription. Returns `Ok(())` once cancelled.
    async fn consume(
        &self,
        queue: &str,
        callback: Arc<dyn MessageCallback>,
        options: ConsumeOptions,
    ) -> Result<(), JobwireError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), JobwireError>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), JobwireError>;

    /// `requeue = true` makes the message eligible again with its original priority.
    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), JobwireError>;

    /// Cancels every subscription, then releases the connection.
    async fn close(&self) -> Result<(), JobwireError>;

    /// Returns the number of messages dropped with the queue.
    async fn delete_queue(&self, name: &str) -> Result<u32, JobwireError>;

    /// Returns the number of messages removed.
    async fn purge_queue(&self, name: &str) -> Result<u32, JobwireError>;

    async fn queue_stats(&self, name: &str) -> Result<QueueStats, JobwireError>;

    async fn list_queues(&self) -> Result<Vec<QueueStats>, JobwireError>;

    async fn active_consumers(&self) -> Result<Vec<ConsumerInfo>, JobwireError>;
}
