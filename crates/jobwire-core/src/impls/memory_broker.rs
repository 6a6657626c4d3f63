//! InMemoryBroker - プロセス内で完結する broker
//!
//! # 実装詳細
//! - queue ごとに `BinaryHeap<ReadyEntry>`（priority 降順 → seq 昇順）
//! - queue ごとに `Notify`。publish / requeue / ack で待機中の get と consumer を起こす
//! - 未 ack のメッセージは delivery tag → [`Unacked`] で保持し、requeue 時は元の
//!   priority と seq に戻す（同じ band の中で元の位置に戻る）
//! - consumer ごとに prefetch（未 ack 数の上限）を数える
//!
//! 重要: ロックを保持したまま await しない。callback はロックの外で呼ぶ。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::domain::{
    ConsumeOptions, ConsumerInfo, DeliveryTag, GetOptions, Headers, PublishOptions,
    QueueDeclaration, QueueStats, ReceivedMessage, validate_priority,
};
use crate::error::JobwireError;
use crate::ports::{MessageCallback, MessageQueue};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    headers: Headers,
    priority: Option<u8>,
    redelivered: bool,
}

/// Heap entry. Higher `rank` first, then lower `seq` (insertion order).
#[derive(Debug)]
struct ReadyEntry {
    rank: u8,
    seq: u64,
    message: StoredMessage,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap は max-heap: rank が大きいほど先、seq は小さいほど先
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    declaration: QueueDeclaration,
    ready: BinaryHeap<ReadyEntry>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            ready: BinaryHeap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Ordering rank; queues without a priority bound are plain FIFO.
    fn rank(&self, priority: Option<u8>) -> u8 {
        match self.declaration.effective_max_priority() {
            Some(max) => priority.unwrap_or(0).min(max),
            None => 0,
        }
    }
}

/// A delivered message waiting for ack / nack.
struct Unacked {
    queue: String,
    rank: u8,
    seq: u64,
    message: StoredMessage,
    consumer: Option<String>,
}

struct ConsumerState {
    queue: String,
    prefetch: u16,
    auto_ack: bool,
    in_flight: usize,
    token: CancellationToken,
}

impl ConsumerState {
    fn saturated(&self) -> bool {
        !self.auto_ack && self.prefetch > 0 && self.in_flight >= usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<String, ConsumerState>,
    next_seq: u64,
    next_tag: u64,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Result<&QueueState, JobwireError> {
        self.queues
            .get(name)
            .ok_or_else(|| JobwireError::not_found("queue", name))
    }

    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn allocate_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Pop the next eligible message and register it as unacked unless `auto_ack`.
    fn take_next(
        &mut self,
        queue: &str,
        auto_ack: bool,
        consumer: Option<&str>,
    ) -> Result<Option<ReceivedMessage>, JobwireError> {
        let entry = match self.queues.get_mut(queue) {
            Some(q) => q.ready.pop(),
            None => return Err(JobwireError::not_found("queue", queue)),
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        let tag = self.allocate_tag();
        let message = ReceivedMessage {
            body: entry.message.body.clone(),
            delivery_tag: DeliveryTag::new(queue, tag.to_string()),
            headers: entry.message.headers.clone(),
            routing_key: Some(queue.to_string()),
            priority: entry.message.priority,
            redelivered: entry.message.redelivered,
        };

        if !auto_ack {
            if let Some(c) = consumer.and_then(|t| self.consumers.get_mut(t)) {
                c.in_flight += 1;
            }
            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    rank: entry.rank,
                    seq: entry.seq,
                    message: entry.message,
                    consumer: consumer.map(str::to_string),
                },
            );
        }
        Ok(Some(message))
    }

    /// Remove an unacked delivery and give its consumer a free prefetch slot.
    fn settle(&mut self, tag: &DeliveryTag) -> Result<Unacked, JobwireError> {
        let unacked = tag
            .value()
            .parse::<u64>()
            .ok()
            .and_then(|value| self.unacked.remove(&value))
            .ok_or_else(|| JobwireError::not_found("delivery tag", tag.to_string()))?;

        if let Some(c) = unacked
            .consumer
            .as_deref()
            .and_then(|t| self.consumers.get_mut(t))
        {
            c.in_flight = c.in_flight.saturating_sub(1);
        }
        Ok(unacked)
    }

    /// Put an unacked message back at its original position.
    fn requeue(&mut self, unacked: Unacked) -> Option<Arc<Notify>> {
        let queue = self.queues.get_mut(&unacked.queue)?;
        let mut message = unacked.message;
        message.redelivered = true;
        queue.ready.push(ReadyEntry {
            rank: unacked.rank,
            seq: unacked.seq,
            message,
        });
        Some(Arc::clone(&queue.notify))
    }

    fn consumer_count(&self, queue: &str) -> u32 {
        self.consumers.values().filter(|c| c.queue == queue).count() as u32
    }

    fn stats(&self, name: &str, queue: &QueueState) -> QueueStats {
        QueueStats {
            name: name.to_string(),
            consumers: self.consumer_count(name),
            messages: queue.ready.len() as u32,
        }
    }
}

/// 待機中の全員を起こし、まだ待っていない次の 1 人のために permit も残す
fn wake(notify: &Notify) {
    notify.notify_waiters();
    notify.notify_one();
}

/// In-process broker with native priority queues, delivery tags and consumers.
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.connect().await?;
/// broker.declare_queue(&QueueDeclaration::new("q").with_max_priority(10)).await?;
/// broker.publish("q", b"{}", PublishOptions::default().with_priority(Some(5))).await?;
/// let msg = broker.get("q", GetOptions::default()).await?;
/// ```
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connected: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            connected: AtomicBool::new(false),
        }
    }

    fn ensure_connected(&self) -> Result<(), JobwireError> {
        if self.connected.load(AtomicOrdering::Acquire) {
            Ok(())
        } else {
            Err(JobwireError::Connection(
                "in-memory broker is not connected".into(),
            ))
        }
    }

    /// Number of delivered but unsettled messages across all queues.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    async fn consume_loop(
        &self,
        queue: &str,
        consumer_tag: &str,
        token: &CancellationToken,
        notify: &Notify,
        callback: &dyn MessageCallback,
        auto_ack: bool,
    ) -> Result<(), JobwireError> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            // notified() は lock 中に作って enable しておく（取りこぼし防止）
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock().await;
                if !state.queues.contains_key(queue) {
                    debug!(queue, consumer_tag, "queue gone, ending subscription");
                    return Ok(());
                }
                let saturated = state
                    .consumers
                    .get(consumer_tag)
                    .is_some_and(ConsumerState::saturated);
                if saturated {
                    None
                } else {
                    state.take_next(queue, auto_ack, Some(consumer_tag))?
                }
            };

            match next {
                Some(message) => callback.on_message(message).await,
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    /// Drop a consumer registration; auto-delete queues go away with their
    /// last consumer.
    async fn unregister_consumer(&self, consumer_tag: &str) {
        let mut state = self.state.lock().await;
        let Some(consumer) = state.consumers.remove(consumer_tag) else {
            return;
        };
        let remaining = state.consumer_count(&consumer.queue);
        let auto_delete = state
            .queues
            .get(&consumer.queue)
            .is_some_and(|q| q.declaration.auto_delete);
        if auto_delete && remaining == 0 {
            state.queues.remove(&consumer.queue);
            state.unacked.retain(|_, u| u.queue != consumer.queue);
            info!(queue = %consumer.queue, "auto-delete queue removed with its last consumer");
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryBroker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<(), JobwireError> {
        self.connected.store(true, AtomicOrdering::Release);
        Ok(())
    }

    #[instrument(skip_all, fields(queue = %declaration.name))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), JobwireError> {
        self.ensure_connected()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.queues.get(&declaration.name) {
            if existing.declaration == *declaration {
                debug!("queue already declared");
                return Ok(());
            }
            return Err(JobwireError::validation(format!(
                "queue '{}' already declared with different arguments",
                declaration.name
            )));
        }
        state
            .queues
            .insert(declaration.name.clone(), QueueState::new(declaration.clone()));
        info!(max_priority = ?declaration.effective_max_priority(), "queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), JobwireError> {
        self.ensure_connected()?;
        let notify = {
            let mut state = self.state.lock().await;
            let q = state.queue(queue)?;
            validate_priority(options.priority, q.declaration.effective_max_priority())?;
            let rank = q.rank(options.priority);

            let seq = state.allocate_seq();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| JobwireError::not_found("queue", queue))?;
            q.ready.push(ReadyEntry {
                rank,
                seq,
                message: StoredMessage {
                    body: body.to_vec(),
                    headers: options.headers,
                    priority: options.priority,
                    redelivered: false,
                },
            });
            Arc::clone(&q.notify)
        };
        wake(&notify);
        debug!(queue, priority = ?options.priority, "message published");
        Ok(())
    }

    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<ReceivedMessage>, JobwireError> {
        self.ensure_connected()?;
        let deadline = options.timeout.map(|t| Instant::now() + t);

        loop {
            let notify = {
                let mut state = self.state.lock().await;
                if let Some(message) = state.take_next(queue, options.auto_ack, None)? {
                    return Ok(Some(message));
                }
                Arc::clone(&state.queue(queue)?.notify)
            };

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            // permit が残っていれば即座に戻るので、lock を離した後の publish も拾える
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    #[instrument(skip_all, fields(queue = %queue))]
    async fn consume(
        &self,
        queue: &str,
        callback: Arc<dyn MessageCallback>,
        options: ConsumeOptions,
    ) -> Result<(), JobwireError> {
        self.ensure_connected()?;
        let (consumer_tag, token, notify) = {
            let mut state = self.state.lock().await;
            let notify = Arc::clone(&state.queue(queue)?.notify);
            let consumer_tag = options
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("ctag-{}", Ulid::new().to_string().to_ascii_lowercase()));
            if state.consumers.contains_key(&consumer_tag) {
                return Err(JobwireError::validation(format!(
                    "consumer tag '{consumer_tag}' is already in use"
                )));
            }
            let token = options.subscription_token();
            state.consumers.insert(
                consumer_tag.clone(),
                ConsumerState {
                    queue: queue.to_string(),
                    prefetch: options.prefetch,
                    auto_ack: options.auto_ack,
                    in_flight: 0,
                    token: token.clone(),
                },
            );
            (consumer_tag, token, notify)
        };
        info!(consumer_tag = %consumer_tag, prefetch = options.prefetch, "consumer registered");

        let result = self
            .consume_loop(
                queue,
                &consumer_tag,
                &token,
                &notify,
                callback.as_ref(),
                options.auto_ack,
            )
            .await;

        self.unregister_consumer(&consumer_tag).await;
        info!(consumer_tag = %consumer_tag, "consumer stopped");
        result
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), JobwireError> {
        let state = self.state.lock().await;
        let consumer = state
            .consumers
            .get(consumer_tag)
            .ok_or_else(|| JobwireError::not_found("consumer", consumer_tag))?;
        consumer.token.cancel();
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), JobwireError> {
        self.ensure_connected()?;
        let notify = {
            let mut state = self.state.lock().await;
            let unacked = state.settle(tag)?;
            state.queues.get(&unacked.queue).map(|q| Arc::clone(&q.notify))
        };
        // prefetch で止まっている consumer を起こす
        if let Some(notify) = notify {
            wake(&notify);
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), JobwireError> {
        self.ensure_connected()?;
        let notify = {
            let mut state = self.state.lock().await;
            let unacked = state.settle(tag)?;
            if requeue {
                state.requeue(unacked)
            } else {
                debug!(%tag, "message discarded");
                state.queues.get(&unacked.queue).map(|q| Arc::clone(&q.notify))
            }
        };
        if let Some(notify) = notify {
            wake(&notify);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), JobwireError> {
        let mut state = self.state.lock().await;
        for consumer in state.consumers.values() {
            consumer.token.cancel();
        }
        // チャネルが閉じたときの AMQP と同じく、未 ack は queue に戻す
        let pending: Vec<Unacked> = state.unacked.drain().map(|(_, u)| u).collect();
        let returned = pending.len();
        for unacked in pending {
            if let Some(notify) = state.requeue(unacked) {
                wake(&notify);
            }
        }
        for consumer in state.consumers.values_mut() {
            consumer.in_flight = 0;
        }
        self.connected.store(false, AtomicOrdering::Release);
        if returned > 0 {
            warn!(returned, "unacked messages returned to their queues on close");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<u32, JobwireError> {
        self.ensure_connected()?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .remove(name)
            .ok_or_else(|| JobwireError::not_found("queue", name))?;
        state.unacked.retain(|_, u| u.queue != name);
        for consumer in state.consumers.values().filter(|c| c.queue == name) {
            consumer.token.cancel();
        }
        wake(&queue.notify);
        let dropped = queue.ready.len() as u32;
        info!(dropped, "queue deleted");
        Ok(dropped)
    }

    #[instrument(skip(self))]
    async fn purge_queue(&self, name: &str) -> Result<u32, JobwireError> {
        self.ensure_connected()?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| JobwireError::not_found("queue", name))?;
        let purged = queue.ready.len() as u32;
        queue.ready.clear();
        info!(purged, "queue purged");
        Ok(purged)
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats, JobwireError> {
        self.ensure_connected()?;
        let state = self.state.lock().await;
        let queue = state.queue(name)?;
        Ok(state.stats(name, queue))
    }

    async fn list_queues(&self) -> Result<Vec<QueueStats>, JobwireError> {
        self.ensure_connected()?;
        let state = self.state.lock().await;
        let mut stats: Vec<QueueStats> = state
            .queues
            .iter()
            .map(|(name, queue)| state.stats(name, queue))
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    async fn active_consumers(&self) -> Result<Vec<ConsumerInfo>, JobwireError> {
        self.ensure_connected()?;
        let state = self.state.lock().await;
        let mut consumers: Vec<ConsumerInfo> = state
            .consumers
            .iter()
            .filter(|(_, c)| !c.token.is_cancelled())
            .map(|(tag, c)| ConsumerInfo {
                queue: c.queue.clone(),
                consumer_tag: tag.clone(),
                active: true,
                prefetch: c.prefetch,
                ack_required: !c.auto_ack,
            })
            .collect();
        consumers.sort_by(|a, b| a.consumer_tag.cmp(&b.consumer_tag));
        Ok(consumers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with(declaration: QueueDeclaration) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();
        broker.declare_queue(&declaration).await.unwrap();
        broker
    }

    async fn publish(broker: &InMemoryBroker, queue: &str, body: &str, priority: Option<u8>) {
        broker
            .publish(
                queue,
                body.as_bytes(),
                PublishOptions::default().with_priority(priority),
            )
            .await
            .unwrap();
    }

    async fn next_body(broker: &InMemoryBroker, queue: &str) -> Option<String> {
        broker
            .get(queue, GetOptions::default().auto_ack())
            .await
            .unwrap()
            .map(|m| String::from_utf8(m.body).unwrap())
    }

    #[tokio::test]
    async fn higher_priority_is_delivered_first() {
        let broker = broker_with(QueueDeclaration::new("q").with_max_priority(10)).await;
        publish(&broker, "q", "j2", Some(1)).await;
        publish(&broker, "q", "j1", Some(5)).await;

        assert_eq!(next_body(&broker, "q").await.as_deref(), Some("j1"));
        assert_eq!(next_body(&broker, "q").await.as_deref(), Some("j2"));
        assert_eq!(next_body(&broker, "q").await, None);
    }

    #[tokio::test]
    async fn fifo_within_a_priority_band() {
        let broker = broker_with(QueueDeclaration::new("q").with_max_priority(10)).await;
        for body in ["a", "b", "c"] {
            publish(&broker, "q", body, Some(3)).await;
        }
        publish(&broker, "q", "low", None).await;

        for expected in ["a", "b", "c", "low"] {
            assert_eq!(next_body(&broker, "q").await.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn plain_queue_ignores_priority() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        publish(&broker, "q", "first", Some(1)).await;
        publish(&broker, "q", "second", Some(9)).await;

        assert_eq!(next_body(&broker, "q").await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_but_conflicts_are_rejected() {
        let declaration = QueueDeclaration::new("q").with_max_priority(10);
        let broker = broker_with(declaration.clone()).await;

        broker.declare_queue(&declaration).await.unwrap();
        assert_eq!(broker.list_queues().await.unwrap().len(), 1);

        let err = broker
            .declare_queue(&QueueDeclaration::new("q").with_max_priority(5))
            .await
            .unwrap_err();
        assert!(matches!(err, JobwireError::Validation(_)));
    }

    #[tokio::test]
    async fn publish_validates_queue_and_priority() {
        let broker = broker_with(QueueDeclaration::new("q").with_max_priority(10)).await;

        let err = broker
            .publish("missing", b"x", PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = broker
            .publish("q", b"x", PublishOptions::default().with_priority(Some(11)))
            .await
            .unwrap_err();
        assert!(matches!(err, JobwireError::Validation(_)));
        assert_eq!(broker.queue_stats("q").await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn operations_require_connect() {
        let broker = InMemoryBroker::new();
        let err = broker
            .declare_queue(&QueueDeclaration::new("q"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobwireError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_times_out_on_an_empty_queue() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        let started = Instant::now();

        let got = broker
            .get("q", GetOptions::wait(Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn get_wakes_up_on_publish() {
        let broker = Arc::new(broker_with(QueueDeclaration::new("q")).await);
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .get("q", GetOptions::wait(Duration::from_secs(5)).auto_ack())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&broker, "q", "late", None).await;

        let message = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body, b"late");
    }

    #[tokio::test]
    async fn nack_requeue_restores_the_original_position() {
        let broker = broker_with(QueueDeclaration::new("q").with_max_priority(10)).await;
        publish(&broker, "q", "a", Some(5)).await;
        publish(&broker, "q", "b", Some(5)).await;

        let first = broker.get("q", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        broker.nack(&first.delivery_tag, true).await.unwrap();

        let again = broker.get("q", GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        assert_eq!(again.priority, Some(5));
    }

    #[tokio::test]
    async fn nack_without_requeue_drops_and_tags_are_single_use() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        publish(&broker, "q", "poison", None).await;

        let message = broker.get("q", GetOptions::default()).await.unwrap().unwrap();
        broker.nack(&message.delivery_tag, false).await.unwrap();

        assert_eq!(next_body(&broker, "q").await, None);
        assert!(broker.ack(&message.delivery_tag).await.unwrap_err().is_not_found());
        assert!(
            broker
                .ack(&DeliveryTag::new("q", "not-a-tag"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn purge_removes_ready_messages() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        for body in ["1", "2", "3"] {
            publish(&broker, "q", body, None).await;
        }

        assert_eq!(broker.purge_queue("q").await.unwrap(), 3);
        assert_eq!(next_body(&broker, "q").await, None);
    }

    #[tokio::test]
    async fn consume_respects_prefetch_and_cancel() {
        let broker = Arc::new(broker_with(QueueDeclaration::new("q")).await);
        for body in ["1", "2", "3"] {
            publish(&broker, "q", body, None).await;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ReceivedMessage>();
        let callback: Arc<dyn MessageCallback> = Arc::new(move |message: ReceivedMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });

        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .consume(
                        "q",
                        callback,
                        ConsumeOptions::default()
                            .with_prefetch(1)
                            .with_consumer_tag("c1"),
                    )
                    .await
            })
        };

        let first = rx.recv().await.unwrap();
        // prefetch=1 なので ack するまで次は来ない
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(broker.active_consumers().await.unwrap()[0].consumer_tag, "c1");

        broker.ack(&first.delivery_tag).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.body, b"2");

        broker.cancel("c1").await.unwrap();
        consumer.await.unwrap().unwrap();
        assert!(broker.active_consumers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_returns_unacked_messages() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        publish(&broker, "q", "inflight", None).await;
        let _held = broker.get("q", GetOptions::default()).await.unwrap().unwrap();

        broker.close().await.unwrap();
        assert!(matches!(
            broker.get("q", GetOptions::default()).await,
            Err(JobwireError::Connection(_))
        ));

        broker.connect().await.unwrap();
        assert_eq!(next_body(&broker, "q").await.as_deref(), Some("inflight"));
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn delete_queue_ends_subscriptions() {
        let broker = Arc::new(broker_with(QueueDeclaration::new("q")).await);
        let callback: Arc<dyn MessageCallback> = Arc::new(|_message: ReceivedMessage| async {});
        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .consume("q", callback, ConsumeOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&broker, "q", "x", None).await;

        broker.delete_queue("q").await.unwrap();
        consumer.await.unwrap().unwrap();
        assert!(broker.queue_stats("q").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cancelled_shutdown_token_unregisters_the_consumer() {
        let broker = broker_with(QueueDeclaration::new("q")).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        for _ in 0..3 {
            let callback: Arc<dyn MessageCallback> = Arc::new(|_message: ReceivedMessage| async {});
            broker
                .consume(
                    "q",
                    callback,
                    ConsumeOptions::default()
                        .with_consumer_tag("c1")
                        .with_shutdown(shutdown.clone()),
                )
                .await
                .unwrap();
        }
        assert!(broker.active_consumers().await.unwrap().is_empty());
        assert!(broker.cancel("c1").await.unwrap_err().is_not_found());
    }
}
