//! RedisQueue - Redis 上で broker を模倣する store-backed queue
//!
//! # key layout
//! ```text
//! jobwire:queues      HASH   name → QueueDeclaration JSON
//! {queue}:list        LIST   FIFO ids（LPUSH / RPOP）
//! {queue}:zset        ZSET   id scored priority·2^40 − seq（ZPOPMAX）
//! {queue}:seq         STRING INCR counter（同じ priority 内の FIFO 用）
//! {queue}:msg         HASH   id → body
//! {queue}:meta        HASH   id → StoredMeta JSON（ready）
//! {queue}:pending     HASH   id → StoredMeta JSON（配送済み・未 ack）
//! {queue}:consumers   HASH   consumer tag → ConsumerInfo JSON
//! ```
//!
//! priority 付きで宣言された queue は zset、それ以外は list を使う。
//! 取り出し（ready → pending）は Lua script で 1 回の往復にまとめる。
//!
//! 制限: 他プロセスがクラッシュした場合の pending は自動では戻らない。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
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

const DECLARATIONS_KEY: &str = "jobwire:queues";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// consume が cancel を確認する間隔
const CONSUME_WAIT: Duration = Duration::from_secs(1);
const SEQ_BITS: f64 = (1u64 << 40) as f64;

/// ready → pending を原子的に行う
const POP_SCRIPT: &str = r#"
local id
if ARGV[1] == 'zset' then
  local popped = redis.call('ZPOPMAX', KEYS[1])
  id = popped[1]
else
  id = redis.call('RPOP', KEYS[1])
end
if not id then
  return nil
end
local body = redis.call('HGET', KEYS[2], id)
local meta = redis.call('HGET', KEYS[3], id)
redis.call('HDEL', KEYS[3], id)
if ARGV[2] == '1' then
  redis.call('HDEL', KEYS[2], id)
else
  redis.call('HSET', KEYS[4], id, meta)
end
return {id, body, meta}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeta {
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    priority: Option<u8>,
    seq: u64,
    #[serde(default)]
    redelivered: bool,
}

struct QueueKeys {
    list: String,
    zset: String,
    seq: String,
    msg: String,
    meta: String,
    pending: String,
    consumers: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        Self {
            list: format!("{queue}:list"),
            zset: format!("{queue}:zset"),
            seq: format!("{queue}:seq"),
            msg: format!("{queue}:msg"),
            meta: format!("{queue}:meta"),
            pending: format!("{queue}:pending"),
            consumers: format!("{queue}:consumers"),
        }
    }

    fn all(&self) -> [&str; 7] {
        [
            &self.list,
            &self.zset,
            &self.seq,
            &self.msg,
            &self.meta,
            &self.pending,
            &self.consumers,
        ]
    }
}

/// Ordering mode derived from the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Priority(u8),
    Fifo,
}

impl Mode {
    fn of(declaration: &QueueDeclaration) -> Self {
        match declaration.effective_max_priority() {
            Some(max) => Self::Priority(max),
            None => Self::Fifo,
        }
    }

    fn score(self, priority: Option<u8>, seq: u64) -> f64 {
        let rank = match self {
            Self::Priority(max) => priority.unwrap_or(0).min(max),
            Self::Fifo => 0,
        };
        f64::from(rank) * SEQ_BITS - seq as f64
    }
}

/// Store-backed [`MessageQueue`] on Redis.
///
/// # 使用例
/// ```ignore
/// let queue = RedisQueue::new("redis://localhost:6379/0")?;
/// queue.connect().await?;
/// queue.declare_queue(&QueueDeclaration::new("llm-api-queue").with_max_priority(10)).await?;
/// ```
pub struct RedisQueue {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    declarations: RwLock<HashMap<String, QueueDeclaration>>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
    /// Deliveries handed out by this instance and not yet settled.
    in_flight: Mutex<HashMap<String, DeliveryTag>>,
    pop_script: redis::Script,
}

impl RedisQueue {
    pub fn new(url: &str) -> Result<Self, JobwireError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            declarations: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pop_script: redis::Script::new(POP_SCRIPT),
        })
    }

    /// Shared multiplexed connection, opened on first use.
    async fn conn(&self) -> Result<MultiplexedConnection, JobwireError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| JobwireError::Connection(format!("redis: {e}")))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn declaration(&self, queue: &str) -> Result<QueueDeclaration, JobwireError> {
        if let Some(declaration) = self.declarations.read().await.get(queue) {
            return Ok(declaration.clone());
        }
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(DECLARATIONS_KEY)
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        let raw = raw.ok_or_else(|| JobwireError::not_found("queue", queue))?;
        let declaration: QueueDeclaration = serde_json::from_str(&raw)?;
        self.declarations
            .write()
            .await
            .insert(queue.to_string(), declaration.clone());
        Ok(declaration)
    }

    async fn is_declared(&self, queue: &str) -> Result<bool, JobwireError> {
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("HEXISTS")
            .arg(DECLARATIONS_KEY)
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        if !exists {
            self.declarations.write().await.remove(queue);
        }
        Ok(exists)
    }

    async fn ready_len(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &QueueKeys,
        mode: Mode,
    ) -> Result<u32, JobwireError> {
        let len: u64 = match mode {
            Mode::Priority(_) => redis::cmd("ZCARD").arg(&keys.zset).query_async(conn).await?,
            Mode::Fifo => redis::cmd("LLEN").arg(&keys.list).query_async(conn).await?,
        };
        Ok(len.min(u64::from(u32::MAX)) as u32)
    }

    /// One non-blocking pop.
    async fn try_pop(
        &self,
        queue: &str,
        mode: Mode,
        auto_ack: bool,
    ) -> Result<Option<ReceivedMessage>, JobwireError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;
        let (ready_key, mode_arg) = match mode {
            Mode::Priority(_) => (&keys.zset, "zset"),
            Mode::Fifo => (&keys.list, "list"),
        };
        let popped: Option<(String, Vec<u8>, String)> = self
            .pop_script
            .key(ready_key)
            .key(&keys.msg)
            .key(&keys.meta)
            .key(&keys.pending)
            .arg(mode_arg)
            .arg(if auto_ack { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        let Some((id, body, meta)) = popped else {
            return Ok(None);
        };

        let meta: StoredMeta = serde_json::from_str(&meta)
            .map_err(|e| JobwireError::protocol(format!("corrupt message metadata for {id}: {e}")))?;
        let delivery_tag = DeliveryTag::new(queue, id.clone());
        if !auto_ack {
            self.in_flight.lock().await.insert(id, delivery_tag.clone());
        }
        Ok(Some(ReceivedMessage {
            body,
            delivery_tag,
            headers: meta.headers,
            routing_key: Some(queue.to_string()),
            priority: meta.priority,
            redelivered: meta.redelivered,
        }))
    }

    /// Remove `tag` from pending, returning its metadata.
    async fn take_pending(
        &self,
        conn: &mut MultiplexedConnection,
        tag: &DeliveryTag,
    ) -> Result<StoredMeta, JobwireError> {
        let keys = QueueKeys::new(tag.queue());
        let (meta, removed): (Option<String>, u32) = redis::pipe()
            .atomic()
            .cmd("HGET")
            .arg(&keys.pending)
            .arg(tag.value())
            .cmd("HDEL")
            .arg(&keys.pending)
            .arg(tag.value())
            .query_async(conn)
            .await?;
        self.in_flight.lock().await.remove(tag.value());
        match meta {
            Some(meta) if removed > 0 => Ok(serde_json::from_str(&meta)?),
            _ => Err(JobwireError::not_found("delivery tag", tag.to_string())),
        }
    }

    async fn consume_loop(
        &self,
        queue: &str,
        token: &CancellationToken,
        callback: &dyn MessageCallback,
        auto_ack: bool,
    ) -> Result<(), JobwireError> {
        let options = GetOptions {
            timeout: Some(CONSUME_WAIT),
            auto_ack,
        };
        // pop の途中で future を落とすとメッセージを失うので select はしない
        while !token.is_cancelled() {
            match self.get(queue, options.clone()).await? {
                Some(message) => callback.on_message(message).await,
                None => {
                    if !self.is_declared(queue).await? {
                        debug!(queue, "queue gone, ending subscription");
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<(), JobwireError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(queue = %declaration.name))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), JobwireError> {
        let mut conn = self.conn().await?;
        let raw = serde_json::to_string(declaration)?;
        let created: bool = redis::cmd("HSETNX")
            .arg(DECLARATIONS_KEY)
            .arg(&declaration.name)
            .arg(&raw)
            .query_async(&mut conn)
            .await?;
        if !created {
            self.declarations.write().await.remove(&declaration.name);
            let existing = self.declaration(&declaration.name).await?;
            if existing != *declaration {
                return Err(JobwireError::validation(format!(
                    "queue '{}' already declared with different arguments",
                    declaration.name
                )));
            }
            debug!("queue already declared");
            return Ok(());
        }
        self.declarations
            .write()
            .await
            .insert(declaration.name.clone(), declaration.clone());
        info!(max_priority = ?declaration.effective_max_priority(), "queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), JobwireError> {
        let declaration = self.declaration(queue).await?;
        validate_priority(options.priority, declaration.effective_max_priority())?;
        let mode = Mode::of(&declaration);
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn().await?;

        let seq: u64 = redis::cmd("INCR").arg(&keys.seq).query_async(&mut conn).await?;
        let id = Ulid::new().to_string().to_ascii_lowercase();
        let meta = serde_json::to_string(&StoredMeta {
            headers: options.headers,
            priority: options.priority,
            seq,
            redelivered: false,
        })?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&keys.msg)
            .arg(&id)
            .arg(body)
            .ignore()
            .cmd("HSET")
            .arg(&keys.meta)
            .arg(&id)
            .arg(&meta)
            .ignore();
        match mode {
            Mode::Priority(_) => pipe
                .cmd("ZADD")
                .arg(&keys.zset)
                .arg(mode.score(options.priority, seq))
                .arg(&id)
                .ignore(),
            Mode::Fifo => pipe.cmd("LPUSH").arg(&keys.list).arg(&id).ignore(),
        };
        pipe.query_async::<()>(&mut conn).await?;
        debug!(queue, priority = ?options.priority, "message published");
        Ok(())
    }

    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<ReceivedMessage>, JobwireError> {
        let mode = Mode::of(&self.declaration(queue).await?);
        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(message) = self.try_pop(queue, mode, options.auto_ack).await? {
                return Ok(Some(message));
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
                }
                _ => return Ok(None),
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
        self.declaration(queue).await?;
        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Ulid::new().to_string().to_ascii_lowercase()));
        let token = options.subscription_token();
        {
            let mut consumers = self.consumers.lock().await;
            if consumers.contains_key(&consumer_tag) {
                return Err(JobwireError::validation(format!(
                    "consumer tag '{consumer_tag}' is already in use"
                )));
            }
            consumers.insert(consumer_tag.clone(), token.clone());
        }

        let keys = QueueKeys::new(queue);
        let info = serde_json::to_string(&ConsumerInfo {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.clone(),
            active: true,
            prefetch: options.prefetch,
            ack_required: !options.auto_ack,
        })?;
        let registered = async {
            let mut conn = self.conn().await?;
            redis::cmd("HSET")
                .arg(&keys.consumers)
                .arg(&consumer_tag)
                .arg(info)
                .query_async::<()>(&mut conn)
                .await?;
            Ok::<_, JobwireError>(conn)
        }
        .await;
        let mut conn = match registered {
            Ok(conn) => conn,
            Err(err) => {
                self.consumers.lock().await.remove(&consumer_tag);
                return Err(err);
            }
        };
        info!(consumer_tag = %consumer_tag, "consumer registered");

        let result = self
            .consume_loop(queue, &token, callback.as_ref(), options.auto_ack)
            .await;

        self.consumers.lock().await.remove(&consumer_tag);
        if let Err(err) = redis::cmd("HDEL")
            .arg(&keys.consumers)
            .arg(&consumer_tag)
            .query_async::<()>(&mut conn)
            .await
        {
            warn!(consumer_tag = %consumer_tag, error = %err, "failed to unregister consumer");
        }
        info!(consumer_tag = %consumer_tag, "consumer stopped");
        result
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), JobwireError> {
        let consumers = self.consumers.lock().await;
        let token = consumers
            .get(consumer_tag)
            .ok_or_else(|| JobwireError::not_found("consumer", consumer_tag))?;
        token.cancel();
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), JobwireError> {
        let mut conn = self.conn().await?;
        self.take_pending(&mut conn, tag).await?;
        redis::cmd("HDEL")
            .arg(QueueKeys::new(tag.queue()).msg)
            .arg(tag.value())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), JobwireError> {
        let mut conn = self.conn().await?;
        let mut meta = self.take_pending(&mut conn, tag).await?;
        let keys = QueueKeys::new(tag.queue());
        if !requeue {
            redis::cmd("HDEL")
                .arg(&keys.msg)
                .arg(tag.value())
                .query_async::<()>(&mut conn)
                .await?;
            debug!(%tag, "message discarded");
            return Ok(());
        }

        let mode = Mode::of(&self.declaration(tag.queue()).await?);
        meta.redelivered = true;
        let raw = serde_json::to_string(&meta)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&keys.meta)
            .arg(tag.value())
            .arg(raw)
            .ignore();
        match mode {
            // 元の score に戻す
            Mode::Priority(_) => pipe
                .cmd("ZADD")
                .arg(&keys.zset)
                .arg(mode.score(meta.priority, meta.seq))
                .arg(tag.value())
                .ignore(),
            // 取り出し側の端に戻す
            Mode::Fifo => pipe.cmd("RPUSH").arg(&keys.list).arg(tag.value()).ignore(),
        };
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), JobwireError> {
        for token in self.consumers.lock().await.values() {
            token.cancel();
        }
        let held: Vec<DeliveryTag> = self.in_flight.lock().await.values().cloned().collect();
        let returned = held.len();
        for tag in held.iter().rev() {
            if let Err(err) = self.nack(tag, true).await {
                warn!(%tag, error = %err, "failed to return delivery on close");
            }
        }
        if returned > 0 {
            warn!(returned, "unacked messages returned to their queues on close");
        }
        self.connection.lock().await.take();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<u32, JobwireError> {
        let declaration = self.declaration(name).await?;
        let keys = QueueKeys::new(name);
        let mut conn = self.conn().await?;
        let dropped = self.ready_len(&mut conn, &keys, Mode::of(&declaration)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys.all() {
            pipe.cmd("DEL").arg(key).ignore();
        }
        pipe.cmd("HDEL").arg(DECLARATIONS_KEY).arg(name).ignore();
        pipe.query_async::<()>(&mut conn).await?;

        self.declarations.write().await.remove(name);
        self.in_flight.lock().await.retain(|_, tag| tag.queue() != name);
        info!(dropped, "queue deleted");
        Ok(dropped)
    }

    #[instrument(skip(self))]
    async fn purge_queue(&self, name: &str) -> Result<u32, JobwireError> {
        let mode = Mode::of(&self.declaration(name).await?);
        let keys = QueueKeys::new(name);
        let mut conn = self.conn().await?;

        let ids: Vec<String> = match mode {
            Mode::Priority(_) => redis::cmd("ZRANGE")
                .arg(&keys.zset)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?,
            Mode::Fifo => redis::cmd("LRANGE")
                .arg(&keys.list)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?,
        };
        if ids.is_empty() {
            return Ok(0);
        }

        // 配送中（pending）のメッセージ本体は残す
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(&keys.zset)
            .ignore()
            .cmd("DEL")
            .arg(&keys.list)
            .ignore()
            .cmd("HDEL")
            .arg(&keys.msg)
            .arg(&ids)
            .ignore()
            .cmd("HDEL")
            .arg(&keys.meta)
            .arg(&ids)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        let purged = ids.len() as u32;
        info!(purged, "queue purged");
        Ok(purged)
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats, JobwireError> {
        let mode = Mode::of(&self.declaration(name).await?);
        let keys = QueueKeys::new(name);
        let mut conn = self.conn().await?;
        let messages = self.ready_len(&mut conn, &keys, mode).await?;
        let consumers: u32 = redis::cmd("HLEN")
            .arg(&keys.consumers)
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            name: name.to_string(),
            consumers,
            messages,
        })
    }

    async fn list_queues(&self) -> Result<Vec<QueueStats>, JobwireError> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = redis::cmd("HKEYS")
            .arg(DECLARATIONS_KEY)
            .query_async(&mut conn)
            .await?;
        names.sort();

        let mut stats = Vec::with_capacity(names.len());
        for name in names {
            match self.queue_stats(&name).await {
                Ok(s) => stats.push(s),
                // 一覧の途中で消された
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(stats)
    }

    async fn active_consumers(&self) -> Result<Vec<ConsumerInfo>, JobwireError> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = redis::cmd("HKEYS")
            .arg(DECLARATIONS_KEY)
            .query_async(&mut conn)
            .await?;

        let mut consumers = Vec::new();
        for name in names {
            let raw: Vec<String> = redis::cmd("HVALS")
                .arg(QueueKeys::new(&name).consumers)
                .query_async(&mut conn)
                .await?;
            for entry in raw {
                match serde_json::from_str::<ConsumerInfo>(&entry) {
                    Ok(info) if info.active => consumers.push(info),
                    Ok(_) => {}
                    Err(err) => warn!(queue = %name, error = %err, "skipping corrupt consumer entry"),
                }
            }
        }
        consumers.sort_by(|a, b| a.consumer_tag.cmp(&b.consumer_tag));
        Ok(consumers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_scores_above_any_lower_band() {
        let mode = Mode::Priority(10);
        let old_low = mode.score(Some(1), 1);
        let new_high = mode.score(Some(5), 1_000_000);
        assert!(new_high > old_low);
    }

    #[test]
    fn earlier_messages_score_higher_within_a_band() {
        let mode = Mode::Priority(10);
        assert!(mode.score(Some(3), 1) > mode.score(Some(3), 2));
        // bound を超える priority は bound に丸めて並べる
        assert_eq!(mode.score(Some(200), 7), mode.score(Some(10), 7));
    }

    #[test]
    fn fifo_mode_ignores_priority() {
        assert_eq!(Mode::Fifo.score(Some(9), 4), Mode::Fifo.score(None, 4));
        assert_eq!(
            Mode::of(&QueueDeclaration::new("q").with_argument("x-max-priority", 5)),
            Mode::Priority(5)
        );
    }

    #[test]
    fn queue_keys_follow_the_layout() {
        let keys = QueueKeys::new("llm-api-queue");
        assert_eq!(keys.zset, "llm-api-queue:zset");
        assert_eq!(keys.pending, "llm-api-queue:pending");
        assert_eq!(keys.all().len(), 7);
    }
}
