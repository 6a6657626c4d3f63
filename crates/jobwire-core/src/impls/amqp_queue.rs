//! AmqpQueue - RabbitMQ（AMQP 0-9-1）上の broker-backed queue
//!
//! # 実装詳細
//! - 接続 1 本 + channel 1 本を共有する。delivery tag は channel ごとの連番なので、
//!   get / consume / ack / nack が同じ channel を通ることで tag が一意になる
//! - channel を開き直すと連番が 1 から振り直される。tag の値は `{generation}.{n}` とし、
//!   前の channel の tag は NotFound にする（新しい channel の別 message を ack しないため）
//! - publish は default exchange へ routing key = queue 名で送る（publisher confirm あり）
//! - priority は broker の `x-max-priority` に任せる。既知の宣言があれば publish 前に検証する
//! - queue の列挙・統計・consumer 一覧は [`ManagementClient`] 経由
//!   （passive declare は存在しない queue で channel ごと落ちるため使わない）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::{Number, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use crate::domain::{
    ConsumeOptions, ConsumerInfo, DeliveryTag, GetOptions, Headers, MAX_PRIORITY_ARG,
    PublishOptions, QueueDeclaration, QueueStats, ReceivedMessage, validate_priority,
};
use crate::error::JobwireError;
use crate::ports::{MessageCallback, MessageQueue};

use super::management::ManagementClient;

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
    /// Bumped every time a channel is opened.
    generation: u64,
}

pub struct AmqpQueue {
    url: String,
    management: ManagementClient,
    session: Mutex<Option<Session>>,
    generations: AtomicU64,
    declarations: RwLock<HashMap<String, QueueDeclaration>>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
}

impl AmqpQueue {
    pub fn new(url: impl Into<String>, management: ManagementClient) -> Self {
        Self {
            url: url.into(),
            management,
            session: Mutex::new(None),
            generations: AtomicU64::new(0),
            declarations: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Shared channel and its generation; reopened when the broker closed it.
    async fn channel(&self) -> Result<(Channel, u64), JobwireError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.channel.status().connected() {
                return Ok((session.channel.clone(), session.generation));
            }
            if session.connection.status().connected() {
                debug!(generation = session.generation, "channel closed by broker, reopening");
                session.channel = open_channel(&session.connection).await?;
                session.generation = self.next_generation();
                return Ok((session.channel.clone(), session.generation));
            }
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| JobwireError::Connection(format!("amqp: {e}")))?;
        let channel = open_channel(&connection).await?;
        let generation = self.next_generation();
        info!(generation, "connected to amqp broker");
        *guard = Some(Session {
            connection,
            channel: channel.clone(),
            generation,
        });
        Ok((channel, generation))
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn max_priority(&self, queue: &str) -> Option<u8> {
        self.declarations
            .read()
            .await
            .get(queue)
            .and_then(QueueDeclaration::effective_max_priority)
    }

    async fn consume_stream(
        &self,
        channel: &Channel,
        generation: u64,
        queue: &str,
        consumer_tag: &str,
        token: &CancellationToken,
        callback: &dyn MessageCallback,
        options: &ConsumeOptions,
    ) -> Result<(), JobwireError> {
        if !options.auto_ack {
            channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await?;
        }
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(consumer_tag, prefetch = options.prefetch, "consumer registered");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // broker 側の登録も外す
                    if let Err(err) = channel
                        .basic_cancel(consumer_tag, BasicCancelOptions::default())
                        .await
                    {
                        warn!(consumer_tag, error = %err, "basic.cancel failed");
                    }
                    return Ok(());
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        callback.on_message(received(queue, generation, delivery)).await
                    }
                    Some(Err(err)) => return Err(err.into()),
                    // broker 側で cancel された（queue 削除など）
                    None => return Ok(()),
                },
            }
        }
    }
}

async fn open_channel(connection: &Connection) -> Result<Channel, JobwireError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

fn received(queue: &str, generation: u64, delivery: Delivery) -> ReceivedMessage {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(headers_from_table)
        .unwrap_or_default();
    ReceivedMessage {
        delivery_tag: DeliveryTag::new(queue, format!("{generation}.{}", delivery.delivery_tag)),
        headers,
        routing_key: Some(delivery.routing_key.as_str().to_string()),
        priority: *delivery.properties.priority(),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

/// Tags issued on an earlier channel are `NotFound`; the broker already
/// requeued those deliveries when the channel closed.
fn parse_tag(tag: &DeliveryTag, generation: u64) -> Result<u64, JobwireError> {
    let not_found = || JobwireError::not_found("delivery tag", tag.to_string());
    let (issued, value) = tag.value().split_once('.').ok_or_else(not_found)?;
    if issued.parse::<u64>().ok() != Some(generation) {
        return Err(not_found());
    }
    value.parse().map_err(|_| not_found())
}

fn declaration_arguments(declaration: &QueueDeclaration) -> FieldTable {
    let mut table = table_from_headers(&declaration.arguments);
    if let Some(max) = declaration.max_priority {
        table.insert(
            ShortString::from(MAX_PRIORITY_ARG),
            AMQPValue::ShortShortUInt(max),
        );
    }
    table
}

fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), amqp_from_json(value));
    }
    table
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), json_from_amqp(value)))
        .collect()
}

/// Arrays and objects travel as JSON text.
fn amqp_from_json(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn json_from_amqp(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldTable(t) => Value::Object(headers_from_table(t)),
        _ => Value::Null,
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    fn backend_name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self) -> Result<(), JobwireError> {
        self.channel().await.map(|_| ())
    }

    #[instrument(skip_all, fields(queue = %declaration.name))]
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), JobwireError> {
        let (channel, _) = self.channel().await?;
        // 引数が違えば broker が PRECONDITION_FAILED で channel を閉じる
        channel
            .queue_declare(
                &declaration.name,
                QueueDeclareOptions {
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                declaration_arguments(declaration),
            )
            .await
            .map_err(|e| match e {
                lapin::Error::ProtocolError(err) => JobwireError::validation(format!(
                    "queue '{}' could not be declared: {err}",
                    declaration.name
                )),
                other => other.into(),
            })?;
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
        validate_priority(options.priority, self.max_priority(queue).await)?;
        let (channel, _) = self.channel().await?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(table_from_headers(&options.headers));
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if let Some(priority) = options.priority {
            properties = properties.with_priority(priority);
        }

        let confirmation = channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(JobwireError::Connection(format!(
                "broker rejected message for queue '{queue}'"
            )));
        }
        debug!(queue, priority = ?options.priority, "message published");
        Ok(())
    }

    async fn get(
        &self,
        queue: &str,
        options: GetOptions,
    ) -> Result<Option<ReceivedMessage>, JobwireError> {
        let (channel, generation) = self.channel().await?;
        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            let message = channel
                .basic_get(
                    queue,
                    BasicGetOptions {
                        no_ack: options.auto_ack,
                    },
                )
                .await?;
            if let Some(message) = message {
                return Ok(Some(received(queue, generation, message.delivery)));
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
        let (channel, generation) = self.channel().await?;
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

        let result = self
            .consume_stream(
                &channel,
                generation,
                queue,
                &consumer_tag,
                &token,
                callback.as_ref(),
                &options,
            )
            .await;

        self.consumers.lock().await.remove(&consumer_tag);
        info!(consumer_tag = %consumer_tag, "consumer stopped");
        result
    }

    /// loop を止める。broker 側の basic.cancel は consume の終了処理で送る
    async fn cancel(&self, consumer_tag: &str) -> Result<(), JobwireError> {
        let consumers = self.consumers.lock().await;
        let token = consumers
            .get(consumer_tag)
            .ok_or_else(|| JobwireError::not_found("consumer", consumer_tag))?;
        token.cancel();
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), JobwireError> {
        let (channel, generation) = self.channel().await?;
        let value = parse_tag(tag, generation)?;
        channel.basic_ack(value, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), JobwireError> {
        let (channel, generation) = self.channel().await?;
        let value = parse_tag(tag, generation)?;
        channel
            .basic_nack(
                value,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), JobwireError> {
        let tags: Vec<String> = self.consumers.lock().await.keys().cloned().collect();
        for tag in tags {
            if let Err(err) = self.cancel(&tag).await {
                warn!(consumer_tag = %tag, error = %err, "cancel on close failed");
            }
        }
        // 未 ack は接続を閉じれば broker が queue に戻す
        if let Some(session) = self.session.lock().await.take() {
            session.connection.close(200, "closing").await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<u32, JobwireError> {
        // 存在確認（delete 自体は存在しない queue でもエラーにならない）
        self.management.queue(name).await?;
        let dropped = self
            .channel()
            .await?
            .0
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        self.declarations.write().await.remove(name);
        info!(dropped, "queue deleted");
        Ok(dropped)
    }

    #[instrument(skip(self))]
    async fn purge_queue(&self, name: &str) -> Result<u32, JobwireError> {
        self.management.queue(name).await?;
        let purged = self
            .channel()
            .await?
            .0
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        info!(purged, "queue purged");
        Ok(purged)
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats, JobwireError> {
        self.management.queue(name).await
    }

    async fn list_queues(&self) -> Result<Vec<QueueStats>, JobwireError> {
        self.management.queues().await
    }

    async fn active_consumers(&self) -> Result<Vec<ConsumerInfo>, JobwireError> {
        let consumers = self.management.consumers().await?;
        Ok(consumers.into_iter().filter(|c| c.active).collect())
    }
}
