//! RedisMetadataStore - queue metadata を `{database}:{queueName}` に JSON で置く
//!
//! 一覧用に queue 名を `{database}:queues` の SET にも入れる。

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{QueueMetadata, QueueMetadataUpdate};
use crate::error::JobwireError;
use crate::ports::QueueMetadataStore;

pub struct RedisMetadataStore {
    client: redis::Client,
    database: String,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisMetadataStore {
    pub fn new(url: &str, database: impl Into<String>) -> Result<Self, JobwireError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            database: database.into(),
            connection: Mutex::new(None),
        })
    }

    fn key(&self, queue_name: &str) -> String {
        format!("{}:{}", self.database, queue_name)
    }

    fn index_key(&self) -> String {
        format!("{}:queues", self.database)
    }

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

    async fn write(
        &self,
        conn: &mut MultiplexedConnection,
        metadata: &QueueMetadata,
    ) -> Result<(), JobwireError> {
        let raw = serde_json::to_string(metadata)?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key(&metadata.queue_name))
            .arg(raw)
            .ignore()
            .cmd("SADD")
            .arg(self.index_key())
            .arg(&metadata.queue_name)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueMetadataStore for RedisMetadataStore {
    async fn insert(&self, metadata: QueueMetadata) -> Result<String, JobwireError> {
        let mut conn = self.conn().await?;
        self.write(&mut conn, &metadata).await?;
        debug!(queue = %metadata.queue_name, "queue metadata stored");
        Ok(metadata.id)
    }

    async fn get(&self, queue_name: &str) -> Result<Option<QueueMetadata>, JobwireError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(queue_name))
            .query_async(&mut conn)
            .await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn update(
        &self,
        queue_name: &str,
        update: &QueueMetadataUpdate,
    ) -> Result<bool, JobwireError> {
        let Some(mut metadata) = self.get(queue_name).await? else {
            return Ok(false);
        };
        if update.apply(&mut metadata) {
            let mut conn = self.conn().await?;
            self.write(&mut conn, &metadata).await?;
        }
        Ok(true)
    }

    async fn delete(&self, queue_name: &str) -> Result<bool, JobwireError> {
        let mut conn = self.conn().await?;
        let (removed, _): (u32, u32) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.key(queue_name))
            .cmd("SREM")
            .arg(self.index_key())
            .arg(queue_name)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<QueueMetadata>, JobwireError> {
        let mut conn = self.conn().await?;
        let mut names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            match self.get(&name).await {
                Ok(Some(metadata)) => records.push(metadata),
                Ok(None) => debug!(queue = %name, "index entry without a record"),
                Err(err) => warn!(queue = %name, error = %err, "skipping unreadable metadata"),
            }
        }
        Ok(records)
    }
}
