//! RedisResultStorage - job status を Redis に置く
//!
//! - key: `{prefix}:{jobId}`、値は [`JobStatus`] の JSON
//! - save のたびに同じ key を channel 名として `PUBLISH key "set"`
//! - 待ち手は channel を購読し、通知か周期の境目で読み直す（[`wait_for_terminal`]）
//!
//! 書き込みは compare-and-set。読んだ時点の値と Redis 上の値が一致するときだけ
//! Lua で SET + PUBLISH し、ずれていたら読み直して変更をやり直す。
//! 読み直した値が終端なら変更側が `TerminalState` を返すので、終端状態は上書きされない。

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::{JobId, JobStatus, JobStatusError, JobStatusType};
use crate::error::JobwireError;
use crate::ports::{ResultStorage, StatusSignal, wait_for_terminal};

const SET_NOTIFICATION: &str = "set";
const MAX_WRITE_ATTEMPTS: usize = 8;

/// KEYS[1] = status key
/// ARGV = [expected-present ("1"/"0"), expected raw, new raw, notification]
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('PUBLISH', KEYS[1], ARGV[4])
return 1
"#;

pub struct RedisResultStorage {
    client: redis::Client,
    prefix: String,
    connection: Mutex<Option<MultiplexedConnection>>,
    cas_script: redis::Script,
}

/// Pub/sub subscription to one job's channel.
pub struct RedisStatusSignal {
    messages: BoxStream<'static, redis::Msg>,
}

#[async_trait]
impl StatusSignal for RedisStatusSignal {
    async fn changed(&mut self) -> bool {
        self.messages.next().await.is_some()
    }
}

impl RedisResultStorage {
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self, JobwireError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
            connection: Mutex::new(None),
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    pub fn key(&self, job_id: &JobId) -> String {
        format!("{}:{}", self.prefix, job_id)
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

    async fn load_raw(&self, job_id: &JobId) -> Result<Option<String>, JobwireError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(raw)
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<JobStatus>, JobwireError> {
        self.load_raw(job_id)
            .await?
            .map(|raw| decode(job_id, &raw))
            .transpose()
    }

    /// SET + PUBLISH only if the key still holds `expected`.
    /// Returns false when another writer got there first.
    async fn compare_and_set(
        &self,
        job_id: &JobId,
        expected: Option<&str>,
        status: &JobStatus,
    ) -> Result<bool, JobwireError> {
        let raw = serde_json::to_string(status)?;
        let mut conn = self.conn().await?;
        let written: i64 = self
            .cas_script
            .key(self.key(job_id))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(raw)
            .arg(SET_NOTIFICATION)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    /// Load, apply `change` and write back, retrying while the record moves underneath.
    /// `change` gets the current record (None if missing) and returns the record to store.
    async fn modify<F>(&self, job_id: &JobId, mut change: F) -> Result<(), JobwireError>
    where
        F: FnMut(Option<JobStatus>) -> Result<JobStatus, JobwireError> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let raw = self.load_raw(job_id).await?;
            let current = raw.as_deref().map(|raw| decode(job_id, raw)).transpose()?;
            let previous = current.as_ref().map(|status| status.status);
            let updated = match change(current) {
                Ok(updated) => updated,
                Err(err) => {
                    if let (JobwireError::TerminalState(_), Some(previous)) = (&err, previous) {
                        warn!(job_id = %job_id, status = %previous, "rejected write over a terminal job status");
                    }
                    return Err(err);
                }
            };
            if self.compare_and_set(job_id, raw.as_deref(), &updated).await? {
                return Ok(());
            }
            debug!(job_id = %job_id, attempt, "status changed during write, retrying");
        }
        Err(JobwireError::Connection(format!(
            "status of {job_id} kept changing during {MAX_WRITE_ATTEMPTS} write attempts"
        )))
    }

    async fn subscribe(&self, job_id: &JobId) -> Result<RedisStatusSignal, JobwireError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| JobwireError::Connection(format!("redis pubsub: {e}")))?;
        pubsub.subscribe(self.key(job_id)).await?;
        Ok(RedisStatusSignal {
            messages: pubsub.into_on_message().boxed(),
        })
    }
}

#[async_trait]
impl ResultStorage for RedisResultStorage {
    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn create_job_status(&self, job_id: &JobId) -> Result<(), JobwireError> {
        self.modify(job_id, |existing| {
            if let Some(existing) = existing {
                existing.ensure_open(job_id)?;
            }
            Ok(JobStatus::pending())
        })
        .await?;
        info!("job status created");
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id, status = %status))]
    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatusType,
        message: Option<String>,
    ) -> Result<(), JobwireError> {
        self.modify(job_id, |current| {
            let mut record = existing(job_id, current)?;
            record.apply_update(job_id, status, message.clone())?;
            Ok(record)
        })
        .await?;
        debug!("job status updated");
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id, failed = error.is_some()))]
    async fn complete_job(
        &self,
        job_id: &JobId,
        result: Option<String>,
        error: Option<JobStatusError>,
        message: Option<String>,
    ) -> Result<(), JobwireError> {
        self.modify(job_id, |current| {
            let mut record = existing(job_id, current)?;
            record.complete(job_id, result.clone(), error.clone(), message.clone())?;
            Ok(record)
        })
        .await?;
        info!("job completed");
        Ok(())
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobStatus, JobwireError> {
        self.load(job_id)
            .await?
            .ok_or_else(|| JobwireError::not_found("job", job_id.as_str()))
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn delete_job_status(&self, job_id: &JobId) -> Result<(), JobwireError> {
        let mut conn = self.conn().await?;
        let removed: u32 = redis::cmd("DEL")
            .arg(self.key(job_id))
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            info!("job status deleted");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn wait_for_completion(
        &self,
        job_id: &JobId,
        timeout: Duration,
        update_cycles: u32,
    ) -> Result<JobStatus, JobwireError> {
        let status = self.get_job_status(job_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }
        let signal = self.subscribe(job_id).await?;
        wait_for_terminal(job_id, timeout, update_cycles, signal, || {
            self.get_job_status(job_id)
        })
        .await
    }
}

fn decode(job_id: &JobId, raw: &str) -> Result<JobStatus, JobwireError> {
    serde_json::from_str(raw)
        .map_err(|e| JobwireError::protocol(format!("corrupt status for {job_id}: {e}")))
}

fn existing(job_id: &JobId, current: Option<JobStatus>) -> Result<JobStatus, JobwireError> {
    current.ok_or_else(|| JobwireError::not_found("job", job_id.as_str()))
}
