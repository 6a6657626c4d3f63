//! InMemoryResultStorage - 開発・テスト用の status store
//!
//! Redis 版と同じく「save のたびに job ごとのチャネルへ signal」を行う。
//! チャネルは `broadcast::Sender<()>` で、最後の待ち手が抜けた時点で片付ける。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, instrument, warn};

use crate::domain::{JobId, JobStatus, JobStatusError, JobStatusType};
use crate::error::JobwireError;
use crate::ports::{ResultStorage, wait_for_terminal};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Default)]
pub struct InMemoryResultStorage {
    records: RwLock<HashMap<JobId, JobStatus>>,
    channels: Mutex<HashMap<JobId, broadcast::Sender<()>>>,
}

impl InMemoryResultStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn subscribe(&self, job_id: &JobId) -> broadcast::Receiver<()> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(job_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the job's channel once nobody waits on it.
    async fn release(&self, job_id: &JobId) {
        let mut channels = self.channels.lock().await;
        if channels
            .get(job_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(job_id);
        }
    }

    async fn signal(&self, job_id: &JobId) {
        let mut channels = self.channels.lock().await;
        if let Some(tx) = channels.get(job_id)
            && tx.send(()).is_err()
        {
            // 誰も待っていない
            channels.remove(job_id);
        }
    }

    /// Load, apply `change`, store and signal. The record lock is released
    /// before signalling.
    async fn modify<F>(&self, job_id: &JobId, change: F) -> Result<(), JobwireError>
    where
        F: FnOnce(&mut JobStatus) -> Result<(), JobwireError>,
    {
        {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(job_id)
                .ok_or_else(|| JobwireError::not_found("job", job_id.as_str()))?;
            let mut updated = record.clone();
            if let Err(err) = change(&mut updated) {
                if matches!(err, JobwireError::TerminalState(_)) {
                    warn!(job_id = %job_id, status = %record.status, "rejected write over a terminal job status");
                }
                return Err(err);
            }
            *record = updated;
        }
        self.signal(job_id).await;
        Ok(())
    }
}

#[async_trait]
impl ResultStorage for InMemoryResultStorage {
    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn create_job_status(&self, job_id: &JobId) -> Result<(), JobwireError> {
        {
            let mut records = self.records.write().await;
            if let Some(existing) = records.get(job_id) {
                if let Err(err) = existing.ensure_open(job_id) {
                    warn!(status = %existing.status, "refusing to recreate a finished job");
                    return Err(err);
                }
            }
            records.insert(job_id.clone(), JobStatus::pending());
        }
        self.signal(job_id).await;
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
        self.modify(job_id, |record| record.apply_update(job_id, status, message))
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
        self.modify(job_id, |record| record.complete(job_id, result, error, message))
            .await?;
        info!("job completed");
        Ok(())
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobStatus, JobwireError> {
        self.records
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobwireError::not_found("job", job_id.as_str()))
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn delete_job_status(&self, job_id: &JobId) -> Result<(), JobwireError> {
        let removed = self.records.write().await.remove(job_id).is_some();
        if removed {
            self.signal(job_id).await;
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
        let signal = self.subscribe(job_id).await;
        // signal は wait_for_terminal の中で drop される
        let outcome = wait_for_terminal(job_id, timeout, update_cycles, signal, || {
            self.get_job_status(job_id)
        })
        .await;
        self.release(job_id).await;
        outcome
    }
}
