//! ResultStorage port - job status の保存と完了待ち
//!
//! 書き込み側は save のたびに job ごとの通知チャネルへ signal を送る。
//! 読み込み側は [`wait_for_terminal`] で「通知 + 周期ごとの再読込」を組み合わせて待つ。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{JobId, JobStatus, JobStatusError, JobStatusType};
use crate::error::JobwireError;

#[async_trait]
pub trait ResultStorage: Send + Sync {
    /// PENDING with a creation message. Resets a non-terminal record.
    async fn create_job_status(&self, job_id: &JobId) -> Result<(), JobwireError>;

    /// Partial update; result and error are kept.
    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatusType,
        message: Option<String>,
    ) -> Result<(), JobwireError>;

    /// Terminal write: ERROR when `error` is present, else COMPLETED.
    async fn complete_job(
        &self,
        job_id: &JobId,
        result: Option<String>,
        error: Option<JobStatusError>,
        message: Option<String>,
    ) -> Result<(), JobwireError>;

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobStatus, JobwireError>;

    /// Idempotent.
    async fn delete_job_status(&self, job_id: &JobId) -> Result<(), JobwireError>;

    /// Block until the record is terminal or `timeout * update_cycles` elapses.
    async fn wait_for_completion(
        &self,
        job_id: &JobId,
        timeout: Duration,
        update_cycles: u32,
    ) -> Result<JobStatus, JobwireError>;
}

/// "Record may have changed" notifications for one job.
#[async_trait]
pub trait StatusSignal: Send {
    /// Resolves on the next notification. `false` once the channel is gone.
    async fn changed(&mut self) -> bool;
}

#[async_trait]
impl StatusSignal for broadcast::Receiver<()> {
    async fn changed(&mut self) -> bool {
        match self.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}

/// Shared wait loop, run after the caller has subscribed to `signal`.
///
/// 1. 購読後にもう一度読む（check → subscribe の間に完了していた場合の取りこぼし対策）
/// 2. 1 周期 `timeout` だけ通知を待つ。通知が来ても来なくても読み直す
///    （pub/sub はロストしうるので周期の境目でも必ず読む）
/// 3. 全体の締め切り `timeout * update_cycles` を過ぎたら Timeout
///
/// The future holds no locks; dropping it (an outer deadline) just drops the
/// subscription.
pub async fn wait_for_terminal<S, F, Fut>(
    job_id: &JobId,
    timeout: Duration,
    update_cycles: u32,
    mut signal: S,
    mut load: F,
) -> Result<JobStatus, JobwireError>
where
    S: StatusSignal,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobStatus, JobwireError>>,
{
    let status = load().await?;
    if status.is_terminal() {
        return Ok(status);
    }

    let total = timeout.saturating_mul(update_cycles.max(1));
    let deadline = Instant::now() + total;
    let mut signal_open = true;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(JobwireError::Timeout {
                job_id: job_id.to_string(),
                waited: total,
            });
        }
        let cycle = timeout.min(deadline - now);

        if signal_open {
            match tokio::time::timeout(cycle, signal.changed()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job_id, "status channel closed, falling back to periodic reload");
                    signal_open = false;
                }
                Err(_) => {}
            }
        } else {
            tokio::time::sleep(cycle).await;
        }

        let status = load().await?;
        if status.is_terminal() {
            return Ok(status);
        }
    }
}
