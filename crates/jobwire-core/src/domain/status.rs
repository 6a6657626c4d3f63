//! Result Status Record - job ごとのライフサイクル記録
//!
//! PENDING → IN_PROGRESS → COMPLETED | ERROR
//!
//! 状態遷移はすべてこのモジュールのメソッド経由で行う。terminal になった record は
//! 二度と書き換えない（[`JobStatus::ensure_open`] が `TerminalState` を返す）。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use crate::error::JobwireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatusType {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl JobStatusType {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for JobStatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        })
    }
}

/// Structured failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusError {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
}

impl JobStatusError {
    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
        }
    }
}

impl fmt::Display for JobStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobStatusType,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Set only on COMPLETED.
    #[serde(default)]
    pub result: Option<String>,
    /// Set only on ERROR.
    #[serde(default)]
    pub error: Option<JobStatusError>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            status: JobStatusType::Pending,
            last_update: Utc::now(),
            status_message: Some("Job created".to_string()),
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn ensure_open(&self, job_id: &JobId) -> Result<(), JobwireError> {
        if self.is_terminal() {
            return Err(JobwireError::TerminalState(job_id.to_string()));
        }
        Ok(())
    }

    /// Partial update: status and message change, result / error are kept.
    ///
    /// A terminal `status` goes through [`JobStatus::complete`] so the
    /// result/error invariants hold no matter which entry point was used.
    pub fn apply_update(
        &mut self,
        job_id: &JobId,
        status: JobStatusType,
        message: Option<String>,
    ) -> Result<(), JobwireError> {
        self.ensure_open(job_id)?;
        if status.is_terminal() {
            let error = match status {
                JobStatusType::Error => Some(
                    self.error
                        .clone()
                        .unwrap_or_else(|| JobStatusError::new("JobError", message.clone().unwrap_or_default())),
                ),
                _ => None,
            };
            let result = self.result.clone();
            return self.complete(job_id, result, error, message);
        }
        self.status = status;
        self.status_message = message;
        self.last_update = Utc::now();
        Ok(())
    }

    /// Terminal write. Status is ERROR when `error` is present, else COMPLETED.
    pub fn complete(
        &mut self,
        job_id: &JobId,
        result: Option<String>,
        error: Option<JobStatusError>,
        message: Option<String>,
    ) -> Result<(), JobwireError> {
        self.ensure_open(job_id)?;
        match error {
            Some(error) => {
                self.status = JobStatusType::Error;
                self.result = None;
                self.error = Some(error);
            }
            None => {
                self.status = JobStatusType::Completed;
                self.result = result;
                self.error = None;
            }
        }
        self.status_message = message;
        self.last_update = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_names_on_the_wire() {
        assert_eq!(serde_json::to_value(JobStatusType::InProgress).unwrap(), json!("in_progress"));
        assert_eq!(serde_json::to_value(JobStatusType::Error).unwrap(), json!("error"));
    }

    #[test]
    fn update_keeps_result_and_error_fields() {
        let id = JobId::new("a");
        let mut status = JobStatus::pending();
        status.result = Some("partial".into());

        status
            .apply_update(&id, JobStatusType::InProgress, Some("Job running on worker".into()))
            .unwrap();

        assert_eq!(status.status, JobStatusType::InProgress);
        assert_eq!(status.result.as_deref(), Some("partial"));
    }

    #[test]
    fn error_wins_over_result() {
        let id = JobId::new("a");
        let mut status = JobStatus::pending();
        status
            .complete(&id, Some("42".into()), Some(JobStatusError::new("LLMError", "boom")), None)
            .unwrap();

        assert_eq!(status.status, JobStatusType::Error);
        assert_eq!(status.result, None);
        assert_eq!(status.error.as_ref().map(|e| e.kind.as_str()), Some("LLMError"));
    }

    #[test]
    fn terminal_records_reject_every_write() {
        let id = JobId::new("a");
        let mut status = JobStatus::pending();
        status.complete(&id, Some("42".into()), None, None).unwrap();
        let frozen = status.clone();

        assert!(matches!(
            status.complete(&id, Some("43".into()), None, None),
            Err(JobwireError::TerminalState(_))
        ));
        assert!(matches!(
            status.apply_update(&id, JobStatusType::InProgress, None),
            Err(JobwireError::TerminalState(_))
        ));
        assert_eq!(status, frozen);
    }

    #[test]
    fn terminal_update_goes_through_completion() {
        let id = JobId::new("a");
        let mut status = JobStatus::pending();
        status
            .apply_update(&id, JobStatusType::Error, Some("cancelled".into()))
            .unwrap();

        assert_eq!(status.status, JobStatusType::Error);
        assert_eq!(status.error, Some(JobStatusError::new("JobError", "cancelled")));
    }

    #[test]
    fn record_json_shape() {
        let value = serde_json::to_value(JobStatus::pending()).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["status_message"], "Job created");
        assert!(value["last_update"].is_string());
        assert_eq!(value["result"], serde_json::Value::Null);
    }
}
