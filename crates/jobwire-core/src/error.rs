//! Errors - jobwire 全体で共有するエラー型と分類
//!
//! Backend (memory / Redis / AMQP) はすべて [`JobwireError`] を返し、
//! Dispatcher / Admin 層は新しいエラー型を足さずにそのまま伝播する。
//!
//! # 分類
//! [`JobwireError::kind`] が [`ErrorKind`] を返す。
//! - Transient: 接続断・タイムアウトなど、待てば回復しうるもの（[`crate::retry::RetryPolicy`] が再試行）
//! - Fatal: 何度やっても結果が変わらないもの（即座に呼び出し元へ）

use std::time::Duration;

use thiserror::Error;

/// ErrorKind は運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum JobwireError {
    /// Backend unreachable or the connection was never established.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rejected before reaching the backend (bad priority, conflicting declaration, ...).
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Wait deadline elapsed before a terminal status was observed.
    /// The job may still be running.
    #[error("job {job_id} did not reach a terminal state within {waited:?}")]
    Timeout { job_id: String, waited: Duration },

    /// Malformed message body or stored record.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Attempt to overwrite a COMPLETED / ERROR record.
    #[error("job {0} is already in a terminal state")]
    TerminalState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "amqp")]
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[cfg(feature = "amqp")]
    #[error("management api error: {0}")]
    Http(#[from] reqwest::Error),
}

impl JobwireError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Transient か Fatal かを判定する
    ///
    /// backend ラッパーは中身を見て振り分ける（I/O 系だけ Transient）。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Transient,
            #[cfg(feature = "redis")]
            Self::Redis(err) => {
                if err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
                {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            #[cfg(feature = "amqp")]
            Self::Amqp(err) => match err {
                lapin::Error::IOError(_) => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            #[cfg(feature = "amqp")]
            Self::Http(err) => {
                if err.is_connect() || err.is_timeout() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
