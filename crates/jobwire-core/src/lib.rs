//! jobwire-core
//!
//! Priority job dispatch over a message queue, with a result status store
//! that callers can wait on.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, status, message, queue, prompt）
//! - **ports**: 抽象化レイヤー（MessageQueue, ResultStorage, QueueMetadataStore）
//! - **impls**: 実装（in-memory / Redis / AMQP）
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **app**: Dispatcher, QueueAdmin, Worker
//! - **config / error / retry**: 設定、エラー分類、バックオフ
//!
//! # 使用例
//! ```ignore
//! let broker = Arc::new(InMemoryBroker::new());
//! let storage = Arc::new(InMemoryResultStorage::new());
//! broker.connect().await?;
//! broker.declare_queue(&QueueDeclaration::new("q").with_max_priority(10)).await?;
//!
//! let dispatcher = Dispatcher::new(broker.clone(), storage.clone());
//! let job_id = dispatcher.submit("q", PromptTransaction::single("hi").into_envelope()?).await?;
//! let outcome = dispatcher.get_result(&job_id, None).await?;
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod retry;
pub mod typed;

pub use crate::config::Config;
pub use crate::error::{ErrorKind, JobwireError};
