//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（broker, Redis, in-process）へのインターフェースを提供し、
//! 実装の詳細を隠蔽します。実装は [`crate::impls`] にある。
//!
//! - [`MessageQueue`]: 配送キュー（publish / get / consume / ack / nack + 管理操作）
//! - [`ResultStorage`]: job status の正本と完了待ち
//! - [`QueueMetadataStore`]: queue の説明用 metadata

pub mod message_queue;
pub mod metadata_store;
pub mod result_storage;

pub use self::message_queue::{MessageCallback, MessageQueue};
pub use self::metadata_store::QueueMetadataStore;
pub use self::result_storage::{ResultStorage, StatusSignal, wait_for_terminal};
