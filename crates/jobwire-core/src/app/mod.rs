//! App - アプリケーション層
//!
//! ports を組み合わせて、外側（HTTP 層や CLI）に見せる操作を実装する。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: status 作成 → publish、結果待ち
//! - **QueueAdmin**: queue の宣言・削除・更新・purge・一覧、メッセージの点検と削除
//! - **WorkerBuilder / Worker**: consume → handler → status 書き込み → ack/nack

pub mod admin;
pub mod builder;
pub mod dispatcher;
pub mod worker;

pub use self::admin::{InspectedMessage, QueueAdmin, QueueDeclarationRequest};
pub use self::builder::{BuildError, WorkerBuilder};
pub use self::dispatcher::{Dispatcher, JOB_ID_HEADER, JobOutcome};
pub use self::worker::{Worker, WorkerHandle};
