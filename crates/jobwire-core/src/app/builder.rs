//! WorkerBuilder - worker の構築とワイヤリング
//!
//! # 設計
//! - Builder パターン
//! - 起動時検証（Fail-fast）: 期待した task type に handler が無ければ起動しない

use std::sync::Arc;

use crate::domain::ConsumeOptions;
use crate::ports::{MessageQueue, ResultStorage};
use crate::retry::RetryPolicy;
use crate::typed::{Handler, HandlerRegistry, RegistryError, Task};

use super::worker::Worker;

/// WorkerBuilder は [`Worker`] を構築
///
/// # 使用例
/// ```ignore
/// let worker = WorkerBuilder::new(queue, storage)
///     .register::<PromptTransaction, _>(EchoHandler)?
///     .expect_tasks(&["generate"])
///     .prefetch(config.worker.prefetch)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct WorkerBuilder {
    queue: Arc<dyn MessageQueue>,
    storage: Arc<dyn ResultStorage>,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    options: ConsumeOptions,
    retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
    #[error("auto_ack workers cannot requeue failed deliveries")]
    AutoAck,
}

impl WorkerBuilder {
    pub fn new(queue: Arc<dyn MessageQueue>, storage: Arc<dyn ResultStorage>) -> Self {
        Self {
            queue,
            storage,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            options: ConsumeOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.options.prefetch = prefetch;
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.options.consumer_tag = Some(tag.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// # 検証
    /// - expect_tasks() で設定された task_type が全て登録されているかチェック
    /// - auto_ack の consume は許可しない（失敗時に requeue できないため）
    pub fn build(self) -> Result<Worker, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        if self.options.auto_ack {
            return Err(BuildError::AutoAck);
        }
        Ok(Worker::new(
            self.queue,
            self.storage,
            Arc::new(self.registry),
            self.options,
            self.retry,
        ))
    }
}
