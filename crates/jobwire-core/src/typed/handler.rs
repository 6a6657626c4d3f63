//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (`Handler<T>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure (`TypedHandler<T, H>` → `DynHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::JobStatusError;

/// Handler は Task を実行して結果の文字列を返す
///
/// `Err` は job の失敗として ERROR status に記録される（worker は ack する）。
///
/// # 使用例
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Handler<PromptTransaction> for Echo {
///     async fn handle(&self, task: PromptTransaction) -> Result<String, JobStatusError> {
///         Ok(task.into_chat().messages.last().map(|m| m.content().text()).unwrap_or_default())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<String, JobStatusError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `TypedHandler<T, H>` を DynHandler に変換することで、
/// `HashMap<String, Arc<dyn DynHandler>>` に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<String, JobStatusError>;
    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<String, JobStatusError> {
        let task: T = serde_json::from_value(payload).map_err(|e| {
            JobStatusError::new("ValidationError", format!("invalid {} payload: {e}", T::TYPE))
        })?;
        self.handler.handle(task).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Task for Add {
        const TYPE: &'static str = "test.add";
    }

    struct AddHandler;

    #[async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, task: Add) -> Result<String, JobStatusError> {
            Ok((task.a + task.b).to_string())
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let result = handler.handle_dyn(json!({"a": 40, "b": 2})).await.unwrap();
        assert_eq!(result, "42");
        assert_eq!(handler.task_type(), "test.add");
    }

    #[tokio::test]
    async fn payload_mismatch_is_a_job_error() {
        let handler = TypedHandler::<Add, _>::new(AddHandler);
        let err = handler.handle_dyn(json!({"a": "x"})).await.unwrap_err();
        assert_eq!(err.kind, "ValidationError");
    }
}
