//! HandlerRegistry - Handler の登録と管理
//!
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

/// HandlerRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<PromptTransaction, _>(EchoHandler)?;
///
/// // task_type で DynHandler を取得
/// let handler = registry.get("generate");
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::new(handler)))
    }

    /// Register an already type-erased handler under its own task type.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type().to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatusError, PromptTransaction};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl Task for Ping {
        const TYPE: &'static str = "test.ping";
    }

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(&self, _task: Ping) -> Result<String, JobStatusError> {
            Ok("pong".into())
        }
    }

    struct Echo;

    #[async_trait]
    impl Handler<PromptTransaction> for Echo {
        async fn handle(&self, task: PromptTransaction) -> Result<String, JobStatusError> {
            Ok(task.into_chat().messages[0].content().text())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();

        assert!(registry.get(Ping::TYPE).is_some());
        assert!(registry.get("generate").is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();
        let result = registry.register::<Ping, _>(PingHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn different_task_types_do_not_mix() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(PingHandler).unwrap();
        registry.register::<PromptTransaction, _>(Echo).unwrap();
        assert_eq!(registry.registered_types(), vec!["generate", "test.ping"]);

        let payload = serde_json::to_value(PromptTransaction::single("hello")).unwrap();
        let echo = registry.get("generate").unwrap();
        assert_eq!(echo.handle_dyn(payload.clone()).await.unwrap(), "hello");

        // Ping は unit struct なので prompt payload は受け付けない
        let ping = registry.get(Ping::TYPE).unwrap();
        assert!(ping.handle_dyn(payload).await.is_err());
    }
}
