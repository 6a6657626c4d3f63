//! InMemoryMetadataStore - queue metadata をプロセス内に持つ

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{QueueMetadata, QueueMetadataUpdate};
use crate::error::JobwireError;
use crate::ports::QueueMetadataStore;

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<BTreeMap<String, QueueMetadata>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueMetadataStore for InMemoryMetadataStore {
    async fn insert(&self, metadata: QueueMetadata) -> Result<String, JobwireError> {
        let id = metadata.id.clone();
        self.records
            .write()
            .await
            .insert(metadata.queue_name.clone(), metadata);
        Ok(id)
    }

    async fn get(&self, queue_name: &str) -> Result<Option<QueueMetadata>, JobwireError> {
        Ok(self.records.read().await.get(queue_name).cloned())
    }

    async fn update(
        &self,
        queue_name: &str,
        update: &QueueMetadataUpdate,
    ) -> Result<bool, JobwireError> {
        let mut records = self.records.write().await;
        match records.get_mut(queue_name) {
            Some(metadata) => {
                update.apply(metadata);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, queue_name: &str) -> Result<bool, JobwireError> {
        Ok(self.records.write().await.remove(queue_name).is_some())
    }

    async fn list(&self) -> Result<Vec<QueueMetadata>, JobwireError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueDeclaration;

    #[tokio::test]
    async fn insert_is_an_upsert_by_queue_name() {
        let store = InMemoryMetadataStore::new();
        let declaration = QueueDeclaration::new("q");

        store
            .insert(QueueMetadata::from_declaration(&declaration, Some("a".into()), None))
            .await
            .unwrap();
        let id = store
            .insert(QueueMetadata::from_declaration(&declaration, Some("b".into()), None))
            .await
            .unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].model.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_records() {
        let store = InMemoryMetadataStore::new();
        let update = QueueMetadataUpdate {
            model: None,
            description: Some("gpu pool".into()),
        };
        assert!(!store.update("q", &update).await.unwrap());
        assert!(!store.delete("q").await.unwrap());

        store
            .insert(QueueMetadata::from_declaration(&QueueDeclaration::new("q"), None, None))
            .await
            .unwrap();
        assert!(store.update("q", &update).await.unwrap());
        assert_eq!(
            store.get("q").await.unwrap().unwrap().description.as_deref(),
            Some("gpu pool")
        );
        assert!(store.delete("q").await.unwrap());
        assert!(store.get("q").await.unwrap().is_none());
    }
}
