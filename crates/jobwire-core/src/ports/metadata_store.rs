//! QueueMetadataStore port - queue ごとの説明用 record
//!
//! broker が配送可否の正本。ここに置くのは model / description などの補助情報だけ。

use async_trait::async_trait;

use crate::domain::{QueueMetadata, QueueMetadataUpdate};
use crate::error::JobwireError;

#[async_trait]
pub trait QueueMetadataStore: Send + Sync {
    /// Upsert keyed by queue name. Returns the record id.
    async fn insert(&self, metadata: QueueMetadata) -> Result<String, JobwireError>;

    async fn get(&self, queue_name: &str) -> Result<Option<QueueMetadata>, JobwireError>;

    /// Returns `false` when there is no record for `queue_name`.
    async fn update(
        &self,
        queue_name: &str,
        update: &QueueMetadataUpdate,
    ) -> Result<bool, JobwireError>;

    /// Returns whether a record was removed.
    async fn delete(&self, queue_name: &str) -> Result<bool, JobwireError>;

    async fn list(&self) -> Result<Vec<QueueMetadata>, JobwireError>;
}
