//! Domain model: identifiers, the task envelope, status records, queue
//! descriptions, and prompt payloads.
//!
//! I/O を持たない純粋なデータ定義と、その検証・状態遷移だけを置く。

pub mod envelope;
pub mod ids;
pub mod message;
pub mod prompt;
pub mod queue;
pub mod status;

pub use envelope::{ENVELOPE_KIND, TaskEnvelope, validate_priority};
pub use ids::{JobId, TaskType};
pub use message::{ConsumeOptions, DeliveryTag, GetOptions, Headers, PublishOptions, ReceivedMessage};
pub use prompt::{
    ChatCompletion, ChatMessage, ContentType, ContentUnit, MessageContent, ModelOptions, PromptMeta,
    PromptModel, PromptTransaction, ToolSpec,
};
pub use queue::{
    ConsumerInfo, MAX_PRIORITY_ARG, QueueDeclaration, QueueMetadata, QueueMetadataUpdate, QueueStats,
    QueueSummary,
};
pub use status::{JobStatus, JobStatusError, JobStatusType};
