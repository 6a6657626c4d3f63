//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBroker / InMemoryResultStorage / InMemoryMetadataStore**: 開発・テスト用
//! - **Redis**（feature `redis`）: store-backed queue, status store, metadata store
//! - **AMQP**（feature `amqp`）: RabbitMQ の broker-backed queue と management API client

pub mod memory_broker;
pub mod memory_metadata;
pub mod memory_storage;

#[cfg(feature = "redis")]
pub mod redis_metadata;
#[cfg(feature = "redis")]
pub mod redis_queue;
#[cfg(feature = "redis")]
pub mod redis_storage;

#[cfg(feature = "amqp")]
pub mod amqp_queue;
#[cfg(feature = "amqp")]
pub mod management;

pub use self::memory_broker::InMemoryBroker;
pub use self::memory_metadata::InMemoryMetadataStore;
pub use self::memory_storage::InMemoryResultStorage;

#[cfg(feature = "redis")]
pub use self::redis_metadata::RedisMetadataStore;
#[cfg(feature = "redis")]
pub use self::redis_queue::RedisQueue;
#[cfg(feature = "redis")]
pub use self::redis_storage::RedisResultStorage;

#[cfg(feature = "amqp")]
pub use self::amqp_queue::AmqpQueue;
#[cfg(feature = "amqp")]
pub use self::management::ManagementClient;
