//! Backend wiring by [`BackendKind`].

use std::sync::Arc;

use anyhow::{Context, Result};
use jobwire_core::config::{BackendKind, Config};
use jobwire_core::impls::{
    InMemoryBroker, InMemoryMetadataStore, InMemoryResultStorage, RedisMetadataStore, RedisQueue,
    RedisResultStorage,
};
use jobwire_core::ports::{MessageQueue, QueueMetadataStore, ResultStorage};
use tracing::{info, warn};

pub struct Services {
    pub queue: Arc<dyn MessageQueue>,
    pub storage: Arc<dyn ResultStorage>,
    pub metadata: Arc<dyn QueueMetadataStore>,
}

impl Services {
    /// In-process backends; nothing is shared with other processes.
    pub fn memory() -> Self {
        Self {
            queue: Arc::new(InMemoryBroker::new()),
            storage: Arc::new(InMemoryResultStorage::new()),
            metadata: Arc::new(InMemoryMetadataStore::new()),
        }
    }

    /// Status and metadata always live in Redis; the queue follows `backend`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let services = match config.backend {
            BackendKind::Memory => {
                warn!("memory backend: state is local to this process");
                Self::memory()
            }
            BackendKind::Redis => Self {
                queue: Arc::new(RedisQueue::new(&config.redis.url).context("invalid redis url")?),
                storage: redis_storage(config)?,
                metadata: redis_metadata(config)?,
            },
            BackendKind::Amqp => Self {
                queue: amqp_queue(config)?,
                storage: redis_storage(config)?,
                metadata: redis_metadata(config)?,
            },
        };
        services
            .queue
            .connect()
            .await
            .with_context(|| format!("connecting to the {} backend", services.queue.backend_name()))?;
        info!(backend = services.queue.backend_name(), "connected");
        Ok(services)
    }
}

fn redis_storage(config: &Config) -> Result<Arc<dyn ResultStorage>> {
    let storage = RedisResultStorage::new(&config.redis.url, config.redis.prefix.clone())
        .context("invalid redis url")?;
    Ok(Arc::new(storage))
}

fn redis_metadata(config: &Config) -> Result<Arc<dyn QueueMetadataStore>> {
    let metadata = RedisMetadataStore::new(&config.redis.url, config.metadata.database.clone())
        .context("invalid redis url")?;
    Ok(Arc::new(metadata))
}

#[cfg(feature = "amqp")]
fn amqp_queue(config: &Config) -> Result<Arc<dyn MessageQueue>> {
    use jobwire_core::impls::{AmqpQueue, ManagementClient};

    let management = ManagementClient::new(
        &config.broker.management_url,
        config.broker.management_user.clone(),
        config.broker.management_password.clone(),
    )
    .context("invalid management url")?;
    Ok(Arc::new(AmqpQueue::new(config.broker.url.clone(), management)))
}

#[cfg(not(feature = "amqp"))]
fn amqp_queue(_config: &Config) -> Result<Arc<dyn MessageQueue>> {
    anyhow::bail!("this binary was built without the `amqp` feature")
}
