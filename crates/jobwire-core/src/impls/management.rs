//! ManagementClient - RabbitMQ management HTTP API
//!
//! AMQP 0-9-1 には queue の列挙や consumer 一覧を取る手段がないので、
//! 管理系の読み取りはこちらを使う（`/api/queues`, `/api/consumers`）。

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::domain::{ConsumerInfo, QueueStats};
use crate::error::JobwireError;

#[derive(Debug, Deserialize)]
struct ApiQueue {
    name: String,
    #[serde(default)]
    messages: Option<u64>,
    #[serde(default)]
    consumers: Option<u64>,
}

impl ApiQueue {
    fn into_stats(self) -> QueueStats {
        QueueStats {
            name: self.name,
            consumers: clamp(self.consumers),
            messages: clamp(self.messages),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiQueueRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiConsumer {
    consumer_tag: String,
    queue: ApiQueueRef,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    prefetch_count: u16,
    #[serde(default)]
    ack_required: bool,
}

fn default_active() -> bool {
    true
}

fn clamp(value: Option<u64>) -> u32 {
    value.unwrap_or(0).min(u64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone)]
pub struct ManagementClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    password: String,
    vhost: String,
}

impl ManagementClient {
    pub fn new(
        base_url: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, JobwireError> {
        let base = Url::parse(base_url)
            .map_err(|e| JobwireError::validation(format!("invalid management url '{base_url}': {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            user: user.into(),
            password: password.into(),
            vhost: "/".into(),
        })
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// `base` + percent-encoded segments (`/` in the vhost becomes `%2F`).
    fn url(&self, segments: &[&str]) -> Result<Url, JobwireError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| JobwireError::validation("management url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<Option<T>, JobwireError> {
        debug!(%url, "management api request");
        let response = self
            .http
            .get(url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    /// Queues of the configured vhost, sorted by name.
    pub async fn queues(&self) -> Result<Vec<QueueStats>, JobwireError> {
        let url = self.url(&["api", "queues", &self.vhost])?;
        let queues: Vec<ApiQueue> = self.get_json(url).await?.unwrap_or_default();
        let mut stats: Vec<QueueStats> = queues.into_iter().map(ApiQueue::into_stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    pub async fn queue(&self, name: &str) -> Result<QueueStats, JobwireError> {
        let url = self.url(&["api", "queues", &self.vhost, name])?;
        self.get_json::<ApiQueue>(url)
            .await?
            .map(ApiQueue::into_stats)
            .ok_or_else(|| JobwireError::not_found("queue", name))
    }

    pub async fn consumers(&self) -> Result<Vec<ConsumerInfo>, JobwireError> {
        let url = self.url(&["api", "consumers", &self.vhost])?;
        let consumers: Vec<ApiConsumer> = self.get_json(url).await?.unwrap_or_default();
        Ok(consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                queue: c.queue.name,
                consumer_tag: c.consumer_tag,
                active: c.active,
                prefetch: c.prefetch_count,
                ack_required: c.ack_required,
            })
            .collect())
    }
}
