//! Channel acquisition.
//!
//! A [`Connector`] knows how to open a channel; the relay decides when.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{Channel, ChannelError, ChannelResult};
use crate::memory::InMemoryBroker;
use crate::redis_backend::{RedisChannel, DEFAULT_RECLAIM_AFTER};

/// Opens channel handles on demand
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new handle on the configured queue.
    async fn connect(&self) -> ChannelResult<Arc<dyn Channel>>;

    /// Where this connector points, for logs. Never includes credentials.
    fn describe(&self) -> String;
}

/// Connects to a Redis server
pub struct RedisConnector {
    url: String,
    queue: String,
    dead_letter: String,
    reclaim_after: Duration,
}

impl RedisConnector {
    pub fn new(
        url: impl Into<String>,
        queue: impl Into<String>,
        dead_letter: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            queue: queue.into(),
            dead_letter: dead_letter.into(),
            reclaim_after: DEFAULT_RECLAIM_AFTER,
        }
    }

    /// How long a fetched delivery may stay unsettled before another
    /// handle takes it back.
    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> ChannelResult<Arc<dyn Channel>> {
        let channel = RedisChannel::connect(
            &self.url,
            &self.queue,
            &self.dead_letter,
            self.reclaim_after,
        )
        .await?;
        Ok(Arc::new(channel))
    }

    fn describe(&self) -> String {
        format!("redis://{}/{}", redact_host(&self.url), self.queue)
    }
}

/// Opens handles on an in-process broker
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    queue: String,
    dead_letter: String,
}

impl InMemoryConnector {
    pub fn new(
        broker: Arc<InMemoryBroker>,
        queue: impl Into<String>,
        dead_letter: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            dead_letter: dead_letter.into(),
        }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self) -> ChannelResult<Arc<dyn Channel>> {
        Ok(Arc::new(self.broker.channel(&self.queue, &self.dead_letter)))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.queue)
    }
}

/// Pick a connector from the broker URL scheme.
pub fn connector_for_url(
    url: &str,
    queue: &str,
    dead_letter: &str,
    reclaim_after: Duration,
) -> ChannelResult<Arc<dyn Connector>> {
    match url.split_once("://").map(|(scheme, _)| scheme) {
        Some("redis") | Some("rediss") => Ok(Arc::new(
            RedisConnector::new(url, queue, dead_letter).with_reclaim_after(reclaim_after),
        )),
        Some("memory") => Ok(Arc::new(InMemoryConnector::new(
            InMemoryBroker::new(),
            queue,
            dead_letter,
        ))),
        _ => Err(ChannelError::InvalidConfiguration(format!(
            "unsupported broker URL '{}'; expected redis://, rediss:// or memory://",
            redact_host(url)
        ))),
    }
}

/// Host part of a URL with any `user:password@` dropped.
fn redact_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    rest.split('/').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_backend() {
        let memory = connector_for_url("memory://", "q", "q.dead", DEFAULT_RECLAIM_AFTER).unwrap();
        assert_eq!(memory.describe(), "memory://q");

        let redis = connector_for_url(
            "redis://:secret@cache:6379/0",
            "q",
            "q.dead",
            DEFAULT_RECLAIM_AFTER,
        ).unwrap();
        assert_eq!(redis.describe(), "redis://cache:6379/q");

        assert!(matches!(
            connector_for_url("amqp://rabbit", "q", "q.dead", DEFAULT_RECLAIM_AFTER),
            Err(ChannelError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn memory_handles_share_one_broker() {
        let connector = InMemoryConnector::new(InMemoryBroker::new(), "q", "q.dead");
        let first = connector.connect().await.unwrap();
        first.publish(b"x".to_vec()).await.unwrap();
        first.close().await.unwrap();

        let second = connector.connect().await.unwrap();
        assert_eq!(second.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_redis_is_unavailable() {
        let connector = RedisConnector::new("redis://127.0.0.1:1", "q", "q.dead");
        let err = match connector.connect().await {
            Err(e) => e,
            Ok(_) => panic!("nothing listens on port 1"),
        };
        assert!(matches!(err, ChannelError::Unavailable(_)));
    }
}
