//! Broker channel abstraction.
//!
//! A [`Channel`] is a handle on one named durable queue. Deliveries fetched
//! from it stay in flight until they are acknowledged, requeued or moved to
//! the dead-letter queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by channel backends
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected or failed an operation
    #[error("broker error: {0}")]
    Backend(String),

    /// A delivery is not in flight on this channel (already settled)
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    /// Bad URL or names
    #[error("invalid channel configuration: {0}")]
    InvalidConfiguration(String),

    /// The handle was closed
    #[error("channel closed: {0}")]
    Closed(String),

    /// A payload could not be framed for transport
    #[error("payload encoding: {0}")]
    Encoding(String),
}

impl ChannelError {
    /// Whether the handle should be dropped and reacquired.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ChannelError::Unavailable(_) | ChannelError::Closed(_))
    }
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport id, stable across redeliveries
    pub id: String,
    /// Failed deliveries before this one
    pub attempts: u32,
    /// Serialized record, exactly as published
    pub payload: Vec<u8>,
    pub(crate) receipt: Vec<u8>,
}

/// How a requeued delivery is accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The delivery failed; its attempt counter goes up.
    Penalize,
    /// The delivery was never processed; its attempt counter is kept.
    Release,
}

/// Handle on a named durable queue
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue name
    fn name(&self) -> &str;

    /// Append a payload at the tail; returns once the broker accepted it.
    async fn publish(&self, payload: Vec<u8>) -> ChannelResult<()>;

    /// Take up to `max` deliveries from the head, waiting at most `wait`
    /// for the first one. An empty result means nothing arrived in time.
    async fn fetch(&self, max: usize, wait: Duration) -> ChannelResult<Vec<Delivery>>;

    /// Settle a delivery as processed; it is gone for good.
    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()>;

    /// Return deliveries to the head of the queue, keeping their order.
    async fn requeue(&self, deliveries: Vec<Delivery>, mode: Requeue) -> ChannelResult<()>;

    /// Move a delivery to the dead-letter queue.
    async fn dead_letter(&self, delivery: Delivery) -> ChannelResult<()>;

    /// Number of deliveries waiting (not in flight).
    async fn depth(&self) -> ChannelResult<usize>;

    /// Release the handle; queued data stays on the broker.
    async fn close(&self) -> ChannelResult<()>;
}

/// Transport frame around a payload.
///
/// Carries what AMQP would put in message properties: an id and the number
/// of failed deliveries. `body` is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: String,
    #[serde(default)]
    pub attempts: u32,
    pub body: String,
}

impl Envelope {
    pub fn new(payload: Vec<u8>) -> ChannelResult<Self> {
        let body = String::from_utf8(payload)
            .map_err(|e| ChannelError::Encoding(format!("payload is not UTF-8: {}", e)))?;

        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            attempts: 0,
            body,
        })
    }

    /// Parse a raw queue entry. Entries pushed by other writers are not
    /// envelopes; they are wrapped as-is with a fresh id.
    pub fn from_raw(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Envelope>(raw) {
            Ok(envelope) => envelope,
            Err(_) => Self {
                id: uuid::Uuid::now_v7().to_string(),
                attempts: 0,
                body: String::from_utf8_lossy(raw).into_owned(),
            },
        }
    }

    pub fn to_bytes(&self) -> ChannelResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ChannelError::Encoding(e.to_string()))
    }

    pub fn into_delivery(self, receipt: Vec<u8>) -> Delivery {
        Delivery {
            id: self.id,
            attempts: self.attempts,
            payload: self.body.into_bytes(),
            receipt,
        }
    }

    /// Rebuild the frame of a delivery for requeue or dead-lettering.
    pub fn from_delivery(delivery: &Delivery, mode: Requeue) -> Self {
        let attempts = match mode {
            Requeue::Penalize => delivery.attempts.saturating_add(1),
            Requeue::Release => delivery.attempts,
        };

        Self {
            id: delivery.id.clone(),
            attempts,
            body: String::from_utf8_lossy(&delivery.payload).into_owned(),
        }
    }
}
