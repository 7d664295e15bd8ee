//! In-process broker.
//!
//! Queues live as long as the [`InMemoryBroker`]; channel handles can be
//! closed and reopened against it like connections to a real broker. Used by
//! tests and by `broker.url = "memory://"`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError, ChannelResult, Delivery, Envelope, Requeue};

/// A delivery handed out, tagged with the handle that fetched it.
struct Lease {
    holder: u64,
    envelope: Envelope,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<String, Lease>,
}

/// Shared queue storage behind [`InMemoryChannel`] handles
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_handle: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a handle on `queue`, dead-lettering into `dead_letter`.
    pub fn channel(self: &Arc<Self>, queue: &str, dead_letter: &str) -> InMemoryChannel {
        InMemoryChannel {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            broker: self.clone(),
            queue: queue.to_string(),
            dead_letter: dead_letter.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliveries waiting in `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out from `queue` and not settled yet.
    pub async fn in_flight(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.in_flight.len())
            .unwrap_or(0)
    }

    /// Payloads waiting in `queue`, head first.
    pub async fn payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|e| e.body.clone().into_bytes())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push a payload the way a foreign producer would, bypassing framing.
    pub async fn push_raw(&self, queue: &str, raw: &[u8]) {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Envelope::from_raw(raw));
        drop(queues);
        self.notify.notify_waiters();
    }
}

/// Handle on one queue of an [`InMemoryBroker`]
pub struct InMemoryChannel {
    id: u64,
    broker: Arc<InMemoryBroker>,
    queue: String,
    dead_letter: String,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> ChannelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed(self.queue.clone()));
        }
        Ok(())
    }

    async fn take_ready(&self, max: usize) -> Vec<Delivery> {
        let mut queues = self.broker.queues.lock().await;
        let state = queues.entry(self.queue.clone()).or_default();

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(envelope) = state.ready.pop_front() else {
                break;
            };
            let receipt = envelope.id.clone().into_bytes();
            state.in_flight.insert(
                envelope.id.clone(),
                Lease {
                    holder: self.id,
                    envelope: envelope.clone(),
                },
            );
            batch.push(envelope.into_delivery(receipt));
        }
        batch
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn publish(&self, payload: Vec<u8>) -> ChannelResult<()> {
        self.ensure_open()?;
        let envelope = Envelope::new(payload)?;

        let mut queues = self.broker.queues.lock().await;
        queues
            .entry(self.queue.clone())
            .or_default()
            .ready
            .push_back(envelope);
        drop(queues);

        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, max: usize, wait: Duration) -> ChannelResult<Vec<Delivery>> {
        self.ensure_open()?;
        let max = max.max(1);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking, so a publish in between wakes us.
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(max).await;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.ensure_open()?;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let mut queues = self.broker.queues.lock().await;
        let state = queues.entry(self.queue.clone()).or_default();

        match state.in_flight.remove(&delivery.id) {
            Some(_) => Ok(()),
            None => Err(ChannelError::UnknownDelivery(delivery.id.clone())),
        }
    }

    async fn requeue(&self, deliveries: Vec<Delivery>, mode: Requeue) -> ChannelResult<()> {
        let mut queues = self.broker.queues.lock().await;
        let state = queues.entry(self.queue.clone()).or_default();

        for delivery in &deliveries {
            if !state.in_flight.contains_key(&delivery.id) {
                return Err(ChannelError::UnknownDelivery(delivery.id.clone()));
            }
        }

        // Reverse so the first delivery ends up at the head.
        for delivery in deliveries.iter().rev() {
            state.in_flight.remove(&delivery.id);
            state
                .ready
                .push_front(Envelope::from_delivery(delivery, mode));
        }
        drop(queues);

        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery) -> ChannelResult<()> {
        let mut queues = self.broker.queues.lock().await;

        let removed = queues
            .entry(self.queue.clone())
            .or_default()
            .in_flight
            .remove(&delivery.id);
        if removed.is_none() {
            return Err(ChannelError::UnknownDelivery(delivery.id));
        }

        queues
            .entry(self.dead_letter.clone())
            .or_default()
            .ready
            .push_back(Envelope::from_delivery(&delivery, Requeue::Penalize));
        Ok(())
    }

    async fn depth(&self) -> ChannelResult<usize> {
        self.ensure_open()?;
        Ok(self.broker.depth(&self.queue).await)
    }

    /// Like a broker closing a consumer's channel: deliveries this handle
    /// still holds go back to the head of the queue, attempts unchanged.
    async fn close(&self) -> ChannelResult<()> {
        self.closed.store(true, Ordering::Release);

        let mut queues = self.broker.queues.lock().await;
        if let Some(state) = queues.get_mut(&self.queue) {
            let held: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.holder == self.id)
                .map(|(id, _)| id.clone())
                .collect();

            let mut returned: Vec<Envelope> = held
                .iter()
                .filter_map(|id| state.in_flight.remove(id))
                .map(|lease| lease.envelope)
                .collect();
            // v7 ids sort by publish time.
            returned.sort_by(|a, b| a.id.cmp(&b.id));

            if !returned.is_empty() {
                tracing::debug!(
                    queue = %self.queue,
                    returned = returned.len(),
                    "closed handle returned unsettled deliveries"
                );
            }
            for envelope in returned.into_iter().rev() {
                state.ready.push_front(envelope);
            }
        }
        drop(queues);

        self.broker.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "updates";
    const DEAD: &str = "updates.dead";

    #[tokio::test]
    async fn publish_then_fetch_is_fifo() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel(QUEUE, DEAD);

        channel.publish(b"one".to_vec()).await.unwrap();
        channel.publish(b"two".to_vec()).await.unwrap();

        let batch = channel.fetch(10, Duration::ZERO).await.unwrap();
        let payloads: Vec<_> = batch.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(broker.in_flight(QUEUE).await, 2);
    }

    #[tokio::test]
    async fn ack_twice_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel(QUEUE, DEAD);
        channel.publish(b"one".to_vec()).await.unwrap();

        let batch = channel.fetch(1, Duration::ZERO).await.unwrap();
        channel.ack(&batch[0]).await.unwrap();
        assert!(matches!(
            channel.ack(&batch[0]).await,
            Err(ChannelError::UnknownDelivery(_))
        ));
        assert_eq!(broker.depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn requeue_returns_to_head_in_order() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel(QUEUE, DEAD);
        for payload in ["a", "b", "c"] {
            channel.publish(payload.as_bytes().to_vec()).await.unwrap();
        }

        let batch = channel.fetch(2, Duration::ZERO).await.unwrap();
        channel.requeue(batch, Requeue::Penalize).await.unwrap();

        let again = channel.fetch(3, Duration::ZERO).await.unwrap();
        let seen: Vec<_> = again
            .iter()
            .map(|d| (String::from_utf8(d.payload.clone()).unwrap(), d.attempts))
            .collect();
        assert_eq!(
            seen,
            vec![("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 0)]
        );
    }

    #[tokio::test]
    async fn dead_letter_moves_to_side_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel(QUEUE, DEAD);
        channel.publish(b"poison".to_vec()).await.unwrap();

        let mut batch = channel.fetch(1, Duration::ZERO).await.unwrap();
        channel.dead_letter(batch.remove(0)).await.unwrap();

        assert_eq!(broker.depth(QUEUE).await, 0);
        assert_eq!(broker.in_flight(QUEUE).await, 0);
        assert_eq!(broker.payloads(DEAD).await, vec![b"poison".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_on_empty_queue_waits_out_the_timeout() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel(QUEUE, DEAD);

        let started = Instant::now();
        let batch = channel.fetch(5, Duration::from_millis(300)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn fetch_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let consumer = broker.channel(QUEUE, DEAD);
        let producer = broker.channel(QUEUE, DEAD);

        let waiter = tokio::spawn(async move { consumer.fetch(1, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.publish(b"late".to_vec()).await.unwrap();

        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn close_returns_unsettled_deliveries_of_that_handle_only() {
        let broker = InMemoryBroker::new();
        let first = broker.channel(QUEUE, DEAD);
        let second = broker.channel(QUEUE, DEAD);
        for payload in ["a", "b", "c"] {
            first.publish(payload.as_bytes().to_vec()).await.unwrap();
        }

        let held = first.fetch(2, Duration::ZERO).await.unwrap();
        let other = second.fetch(1, Duration::ZERO).await.unwrap();
        assert_eq!(other[0].payload, b"c".to_vec());
        assert_eq!(held.len(), 2);

        first.close().await.unwrap();

        assert_eq!(broker.in_flight(QUEUE).await, 1);
        assert_eq!(
            broker.payloads(QUEUE).await,
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        second.ack(&other[0]).await.unwrap();
    }

    #[tokio::test]
    async fn closed_handle_keeps_data_on_broker() {
        let broker = InMemoryBroker::new();
        let first = broker.channel(QUEUE, DEAD);
        first.publish(b"kept".to_vec()).await.unwrap();
        first.close().await.unwrap();

        assert!(matches!(
            first.publish(b"x".to_vec()).await,
            Err(ChannelError::Closed(_))
        ));

        let second = broker.channel(QUEUE, DEAD);
        assert_eq!(second.depth().await.unwrap(), 1);
    }
}
