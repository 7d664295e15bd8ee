//! Runs against a live server: `FOLIO_TEST_REDIS_URL=redis://... cargo test -- --ignored`

use std::time::Duration;

use folio_events::{Channel, RedisChannel, Requeue};

fn redis_url() -> String {
    std::env::var("FOLIO_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn open(queue: &str, reclaim_after: Duration) -> RedisChannel {
    let dead = format!("{}.dead", queue);
    RedisChannel::connect(&redis_url(), queue, &dead, reclaim_after)
        .await
        .unwrap()
}

async fn channel() -> RedisChannel {
    let queue = format!("folio-test-{}", uuid::Uuid::now_v7());
    open(&queue, Duration::from_secs(60)).await
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn publish_fetch_ack() {
    let channel = channel().await;
    channel.publish(b"one".to_vec()).await.unwrap();
    channel.publish(b"two".to_vec()).await.unwrap();

    let batch = channel.fetch(10, Duration::from_millis(100)).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].payload, b"one".to_vec());

    for delivery in &batch {
        channel.ack(delivery).await.unwrap();
    }
    assert_eq!(channel.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn requeue_restores_head_order_and_counts_attempts() {
    let channel = channel().await;
    for payload in ["a", "b", "c"] {
        channel.publish(payload.as_bytes().to_vec()).await.unwrap();
    }

    let batch = channel.fetch(2, Duration::ZERO).await.unwrap();
    channel.requeue(batch, Requeue::Penalize).await.unwrap();

    let again = channel.fetch(3, Duration::ZERO).await.unwrap();
    let seen: Vec<_> = again.iter().map(|d| (d.payload.clone(), d.attempts)).collect();
    assert_eq!(
        seen,
        vec![(b"a".to_vec(), 1), (b"b".to_vec(), 1), (b"c".to_vec(), 0)]
    );
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn blocking_fetch_on_empty_queue_times_out() {
    let channel = channel().await;
    let batch = channel.fetch(1, Duration::from_millis(200)).await.unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn abandoned_deliveries_return_to_the_head() {
    let queue = format!("folio-test-{}", uuid::Uuid::now_v7());
    let crashed = open(&queue, Duration::from_millis(200)).await;
    for payload in ["a", "b", "c"] {
        crashed.publish(payload.as_bytes().to_vec()).await.unwrap();
    }

    // Fetched and never settled: the consumer went away mid-drain.
    let held = crashed.fetch(2, Duration::ZERO).await.unwrap();
    assert_eq!(held.len(), 2);
    drop(held);
    drop(crashed);

    let early = open(&queue, Duration::from_millis(200)).await;
    assert_eq!(early.depth().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(early.reclaim().await.unwrap(), 2);
    assert_eq!(early.depth().await.unwrap(), 3);

    let batch = early.fetch(3, Duration::ZERO).await.unwrap();
    let seen: Vec<_> = batch.iter().map(|d| (d.payload.clone(), d.attempts)).collect();
    assert_eq!(
        seen,
        vec![(b"a".to_vec(), 0), (b"b".to_vec(), 0), (b"c".to_vec(), 0)]
    );
}

#[tokio::test]
#[ignore = "requires a Redis server"]
async fn settled_deliveries_are_never_reclaimed() {
    let queue = format!("folio-test-{}", uuid::Uuid::now_v7());
    let channel = open(&queue, Duration::from_millis(100)).await;
    channel.publish(b"done".to_vec()).await.unwrap();

    let batch = channel.fetch(1, Duration::ZERO).await.unwrap();
    channel.ack(&batch[0]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.reclaim().await.unwrap(), 0);
    assert_eq!(channel.depth().await.unwrap(), 0);
}
