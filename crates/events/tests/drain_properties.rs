use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use folio_events::{
    Action, ApplyError, Channel, ChannelError, ChannelResult, Connector, Delivery, DrainOptions,
    Entity, InMemoryBroker, InMemoryConnector, MutationHandler, MutationRecord, Relay, RelayError,
    Requeue,
};
use folio_kernel::settings::UnsupportedPolicy;
use serde_json::json;

const QUEUE: &str = "catalog-updates";
const DEAD: &str = "catalog-updates.dead";

/// Records the `name` of every record it sees and fails the ones listed.
#[derive(Default)]
struct ScriptedHandler {
    seen: Mutex<Vec<String>>,
    failing: Vec<String>,
    delay: Option<Duration>,
}

impl ScriptedHandler {
    fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutationHandler for ScriptedHandler {
    async fn apply(&self, record: &MutationRecord) -> Result<(), ApplyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let name = record.data()["name"].as_str().unwrap_or_default().to_string();
        self.seen.lock().unwrap().push(name.clone());

        if self.failing.contains(&name) {
            return Err(ApplyError::NotFound {
                entity: record.entity(),
                id: name,
            });
        }
        Ok(())
    }
}

fn setup(window_ms: u64) -> (Arc<InMemoryBroker>, Relay) {
    let broker = InMemoryBroker::new();
    let relay = Relay::new(
        Arc::new(InMemoryConnector::new(broker.clone(), QUEUE, DEAD)),
        DrainOptions {
            window: Duration::from_millis(window_ms),
            ..DrainOptions::default()
        },
    );
    (broker, relay)
}

fn create_author(name: &str) -> MutationRecord {
    MutationRecord::new(Entity::Author, Action::Create, json!({ "name": name }), "ada").unwrap()
}

#[tokio::test]
async fn every_enqueued_record_is_applied_exactly_once() {
    let (broker, relay) = setup(100);
    for name in ["a", "b", "c", "d"] {
        relay.enqueue(&create_author(name)).await.unwrap();
    }

    let handler = ScriptedHandler::default();
    let report = relay.drain(&handler).await.unwrap();

    assert_eq!(report.applied, 4);
    assert_eq!(handler.seen().len(), 4);
    assert_eq!(broker.depth(QUEUE).await, 0);
    assert_eq!(broker.in_flight(QUEUE).await, 0);

    let again = relay.drain(&handler).await.unwrap();
    assert_eq!(again.applied, 0);
}

#[tokio::test]
async fn records_from_one_producer_arrive_in_order() {
    let (_broker, relay) = setup(100);
    let names = ["first", "second", "third", "fourth", "fifth"];
    for name in names {
        relay.enqueue(&create_author(name)).await.unwrap();
    }

    let handler = ScriptedHandler::default();
    relay
        .drain_with(
            &handler,
            &DrainOptions {
                prefetch: 2,
                ..relay.options().clone()
            },
        )
        .await
        .unwrap();

    assert_eq!(handler.seen(), names);
}

#[tokio::test]
async fn empty_channel_returns_zero_within_the_window() {
    let (_broker, relay) = setup(150);

    let started = Instant::now();
    let report = relay.drain(&ScriptedHandler::default()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.applied, 0);
    assert!(elapsed >= Duration::from_millis(150), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(650), "blocked past window: {elapsed:?}");
}

#[tokio::test]
async fn failed_record_is_requeued_for_a_later_drain() {
    let (broker, relay) = setup(100);
    relay.enqueue(&create_author("ok-1")).await.unwrap();
    relay.enqueue(&create_author("broken")).await.unwrap();
    relay.enqueue(&create_author("ok-2")).await.unwrap();

    let handler = ScriptedHandler::failing(&["broken"]);
    let report = relay.drain(&handler).await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(report.requeued, 1);
    // Tried once per drain, not in a hot loop.
    assert_eq!(handler.seen(), vec!["ok-1", "broken", "ok-2"]);
    assert_eq!(broker.depth(QUEUE).await, 1);

    let fixed = ScriptedHandler::default();
    let report = relay.drain(&fixed).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(fixed.seen(), vec!["broken"]);
}

#[tokio::test]
async fn redelivery_cap_moves_poison_to_dead_letter_queue() {
    let (broker, relay) = setup(80);
    relay.enqueue(&create_author("broken")).await.unwrap();

    let handler = ScriptedHandler::failing(&["broken"]);
    let options = DrainOptions {
        max_redeliveries: Some(1),
        ..relay.options().clone()
    };

    let first = relay.drain_with(&handler, &options).await.unwrap();
    assert_eq!((first.requeued, first.dead_lettered), (1, 0));

    let second = relay.drain_with(&handler, &options).await.unwrap();
    assert_eq!((second.requeued, second.dead_lettered), (0, 1));

    assert_eq!(broker.depth(QUEUE).await, 0);
    assert_eq!(broker.depth(DEAD).await, 1);

    let dead = broker.payloads(DEAD).await;
    let record = MutationRecord::decode(&dead[0]).unwrap();
    assert_eq!(record.data()["name"], "broken");
}

#[tokio::test]
async fn unbounded_redelivery_never_dead_letters() {
    let (broker, relay) = setup(50);
    relay.enqueue(&create_author("broken")).await.unwrap();

    let handler = ScriptedHandler::failing(&["broken"]);
    let options = DrainOptions {
        max_redeliveries: None,
        ..relay.options().clone()
    };
    for _ in 0..8 {
        relay.drain_with(&handler, &options).await.unwrap();
    }

    assert_eq!(broker.depth(QUEUE).await, 1);
    assert_eq!(broker.depth(DEAD).await, 0);
}

#[tokio::test]
async fn malformed_payload_does_not_block_the_queue() {
    let (broker, relay) = setup(80);
    broker.push_raw(QUEUE, b"{not json").await;
    relay.enqueue(&create_author("fine")).await.unwrap();

    let handler = ScriptedHandler::default();
    let report = relay.drain(&handler).await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(handler.seen(), vec!["fine"]);
    assert_eq!(broker.payloads(QUEUE).await, vec![b"{not json".to_vec()]);
}

#[tokio::test]
async fn legacy_unversioned_record_is_applied() {
    let (broker, relay) = setup(80);
    broker
        .push_raw(
            QUEUE,
            br#"{"entity":"author","action":"create","data":{"name":"Legacy"},"by":"ada","ts":1}"#,
        )
        .await;

    let handler = ScriptedHandler::default();
    let report = relay.drain(&handler).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(handler.seen(), vec!["Legacy"]);
}

#[tokio::test]
async fn unsupported_mutation_follows_policy() {
    let unsupported =
        br#"{"v":1,"entity":"publisher","action":"create","data":{},"by":"ada","ts":1}"#;

    let (broker, relay) = setup(80);
    broker.push_raw(QUEUE, unsupported).await;
    let rejected = relay.drain(&ScriptedHandler::default()).await.unwrap();
    assert_eq!((rejected.applied, rejected.requeued), (0, 1));
    assert_eq!(broker.depth(QUEUE).await, 1);

    let skip = DrainOptions {
        unsupported: UnsupportedPolicy::Skip,
        ..relay.options().clone()
    };
    let skipped = relay
        .drain_with(&ScriptedHandler::default(), &skip)
        .await
        .unwrap();
    assert_eq!(skipped.applied, 1);
    assert_eq!(broker.depth(QUEUE).await, 0);
}

#[tokio::test]
async fn window_closing_mid_batch_releases_the_rest() {
    let (broker, relay) = setup(100);
    for name in ["a", "b", "c", "d", "e"] {
        relay.enqueue(&create_author(name)).await.unwrap();
    }

    let slow = ScriptedHandler {
        delay: Some(Duration::from_millis(60)),
        ..ScriptedHandler::default()
    };
    let report = relay.drain(&slow).await.unwrap();

    assert!(report.applied >= 1);
    assert!(report.released >= 1);
    assert_eq!(report.applied + report.released, 5);
    assert_eq!(report.requeued, 0);
    assert_eq!(broker.depth(QUEUE).await, report.released);
    assert_eq!(broker.in_flight(QUEUE).await, 0);

    // Released records were never tried, so a zero cap still applies them.
    let rest = ScriptedHandler::default();
    let report = relay
        .drain_with(
            &rest,
            &DrainOptions {
                max_redeliveries: Some(0),
                ..relay.options().clone()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.applied, rest.seen().len());
    assert_eq!(report.dead_lettered, 0);
    let mut all = slow.seen();
    all.extend(rest.seen());
    assert_eq!(all, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn concurrent_drains_never_apply_a_record_twice() {
    let (_broker, relay) = setup(150);
    let relay = Arc::new(relay);
    for i in 0..20 {
        relay.enqueue(&create_author(&format!("r{i}"))).await.unwrap();
    }

    let a = Arc::new(ScriptedHandler::default());
    let b = Arc::new(ScriptedHandler::default());
    let (ra, rb) = tokio::join!(relay.drain(a.as_ref()), relay.drain(b.as_ref()));

    assert_eq!(ra.unwrap().applied + rb.unwrap().applied, 20);
    let mut all: Vec<String> = a.seen().into_iter().chain(b.seen()).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20);
}

/// In-memory channel whose first ack fails like a broker hiccup.
struct FlakyAck {
    inner: Arc<dyn Channel>,
    tripped: AtomicBool,
}

#[async_trait]
impl Channel for FlakyAck {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn publish(&self, payload: Vec<u8>) -> ChannelResult<()> {
        self.inner.publish(payload).await
    }

    async fn fetch(&self, max: usize, wait: Duration) -> ChannelResult<Vec<Delivery>> {
        self.inner.fetch(max, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Backend("transient".to_string()));
        }
        self.inner.ack(delivery).await
    }

    async fn requeue(&self, deliveries: Vec<Delivery>, mode: Requeue) -> ChannelResult<()> {
        self.inner.requeue(deliveries, mode).await
    }

    async fn dead_letter(&self, delivery: Delivery) -> ChannelResult<()> {
        self.inner.dead_letter(delivery).await
    }

    async fn depth(&self) -> ChannelResult<usize> {
        self.inner.depth().await
    }

    async fn close(&self) -> ChannelResult<()> {
        self.inner.close().await
    }
}

struct FlakyConnector {
    channel: Arc<FlakyAck>,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self) -> ChannelResult<Arc<dyn Channel>> {
        Ok(self.channel.clone())
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}

#[tokio::test]
async fn aborted_drain_returns_everything_it_held() {
    let broker = InMemoryBroker::new();
    let channel = Arc::new(FlakyAck {
        inner: Arc::new(broker.channel(QUEUE, DEAD)),
        tripped: AtomicBool::new(false),
    });
    let relay = Relay::new(
        Arc::new(FlakyConnector { channel }),
        DrainOptions {
            window: Duration::from_millis(100),
            ..DrainOptions::default()
        },
    );
    for name in ["a", "b", "c"] {
        relay.enqueue(&create_author(name)).await.unwrap();
    }

    let handler = ScriptedHandler::default();
    let err = relay.drain(&handler).await.unwrap_err();
    assert!(matches!(err, RelayError::Channel(ChannelError::Backend(_))));
    assert_eq!(handler.seen(), vec!["a"]);
    assert_eq!(broker.depth(QUEUE).await, 3);
    assert_eq!(broker.in_flight(QUEUE).await, 0);

    // The record whose ack failed was applied once already: it comes back first,
    // one attempt down; the untouched rest keep their order.
    let retry = ScriptedHandler::default();
    let report = relay.drain(&retry).await.unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(retry.seen(), vec!["a", "b", "c"]);
    assert_eq!(broker.in_flight(QUEUE).await, 0);
}

#[tokio::test]
async fn cancelled_drain_returns_everything_it_held() {
    let (broker, relay) = setup(1000);
    for name in ["a", "b", "c"] {
        relay.enqueue(&create_author(name)).await.unwrap();
    }

    let slow = ScriptedHandler {
        delay: Some(Duration::from_millis(500)),
        ..ScriptedHandler::default()
    };
    let cancelled = tokio::time::timeout(Duration::from_millis(200), relay.drain(&slow)).await;
    assert!(cancelled.is_err());

    // Held deliveries go back on a spawned task.
    let mut waited = Duration::ZERO;
    while broker.depth(QUEUE).await < 3 && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(broker.depth(QUEUE).await, 3);
    assert_eq!(broker.in_flight(QUEUE).await, 0);

    // Interrupted, not failed: no attempt was charged, so one more failure
    // stays under a cap of one.
    let retry = ScriptedHandler::failing(&["a"]);
    let report = relay
        .drain_with(
            &retry,
            &DrainOptions {
                window: Duration::from_millis(100),
                max_redeliveries: Some(1),
                ..relay.options().clone()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(retry.seen(), vec!["a", "b", "c"]);
}
