//! Redis list backend.
//!
//! ## Layout
//! - `<queue>`: ready deliveries, head on the left (`RPUSH` to publish)
//! - `<queue>.processing`: deliveries handed to a consumer and not settled
//! - `<queue>.leases`: hash from processing entry to the time it was handed out
//! - `<dead_letter>`: deliveries that exceeded the redelivery cap
//!
//! Fetch moves entries atomically from the queue into the processing list
//! (`LMOVE`/`BLMOVE`) and stamps a lease. A consumer that dies mid-drain
//! leaves its entries in `.processing`; once their lease is older than
//! `reclaim_after` any handle moves them back to the head of the queue.
//! Durability across a server restart follows the server's AOF/RDB
//! configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError, ChannelResult, Delivery, Envelope, Requeue};

/// Slack on top of the server-side block timeout before we give up on the socket.
const BLOCK_GRACE: Duration = Duration::from_secs(1);
/// Redis treats a zero block timeout as "forever".
const MIN_BLOCK_SECS: f64 = 0.01;
/// Lease age after which a processing entry is taken back.
pub const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(60);

// KEYS: queue, processing, leases
const MOVE_AND_LEASE: &str = r#"
local raw = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if raw then
    local t = redis.call('TIME')
    local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
    redis.call('HSET', KEYS[3], raw, string.format('%d', now))
end
return raw
"#;

// KEYS: leases; ARGV: processing entry
const LEASE: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('HSET', KEYS[1], ARGV[1], string.format('%d', now))
"#;

// KEYS: queue, processing, leases; ARGV: idle threshold in ms
// Entries without a lease (consumer died between BLMOVE and HSET) get one
// now and are taken back on a later pass.
const RECLAIM_STALE: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local idle = tonumber(ARGV[1])

local stale = {}
for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    local leased = redis.call('HGET', KEYS[3], raw)
    if not leased then
        redis.call('HSET', KEYS[3], raw, string.format('%d', now))
    elseif now - tonumber(leased) >= idle then
        table.insert(stale, raw)
    end
end

for i = #stale, 1, -1 do
    redis.call('LREM', KEYS[2], 1, stale[i])
    redis.call('HDEL', KEYS[3], stale[i])
    redis.call('LPUSH', KEYS[1], stale[i])
end
return #stale
"#;

/// Redis channel implementation using a list per queue
pub struct RedisChannel {
    client: Client,
    shared: ConnectionManager,
    queue: String,
    processing: String,
    leases: String,
    dead_letter: String,
    reclaim_after: Duration,
    last_reclaim: Mutex<Instant>,
    move_and_lease: Script,
    lease: Script,
    reclaim_stale: Script,
    closed: AtomicBool,
}

impl RedisChannel {
    /// Connect to the server at `url`, verify it answers and take back
    /// deliveries abandoned for longer than `reclaim_after`.
    ///
    /// ## Errors
    /// - [`ChannelError::InvalidConfiguration`]: the URL does not parse
    /// - [`ChannelError::Unavailable`]: the server cannot be reached
    pub async fn connect(
        url: &str,
        queue: &str,
        dead_letter: &str,
        reclaim_after: Duration,
    ) -> ChannelResult<Self> {
        if queue.is_empty() {
            return Err(ChannelError::InvalidConfiguration(
                "queue name must not be empty".to_string(),
            ));
        }

        let client = Client::open(url).map_err(|e| {
            ChannelError::InvalidConfiguration(format!("invalid Redis URL: {}", e))
        })?;

        // Check on a plain connection first: the manager retries with backoff.
        let mut check = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ChannelError::Unavailable(format!("failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut check)
            .await
            .map_err(|e| ChannelError::Unavailable(format!("Redis did not answer PING: {}", e)))?;

        let shared = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| ChannelError::Unavailable(format!("failed to connect to Redis: {}", e)))?;

        let channel = Self {
            client,
            shared,
            queue: queue.to_string(),
            processing: format!("{}.processing", queue),
            leases: format!("{}.leases", queue),
            dead_letter: dead_letter.to_string(),
            reclaim_after,
            last_reclaim: Mutex::new(Instant::now()),
            move_and_lease: Script::new(MOVE_AND_LEASE),
            lease: Script::new(LEASE),
            reclaim_stale: Script::new(RECLAIM_STALE),
            closed: AtomicBool::new(false),
        };

        channel.reclaim().await?;
        tracing::debug!(queue, dead_letter, "redis channel connected");
        Ok(channel)
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed(self.queue.clone()));
        }
        Ok(())
    }

    /// Move processing entries whose lease is older than `reclaim_after`
    /// back to the head of the queue, attempts unchanged. Returns how many
    /// were moved.
    pub async fn reclaim(&self) -> ChannelResult<usize> {
        let mut con = self.shared.clone();
        let reclaimed: usize = self
            .reclaim_stale
            .key(&self.queue)
            .key(&self.processing)
            .key(&self.leases)
            .arg(self.reclaim_after.as_millis() as u64)
            .invoke_async(&mut con)
            .await
            .map_err(backend)?;

        *self.last_reclaim.lock().await = Instant::now();
        if reclaimed > 0 {
            tracing::warn!(
                queue = %self.queue,
                reclaimed,
                "returned abandoned deliveries to the queue"
            );
        }
        Ok(reclaimed)
    }

    async fn reclaim_if_due(&self) -> ChannelResult<()> {
        let due = self.last_reclaim.lock().await.elapsed() >= self.reclaim_after;
        if due {
            self.reclaim().await?;
        }
        Ok(())
    }

    /// Non-blocking move of one entry into the processing list.
    async fn move_one(&self) -> ChannelResult<Option<Vec<u8>>> {
        let mut con = self.shared.clone();
        let raw: Option<Vec<u8>> = self
            .move_and_lease
            .key(&self.queue)
            .key(&self.processing)
            .key(&self.leases)
            .invoke_async(&mut con)
            .await
            .map_err(backend)?;
        Ok(raw)
    }

    /// Blocking move on a dedicated connection, so the shared one stays free.
    async fn move_one_blocking(&self, wait: Duration) -> ChannelResult<Option<Vec<u8>>> {
        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        let block_secs = wait.as_secs_f64().max(MIN_BLOCK_SECS);
        let command = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(block_secs)
            .to_owned();

        let raw: Option<Vec<u8>> =
            match tokio::time::timeout(wait + BLOCK_GRACE, command.query_async(&mut con)).await {
                Ok(result) => result.map_err(backend)?,
                Err(_) => {
                    return Err(ChannelError::Backend(format!(
                        "BLMOVE on '{}' did not return within {:?}",
                        self.queue,
                        wait + BLOCK_GRACE
                    )))
                }
            };

        if let Some(raw) = &raw {
            let mut con = self.shared.clone();
            let _: () = self
                .lease
                .key(&self.leases)
                .arg(raw)
                .invoke_async(&mut con)
                .await
                .map_err(backend)?;
        }
        Ok(raw)
    }
}

fn backend(e: redis::RedisError) -> ChannelError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        ChannelError::Unavailable(e.to_string())
    } else {
        ChannelError::Backend(e.to_string())
    }
}

#[async_trait]
impl Channel for RedisChannel {
    fn name(&self) -> &str {
        &self.queue
    }

    async fn publish(&self, payload: Vec<u8>) -> ChannelResult<()> {
        self.ensure_open()?;
        let frame = Envelope::new(payload)?.to_bytes()?;

        let mut con = self.shared.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.queue)
            .arg(frame)
            .query_async(&mut con)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn fetch(&self, max: usize, wait: Duration) -> ChannelResult<Vec<Delivery>> {
        self.ensure_open()?;
        self.reclaim_if_due().await?;

        let max = max.max(1);
        let mut raw_entries = Vec::with_capacity(max);

        if let Some(raw) = self.move_one().await? {
            raw_entries.push(raw);
        } else if !wait.is_zero() {
            if let Some(raw) = self.move_one_blocking(wait).await? {
                raw_entries.push(raw);
            }
        }

        if !raw_entries.is_empty() {
            while raw_entries.len() < max {
                match self.move_one().await? {
                    Some(raw) => raw_entries.push(raw),
                    None => break,
                }
            }
        }

        Ok(raw_entries
            .into_iter()
            .map(|raw| Envelope::from_raw(&raw).into_delivery(raw))
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let mut con = self.shared.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.receipt)
            .cmd("HDEL")
            .arg(&self.leases)
            .arg(&delivery.receipt)
            .query_async(&mut con)
            .await
            .map_err(backend)?;

        if removed == 0 {
            return Err(ChannelError::UnknownDelivery(delivery.id.clone()));
        }
        Ok(())
    }

    async fn requeue(&self, deliveries: Vec<Delivery>, mode: Requeue) -> ChannelResult<()> {
        if deliveries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for delivery in &deliveries {
            pipe.cmd("LREM")
                .arg(&self.processing)
                .arg(1)
                .arg(&delivery.receipt)
                .ignore()
                .cmd("HDEL")
                .arg(&self.leases)
                .arg(&delivery.receipt)
                .ignore();
        }

        // LPUSH prepends one argument at a time: push the last first so the
        // first delivery ends up at the head.
        let mut push = redis::cmd("LPUSH");
        push.arg(&self.queue);
        for delivery in deliveries.iter().rev() {
            push.arg(Envelope::from_delivery(delivery, mode).to_bytes()?);
        }
        pipe.add_command(push).ignore();

        let mut con = self.shared.clone();
        let _: () = pipe.query_async(&mut con).await.map_err(backend)?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery) -> ChannelResult<()> {
        let frame = Envelope::from_delivery(&delivery, Requeue::Penalize).to_bytes()?;

        let mut con = self.shared.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("HDEL")
            .arg(&self.leases)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("RPUSH")
            .arg(&self.dead_letter)
            .arg(frame)
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn depth(&self) -> ChannelResult<usize> {
        self.ensure_open()?;
        let mut con = self.shared.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(&self.queue)
            .query_async(&mut con)
            .await
            .map_err(backend)?;
        Ok(len)
    }

    async fn close(&self) -> ChannelResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
