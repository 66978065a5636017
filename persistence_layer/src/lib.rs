use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod memory;

pub use memory::{InMemoryEventChannel, InMemoryJobQueue, InMemoryLockStore, InMemorySubjectStore};

/// Redis health status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisHealthStatus {
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

// =====================================
// Coordination contracts
// =====================================

/// Mutual exclusion across worker processes.
///
/// `acquire` is an atomic check-and-set: it succeeds when the key is absent or
/// its previous holder's TTL has lapsed. `release` and `extend` only act when
/// the stored owner token matches the caller's.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Returns `false` when the lock is gone or held by another owner; that is not an error.
    async fn release(&self, key: &str, owner: &str) -> Result<bool>;

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
}

/// A message received from the shared event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub topic: String,
    pub payload: String,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = ChannelMessage> + Send>>;

/// Publish/subscribe transport shared between producers and gateways.
///
/// Delivery is at-most-once: a subscriber only sees messages published while
/// its stream is alive. The stream ends when the underlying connection drops.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream>;
}

/// A job popped from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPayload {
    pub job_id: String,
    pub payload: String,
}

/// FIFO job queue whose entries can be removed by id before a worker takes them.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns `false` (and queues nothing) when `job_id` is already queued.
    async fn push(&self, queue: &str, job_id: &str, payload: &str) -> Result<bool>;
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<QueuedPayload>>;
    async fn remove(&self, queue: &str, job_id: &str) -> Result<bool>;
    async fn len(&self, queue: &str) -> Result<u64>;
}

/// Per-wallet classification kept between analysis runs
#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Wallets from `wallets` that were flagged invalid, with the recorded reason
    async fn flagged_invalid(&self, wallets: &[String]) -> Result<HashMap<String, String>>;
    /// Last successful history sync for each wallet that has one
    async fn last_synced(&self, wallets: &[String]) -> Result<HashMap<String, DateTime<Utc>>>;
    async fn mark_invalid(&self, wallet: &str, reason: &str) -> Result<()>;
    async fn mark_synced(&self, wallet: &str, at: DateTime<Utc>) -> Result<()>;
}

// =====================================
// Redis backend
// =====================================

const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisClient {
    pub async fn new(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let mut connection = client.get_multiplexed_async_connection().await?;

        // Test the connection
        let _: String = redis::cmd("PING").query_async(&mut connection).await?;

        Ok(Self {
            client,
            connection,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    fn lock_key(&self, key: &str) -> String {
        self.key(&format!("lock:{}", key))
    }

    fn queue_keys(&self, queue: &str, job_id: &str) -> (String, String) {
        (
            self.key(&format!("queue:{}", queue)),
            self.key(&format!("queue:{}:job:{}", queue, job_id)),
        )
    }

    // =====================================
    // Health Checks and Connectivity
    // =====================================

    /// Test Redis connectivity and health
    pub async fn health_check(&self) -> RedisHealthStatus {
        let start_time = std::time::Instant::now();
        let mut conn = self.connection();

        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => RedisHealthStatus {
                connected: true,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => RedisHealthStatus {
                connected: false,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: Some(format!("PING failed: {}", e)),
            },
        }
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong)
    }
}

#[async_trait]
impl DistributedLock for RedisClient {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let lock_key = self.lock_key(key);
        let mut conn = self.connection();

        // SET NX PX sets value and expiry in one step
        let reply: Option<String> = redis::cmd("SET")
            .arg(&lock_key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        if acquired {
            info!("Acquired lock: {}", lock_key);
        } else {
            debug!("Lock already held: {}", lock_key);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let lock_key = self.lock_key(key);
        let mut conn = self.connection();

        let script = redis::Script::new(RELEASE_SCRIPT);
        let removed: i32 = script
            .key(&lock_key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;

        if removed == 1 {
            info!("Released lock: {}", lock_key);
            Ok(true)
        } else {
            warn!(
                "Lock was already expired or held by another owner: {}",
                lock_key
            );
            Ok(false)
        }
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let lock_key = self.lock_key(key);
        let mut conn = self.connection();

        let script = redis::Script::new(EXTEND_SCRIPT);
        let refreshed: i32 = script
            .key(&lock_key)
            .arg(owner)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;

        if refreshed == 1 {
            debug!("Refreshed lock: {}", lock_key);
        }
        Ok(refreshed == 1)
    }
}

#[async_trait]
impl EventChannel for RedisClient {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection();
        let receivers: i64 = conn.publish(topic, payload).await?;
        debug!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream> {
        if topics.is_empty() {
            return Err(PersistenceError::Backend(
                "subscribe requires at least one topic".to_string(),
            ));
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        for topic in topics {
            pubsub.subscribe(topic.as_str()).await?;
        }
        info!("Subscribed to channels: {:?}", topics);

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let topic = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(ChannelMessage { topic, payload }),
                Err(e) => {
                    warn!("Dropping undecodable message on {}: {}", topic, e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl JobQueue for RedisClient {
    async fn push(&self, queue: &str, job_id: &str, payload: &str) -> Result<bool> {
        let (queue_key, payload_key) = self.queue_keys(queue, job_id);
        let mut conn = self.connection();

        let was_new: bool = conn.set_nx(&payload_key, payload).await?;
        if !was_new {
            debug!("Job {} already queued on {}", job_id, queue);
            return Ok(false);
        }

        let _: () = conn.lpush(&queue_key, job_id).await?;
        debug!("Pushed job {} to {}", job_id, queue);
        Ok(true)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<QueuedPayload>> {
        let (queue_key, _) = self.queue_keys(queue, "");
        let mut conn = self.connection();

        let popped: Option<(String, String)> =
            conn.brpop(&queue_key, timeout.as_secs_f64()).await?;

        let job_id = match popped {
            Some((_, job_id)) => job_id,
            None => return Ok(None),
        };

        let (_, payload_key) = self.queue_keys(queue, &job_id);
        let payload: Option<String> = conn.get(&payload_key).await?;
        let _: () = conn.del(&payload_key).await?;

        match payload {
            Some(payload) => Ok(Some(QueuedPayload { job_id, payload })),
            None => {
                // Payload removed between LPUSH and BRPOP
                debug!("Job {} on {} has no payload, skipping", job_id, queue);
                Ok(None)
            }
        }
    }

    async fn remove(&self, queue: &str, job_id: &str) -> Result<bool> {
        let (queue_key, payload_key) = self.queue_keys(queue, job_id);
        let mut conn = self.connection();

        let removed_entries: i64 = conn.lrem(&queue_key, 0, job_id).await?;
        let removed_payloads: i64 = conn.del(&payload_key).await?;

        let removed = removed_entries > 0 || removed_payloads > 0;
        if removed {
            info!("Removed job {} from {}", job_id, queue);
        }
        Ok(removed)
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        let (queue_key, _) = self.queue_keys(queue, "");
        let mut conn = self.connection();
        let size: u64 = conn.llen(&queue_key).await?;
        Ok(size)
    }
}

#[async_trait]
impl SubjectStore for RedisClient {
    async fn flagged_invalid(&self, wallets: &[String]) -> Result<HashMap<String, String>> {
        if wallets.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.connection();
        let reasons: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key("invalid_wallets"))
            .arg(wallets)
            .query_async(&mut conn)
            .await?;

        Ok(wallets
            .iter()
            .zip(reasons)
            .filter_map(|(wallet, reason)| reason.map(|r| (wallet.clone(), r)))
            .collect())
    }

    async fn last_synced(&self, wallets: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        if wallets.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.connection();
        let stamps: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.key("wallet_synced_at"))
            .arg(wallets)
            .query_async(&mut conn)
            .await?;

        let mut synced = HashMap::new();
        for (wallet, stamp) in wallets.iter().zip(stamps) {
            let Some(stamp) = stamp else { continue };
            match DateTime::parse_from_rfc3339(&stamp) {
                Ok(at) => {
                    synced.insert(wallet.clone(), at.with_timezone(&Utc));
                }
                Err(e) => warn!("Ignoring corrupt sync timestamp for {}: {}", wallet, e),
            }
        }
        Ok(synced)
    }

    async fn mark_invalid(&self, wallet: &str, reason: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn
            .hset(self.key("invalid_wallets"), wallet, reason)
            .await?;
        info!("Flagged wallet {} as invalid: {}", wallet, reason);
        Ok(())
    }

    async fn mark_synced(&self, wallet: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn
            .hset(self.key("wallet_synced_at"), wallet, at.to_rfc3339())
            .await?;
        Ok(())
    }
}
