//! Redis store backend.
//!
//! Key layout, all under a configurable namespace:
//! - `{ns}:batch:{key}`: JSON batch payload
//! - `{ns}:index:{identifier}`: list of batch keys, oldest first
//! - `{ns}:status:{key}`: JSON progress snapshot
//! - `{ns}:lock:{identifier}`: lease token, expires with the lock TTL
//! - `{ns}:cancel:{key}`: cancel flag with TTL
//! - `{ns}:dlq:{identifier}`: dead letter list

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use crmsync_models::{Batch, BatchKey, BatchStatus, DeadLetter, WorkItem};

use crate::error::{QueueError, QueueResult};
use crate::store::{BatchStore, LockLease, DEFAULT_MAX_PAYLOAD_BYTES};

/// Releases the lock only when the caller still owns it.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Extends the lock TTL only when the caller still owns it.
const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key namespace prefix
    pub namespace: String,
    /// Cap on a serialized batch payload
    pub max_payload_bytes: usize,
    /// How long an unconsumed cancel flag lingers
    pub cancel_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "crmsync".to_string(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            cancel_ttl: Duration::from_secs(3600),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            namespace: std::env::var("QUEUE_NAMESPACE").unwrap_or_else(|_| "crmsync".to_string()),
            max_payload_bytes: std::env::var("QUEUE_MAX_PAYLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
            cancel_ttl: Duration::from_secs(
                std::env::var("QUEUE_CANCEL_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }
}

/// Redis-backed [`BatchStore`].
pub struct RedisStore {
    client: redis::Client,
    config: StoreConfig,
}

impl RedisStore {
    /// Create a new store from config.
    pub fn new(config: StoreConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn batch_key(&self, key: &BatchKey) -> String {
        format!("{}:batch:{}", self.config.namespace, key)
    }

    fn index_key(&self, identifier: &str) -> String {
        format!("{}:index:{}", self.config.namespace, identifier)
    }

    fn status_key(&self, key: &BatchKey) -> String {
        format!("{}:status:{}", self.config.namespace, key)
    }

    fn lock_key(&self, identifier: &str) -> String {
        format!("{}:lock:{}", self.config.namespace, identifier)
    }

    fn cancel_key(&self, key: &BatchKey) -> String {
        format!("{}:cancel:{}", self.config.namespace, key)
    }

    fn dlq_key(&self, identifier: &str) -> String {
        format!("{}:dlq:{}", self.config.namespace, identifier)
    }

    async fn load_batch(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &BatchKey,
    ) -> QueueResult<Option<Batch>> {
        let payload: Option<Vec<u8>> = conn.get(self.batch_key(key)).await?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BatchStore for RedisStore {
    async fn save(&self, identifier: &str, items: Vec<WorkItem>) -> QueueResult<Batch> {
        if items.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        let batch = Batch::new(BatchKey::generate(identifier), items);
        let payload = serde_json::to_vec(&batch)?;
        if payload.len() > self.config.max_payload_bytes {
            return Err(QueueError::BatchTooLarge {
                size: payload.len(),
                max: self.config.max_payload_bytes,
            });
        }

        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .set(self.batch_key(&batch.key), payload)
            .ignore()
            .rpush(self.index_key(identifier), batch.key.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(batch)
    }

    async fn first_batch(&self, identifier: &str) -> QueueResult<Option<Batch>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.lrange(self.index_key(identifier), 0, -1).await?;

        for raw in keys {
            let key = BatchKey::from_string(raw);
            match self.load_batch(&mut conn, &key).await? {
                Some(batch) => return Ok(Some(batch)),
                None => {
                    // Stale index entry for a deleted batch; drop it.
                    warn!(key = %key, "Dropping stale batch index entry");
                    let _: i64 = conn.lrem(self.index_key(identifier), 1, key.as_str()).await?;
                }
            }
        }

        Ok(None)
    }

    async fn update(&self, key: &BatchKey, items: Vec<WorkItem>) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut batch = self
            .load_batch(&mut conn, key)
            .await?
            .ok_or_else(|| QueueError::not_found(key.as_str()))?;

        batch.items = items;
        let payload = serde_json::to_vec(&batch)?;
        conn.set::<_, _, ()>(self.batch_key(key), payload).await?;
        Ok(())
    }

    async fn delete(&self, key: &BatchKey) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .del(self.batch_key(key))
            .ignore()
            .del(self.status_key(key))
            .ignore()
            .del(self.cancel_key(key))
            .ignore()
            .lrem(self.index_key(key.identifier()), 1, key.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn keys(&self, identifier: &str) -> QueueResult<Vec<BatchKey>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.lrange(self.index_key(identifier), 0, -1).await?;
        Ok(keys.into_iter().map(BatchKey::from_string).collect())
    }

    async fn is_empty(&self, identifier: &str) -> QueueResult<bool> {
        Ok(self.first_batch(identifier).await?.is_none())
    }

    async fn write_status(&self, status: &BatchStatus) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_vec(status)?;
        conn.set::<_, _, ()>(self.status_key(&status.key), payload)
            .await?;
        Ok(())
    }

    async fn read_status(&self, key: &BatchKey) -> QueueResult<Option<BatchStatus>> {
        let mut conn = self.conn().await?;
        let payload: Option<Vec<u8>> = conn.get(self.status_key(key)).await?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn request_cancel(&self, key: &BatchKey) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(self.cancel_key(key), "1", self.config.cancel_ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, key: &BatchKey) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(self.cancel_key(key)).await?;
        Ok(exists)
    }

    async fn clear_cancel(&self, key: &BatchKey) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.cancel_key(key)).await?;
        Ok(())
    }

    async fn try_lock(&self, identifier: &str, ttl: Duration) -> QueueResult<Option<LockLease>> {
        let mut conn = self.conn().await?;
        let lease = LockLease::new();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(identifier))
            .arg(lease.token())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| lease))
    }

    async fn renew_lock(
        &self,
        identifier: &str,
        lease: &LockLease,
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(self.lock_key(identifier))
            .arg(lease.token())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn unlock(&self, identifier: &str, lease: &LockLease) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(self.lock_key(identifier))
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn is_locked(&self, identifier: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(self.lock_key(identifier)).await?;
        Ok(exists)
    }

    async fn push_dead_letter(&self, identifier: &str, dead: &DeadLetter) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_vec(dead)?;
        conn.rpush::<_, _, ()>(self.dlq_key(identifier), payload)
            .await?;
        Ok(())
    }

    async fn dead_letter_len(&self, identifier: &str) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(self.dlq_key(identifier)).await?;
        Ok(len)
    }
}
