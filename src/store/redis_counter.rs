//! Redis-backed counter storage.
//!
//! Counters live in hashes:
//!
//! - `{prefix}:seq:{dataset}`: `next_sequence`, `subfolder_count`, `file_count`
//! - `{prefix}:batch:{bucket}:{dataset}`: `sequence_number`, `complete`
//!
//! Reservation is a single `HINCRBY`. The committed position only moves
//! forward, which needs a read-compare-write, so it runs as a Lua script.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;

use super::{BatchCounter, CounterStore, SequenceCounter};

const COMMIT_SCRIPT: &str = r#"
local target = tonumber(ARGV[1])
local cap = tonumber(ARGV[2])
local sub = tonumber(redis.call('HGET', KEYS[1], 'subfolder_count') or '0')
local file = tonumber(redis.call('HGET', KEYS[1], 'file_count') or '0')
if sub * cap + file >= target then
    return 0
end
redis.call('HSET', KEYS[1], 'subfolder_count', math.floor(target / cap), 'file_count', target % cap)
local nxt = tonumber(redis.call('HGET', KEYS[1], 'next_sequence') or '0')
if nxt < target then
    redis.call('HSET', KEYS[1], 'next_sequence', target)
end
return 1
"#;

/// `CounterStore` on Redis hashes.
pub struct RedisCounterStore {
    /// Handles reconnection automatically.
    redis: ConnectionManager,
    prefix: String,
    commit_script: redis::Script,
}

impl RedisCounterStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix shared by all counters of this deployment
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            commit_script: redis::Script::new(COMMIT_SCRIPT),
        }
    }

    fn sequence_key(&self, dataset: &str) -> String {
        format!("{}:seq:{}", self.prefix, dataset)
    }

    fn batch_key(&self, bucket: &str, dataset: &str) -> String {
        format!("{}:batch:{}:{}", self.prefix, bucket, dataset)
    }
}

fn field_u64(fields: &HashMap<String, String>, name: &str) -> Result<u64, StoreError> {
    match fields.get(name) {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("counter field {} = '{}'", name, raw))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn reserve_sequence(&self, dataset: &str) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let next: i64 = conn
            .hincr(self.sequence_key(dataset), "next_sequence", 1)
            .await?;
        Ok((next - 1).max(0) as u64)
    }

    async fn commit_sequence(
        &self,
        dataset: &str,
        sequence: u64,
        folder_capacity: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _advanced: i64 = self
            .commit_script
            .key(self.sequence_key(dataset))
            .arg(sequence + 1)
            .arg(folder_capacity)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sequence_counter(
        &self,
        dataset: &str,
    ) -> Result<Option<SequenceCounter>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.sequence_key(dataset)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(SequenceCounter {
            dataset_name: dataset.to_string(),
            subfolder_count: field_u64(&fields, "subfolder_count")?,
            file_count: field_u64(&fields, "file_count")?,
            next_sequence: field_u64(&fields, "next_sequence")?,
        }))
    }

    async fn batch_counter(
        &self,
        bucket: &str,
        dataset: &str,
    ) -> Result<Option<BatchCounter>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.batch_key(bucket, dataset)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(BatchCounter {
            bucket: bucket.to_string(),
            dataset: dataset.to_string(),
            sequence_number: field_u64(&fields, "sequence_number")?,
            complete: field_u64(&fields, "complete")? != 0,
        }))
    }

    async fn put_batch_counter(&self, counter: &BatchCounter) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hset_multiple::<_, _, _, ()>(
            self.batch_key(&counter.bucket, &counter.dataset),
            &[
                ("sequence_number", counter.sequence_number),
                ("complete", u64::from(counter.complete)),
            ],
        )
        .await?;
        Ok(())
    }
}
