//! Document-store and object-store seams.
//!
//! The engine never talks to a database directly. It goes through three
//! traits, each of which must provide atomic single-record operations:
//!
//! - **JobStore**: the four job partitions (pending, in-progress, completed,
//!   failed) with an atomic claim that moves a job from pending to in-progress
//! - **CounterStore**: per-dataset sequence counters (atomic
//!   increment-and-return) and per-(bucket, dataset) batch counters
//! - **ObjectStore**: put/get of artifact bytes addressed by `(bucket, path)`
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-process `JobStore` + `CounterStore`, one mutex per store
//! - [`PgStore`]: PostgreSQL via sqlx, `FOR UPDATE SKIP LOCKED` claims
//! - [`RedisCounterStore`]: `CounterStore` on Redis hashes
//! - [`FsObjectStore`] / [`MemoryObjectStore`]: object storage
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobforge::store::{PgStore, FsObjectStore};
//! use std::sync::Arc;
//!
//! let pg = Arc::new(PgStore::connect("postgres://localhost/jobforge").await?);
//! pg.run_migrations().await?;
//! let objects = Arc::new(FsObjectStore::new("./objects"));
//! ```

pub mod memory;
pub mod migrations;
pub mod objects;
pub mod postgres;
pub mod redis_counter;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::id::Id64;
use crate::queue::{Job, JobFilter, Partition};

pub use self::memory::MemoryStore;
pub use self::migrations::MigrationRunner;
pub use self::objects::{FsObjectStore, MemoryObjectStore};
pub use self::postgres::PgStore;
pub use self::redis_counter::RedisCounterStore;

/// Persisted sequence counter for one dataset.
///
/// `subfolder_count` and `file_count` describe the committed position: the
/// next committed sequence would be `subfolder_count * capacity + file_count`.
/// `next_sequence` is the reservation counter handed out by
/// [`CounterStore::reserve_sequence`]; it is always at or past the committed
/// position, and the numbers between the two are in flight or skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounter {
    pub dataset_name: String,
    pub subfolder_count: u64,
    pub file_count: u64,
    pub next_sequence: u64,
}

impl SequenceCounter {
    pub fn new(dataset_name: impl Into<String>) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            ..Default::default()
        }
    }

    /// Number of sequence slots at or below the committed position.
    pub fn committed_len(&self, folder_capacity: u64) -> u64 {
        self.subfolder_count * folder_capacity + self.file_count
    }

    /// Advances the committed position to just past `sequence`.
    ///
    /// Returns false when the position was already past it.
    pub fn advance_past(&mut self, sequence: u64, folder_capacity: u64) -> bool {
        let target = sequence + 1;
        if target <= self.committed_len(folder_capacity) {
            return false;
        }
        self.subfolder_count = target / folder_capacity;
        self.file_count = target % folder_capacity;
        if self.next_sequence < target {
            self.next_sequence = target;
        }
        true
    }
}

/// Persisted batch counter for one `(bucket, dataset)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounter {
    pub bucket: String,
    pub dataset: String,
    pub sequence_number: u64,
    /// True when the batch file at `sequence_number` holds a full batch.
    pub complete: bool,
}

/// Storage for the four job partitions.
///
/// Every method is one atomic operation against the backing store. In
/// particular `claim_pending` must never hand the same job to two callers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a job into the pending partition.
    async fn insert_pending(&self, job: &Job) -> Result<(), StoreError>;

    /// Atomically removes the best pending job matching `filter` and inserts
    /// it into in-progress with start time, lease expiry and attempt count
    /// stamped.
    ///
    /// Jobs whose dataset equals `priority_dataset` are chosen first; within a
    /// class, the oldest creation time wins and ties go to insertion order.
    async fn claim_pending(
        &self,
        filter: &JobFilter,
        priority_dataset: Option<&str>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Moves an in-progress job into `terminal`, inserting before removing.
    ///
    /// Returns `None` when no in-progress job has `uuid`.
    async fn finish(
        &self,
        uuid: Id64,
        terminal: Partition,
        output: Option<Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Extends the lease of an in-progress job. Returns false if absent.
    async fn renew_lease(&self, uuid: Id64, until: DateTime<Utc>) -> Result<bool, StoreError>;

    /// In-progress jobs whose lease expired at or before `now`.
    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Moves an in-progress job back to pending, clearing its start time and
    /// lease. Returns false if the job is no longer in progress.
    async fn requeue(&self, uuid: Id64) -> Result<bool, StoreError>;

    /// Number of jobs in `partition` matching `filter`.
    async fn count(&self, partition: Partition, filter: &JobFilter) -> Result<u64, StoreError>;

    /// Up to `limit` completed jobs for `dataset`, newest creation time first.
    async fn recent_completed(&self, dataset: &str, limit: usize)
        -> Result<Vec<Job>, StoreError>;

    /// Looks a job up across all partitions.
    async fn get(&self, uuid: Id64) -> Result<Option<(Partition, Job)>, StoreError>;
}

/// Storage for sequence and batch counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically reserves the next sequence number for `dataset`, creating
    /// the counter with zero values if it does not exist.
    async fn reserve_sequence(&self, dataset: &str) -> Result<u64, StoreError>;

    /// Advances the committed position of `dataset` past `sequence`.
    /// Idempotent; never moves the position backwards.
    async fn commit_sequence(
        &self,
        dataset: &str,
        sequence: u64,
        folder_capacity: u64,
    ) -> Result<(), StoreError>;

    async fn sequence_counter(&self, dataset: &str)
        -> Result<Option<SequenceCounter>, StoreError>;

    async fn batch_counter(
        &self,
        bucket: &str,
        dataset: &str,
    ) -> Result<Option<BatchCounter>, StoreError>;

    async fn put_batch_counter(&self, counter: &BatchCounter) -> Result<(), StoreError>;
}

/// Object storage addressed by `(bucket, path)`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Returns `None` when no object exists at the address.
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_counter_advance() {
        let mut counter = SequenceCounter::new("cats");
        assert_eq!(counter.committed_len(1000), 0);

        assert!(counter.advance_past(0, 1000));
        assert_eq!((counter.subfolder_count, counter.file_count), (0, 1));

        assert!(counter.advance_past(998, 1000));
        assert_eq!((counter.subfolder_count, counter.file_count), (0, 999));

        assert!(counter.advance_past(999, 1000));
        assert_eq!((counter.subfolder_count, counter.file_count), (1, 0));
        assert_eq!(counter.next_sequence, 1000);
    }

    #[test]
    fn test_sequence_counter_never_moves_back() {
        let mut counter = SequenceCounter::new("cats");
        assert!(counter.advance_past(5, 10));
        assert!(!counter.advance_past(3, 10));
        assert!(!counter.advance_past(5, 10));
        assert_eq!(counter.committed_len(10), 6);
    }
}
