//! Batch file allocation.
//!
//! Small records are grouped into JSON-array batch files of at most
//! `batch_capacity` records, stored at `dataset/NNNNNN.json` inside the
//! bucket. A per-(bucket, dataset) counter tracks the current batch number
//! and whether that batch is full.
//!
//! An incomplete batch is re-read and merged on the next append rather than
//! blindly appended to, so re-running an append after a crash picks up the
//! same unfinished file. Overflow is split into fresh batches within the
//! same call; the number of files written is bounded by the input size.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AllocatorError;
use crate::metrics::MetricsCollector;
use crate::store::{BatchCounter, CounterStore, ObjectStore};

use super::sequential::validate_segment;

/// Default number of records per batch file.
pub const DEFAULT_BATCH_CAPACITY: usize = 1000;

/// Object key for a batch file.
pub fn batch_key(dataset: &str, sequence_number: u64) -> String {
    format!("{}/{:06}.json", dataset, sequence_number)
}

/// One batch file written by an append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWrite {
    pub sequence_number: u64,
    pub key: String,
    /// Records in the file after the write.
    pub records: usize,
    pub complete: bool,
}

/// Result of [`BatchAllocator::append_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAppend {
    pub writes: Vec<BatchWrite>,
}

impl BatchAppend {
    /// The batch the next append will land in, if any write happened.
    pub fn last(&self) -> Option<&BatchWrite> {
        self.writes.last()
    }
}

/// Appends records to bounded batch files.
///
/// Appends to the same `(bucket, dataset)` are serialized inside one
/// process. Separate processes must not append to the same pair.
pub struct BatchAllocator {
    counters: Arc<dyn CounterStore>,
    objects: Arc<dyn ObjectStore>,
    batch_capacity: usize,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    metrics: MetricsCollector,
}

impl BatchAllocator {
    /// # Errors
    ///
    /// Returns `AllocatorError::InvalidInput` if `batch_capacity` is zero.
    pub fn new(
        counters: Arc<dyn CounterStore>,
        objects: Arc<dyn ObjectStore>,
        batch_capacity: usize,
    ) -> Result<Self, AllocatorError> {
        if batch_capacity == 0 {
            return Err(AllocatorError::InvalidInput(
                "batch_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            counters,
            objects,
            batch_capacity,
            locks: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    async fn key_lock(&self, bucket: &str, dataset: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((bucket.to_string(), dataset.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reads batch `sequence_number`. A missing file reads as empty.
    pub async fn read_batch(
        &self,
        bucket: &str,
        dataset: &str,
        sequence_number: u64,
    ) -> Result<Vec<Value>, AllocatorError> {
        let key = batch_key(dataset, sequence_number);
        let Some(bytes) = self.objects.get(bucket, &key).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(_) => Err(AllocatorError::BatchFormat {
                path: format!("{}/{}", bucket, key),
                message: "expected a JSON array".to_string(),
            }),
            Err(e) => Err(AllocatorError::BatchFormat {
                path: format!("{}/{}", bucket, key),
                message: e.to_string(),
            }),
        }
    }

    async fn write_batch(
        &self,
        bucket: &str,
        dataset: &str,
        sequence_number: u64,
        records: &[Value],
    ) -> Result<BatchWrite, AllocatorError> {
        let key = batch_key(dataset, sequence_number);
        let bytes = serde_json::to_vec(records).map_err(crate::error::StoreError::from)?;
        self.objects.put(bucket, &key, &bytes).await?;

        let complete = records.len() >= self.batch_capacity;
        self.counters
            .put_batch_counter(&BatchCounter {
                bucket: bucket.to_string(),
                dataset: dataset.to_string(),
                sequence_number,
                complete,
            })
            .await?;
        self.metrics.record_batch_file_written(dataset);

        debug!(
            bucket = %bucket,
            dataset = %dataset,
            sequence = sequence_number,
            records = records.len(),
            complete = complete,
            "Wrote batch file"
        );
        Ok(BatchWrite {
            sequence_number,
            key,
            records: records.len(),
            complete,
        })
    }

    /// Opens batch `sequence_number` by recording it as the current,
    /// incomplete batch before any bytes are written.
    async fn open_batch(
        &self,
        bucket: &str,
        dataset: &str,
        sequence_number: u64,
    ) -> Result<(), AllocatorError> {
        self.counters
            .put_batch_counter(&BatchCounter {
                bucket: bucket.to_string(),
                dataset: dataset.to_string(),
                sequence_number,
                complete: false,
            })
            .await?;
        Ok(())
    }

    /// Appends `records` to the batch files of `(bucket, dataset)`.
    ///
    /// Fills the current incomplete batch first, then opens new batches for
    /// whatever does not fit. Every batch except the last written one holds
    /// exactly `batch_capacity` records.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for bad names, `BatchFormat` when the current batch
    /// file is not a JSON array, `Store` on any storage failure. A failure
    /// part-way leaves the counter pointing at an incomplete batch, which the
    /// next append resumes.
    pub async fn append_batch(
        &self,
        bucket: &str,
        dataset: &str,
        records: Vec<Value>,
    ) -> Result<BatchAppend, AllocatorError> {
        validate_segment("bucket", bucket)?;
        validate_segment("dataset", dataset)?;

        let mut result = BatchAppend::default();
        if records.is_empty() {
            return Ok(result);
        }

        let lock = self.key_lock(bucket, dataset).await;
        let _guard = lock.lock().await;

        // A missing counter still reads batch 0 so records already on disk survive.
        let counter = self
            .counters
            .batch_counter(bucket, dataset)
            .await?
            .unwrap_or_else(|| BatchCounter {
                bucket: bucket.to_string(),
                dataset: dataset.to_string(),
                sequence_number: 0,
                complete: false,
            });
        let mut remaining = records;

        let mut next_sequence = match counter {
            counter if counter.complete => counter.sequence_number + 1,
            counter => {
                let mut merged = self
                    .read_batch(bucket, dataset, counter.sequence_number)
                    .await?;
                merged.append(&mut remaining);

                if merged.len() > self.batch_capacity {
                    remaining = merged.split_off(self.batch_capacity);
                }
                result.writes.push(
                    self.write_batch(bucket, dataset, counter.sequence_number, &merged)
                        .await?,
                );
                counter.sequence_number + 1
            }
        };

        while !remaining.is_empty() {
            let rest = if remaining.len() > self.batch_capacity {
                remaining.split_off(self.batch_capacity)
            } else {
                Vec::new()
            };

            self.open_batch(bucket, dataset, next_sequence).await?;
            result
                .writes
                .push(self.write_batch(bucket, dataset, next_sequence, &remaining).await?);

            remaining = rest;
            next_sequence += 1;
        }

        if result.writes.len() > 1 {
            info!(
                bucket = %bucket,
                dataset = %dataset,
                files = result.writes.len(),
                "Batch append split across files"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryObjectStore, MemoryStore};
    use serde_json::json;

    fn allocator(capacity: usize) -> (Arc<MemoryStore>, Arc<MemoryObjectStore>, BatchAllocator) {
        let counters = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let allocator = BatchAllocator::new(counters.clone(), objects.clone(), capacity)
            .expect("capacity");
        (counters, objects, allocator)
    }

    fn records(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(|i| json!({ "id": i })).collect()
    }

    #[tokio::test]
    async fn test_first_append_opens_batch_zero() {
        let (counters, objects, allocator) = allocator(4);
        let appended = allocator
            .append_batch("features", "cats", records(0..2))
            .await
            .unwrap();

        assert_eq!(appended.writes.len(), 1);
        assert_eq!(appended.writes[0].key, "cats/000000.json");
        assert!(!appended.writes[0].complete);
        assert_eq!(objects.paths("features"), vec!["cats/000000.json"]);

        let counter = counters.batch_counter("features", "cats").await.unwrap().expect("counter");
        assert_eq!(counter.sequence_number, 0);
        assert!(!counter.complete);
    }

    #[tokio::test]
    async fn test_partial_batch_is_merged() {
        let (_, _, allocator) = allocator(4);
        allocator.append_batch("features", "cats", records(0..2)).await.unwrap();
        let appended = allocator
            .append_batch("features", "cats", records(2..4))
            .await
            .unwrap();

        assert_eq!(appended.writes.len(), 1);
        assert_eq!(appended.writes[0].sequence_number, 0);
        assert!(appended.writes[0].complete);
        assert_eq!(
            allocator.read_batch("features", "cats", 0).await.unwrap(),
            records(0..4)
        );
    }

    #[tokio::test]
    async fn test_overflow_opens_new_batch() {
        let (counters, _, allocator) = allocator(4);
        allocator.append_batch("features", "cats", records(0..3)).await.unwrap();
        let appended = allocator
            .append_batch("features", "cats", records(3..6))
            .await
            .unwrap();

        let numbers: Vec<u64> = appended.writes.iter().map(|w| w.sequence_number).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(allocator.read_batch("features", "cats", 0).await.unwrap(), records(0..4));
        assert_eq!(allocator.read_batch("features", "cats", 1).await.unwrap(), records(4..6));

        let counter = counters.batch_counter("features", "cats").await.unwrap().expect("counter");
        assert_eq!(counter.sequence_number, 1);
        assert!(!counter.complete);
    }

    #[tokio::test]
    async fn test_complete_batch_starts_next() {
        let (_, _, allocator) = allocator(2);
        allocator.append_batch("features", "cats", records(0..2)).await.unwrap();
        let appended = allocator
            .append_batch("features", "cats", records(2..3))
            .await
            .unwrap();
        assert_eq!(appended.writes[0].sequence_number, 1);
        assert_eq!(allocator.read_batch("features", "cats", 0).await.unwrap(), records(0..2));
    }

    #[tokio::test]
    async fn test_large_input_is_chunked() {
        let (_, _, allocator) = allocator(3);
        let appended = allocator
            .append_batch("features", "cats", records(0..8))
            .await
            .unwrap();

        let sizes: Vec<usize> = appended.writes.iter().map(|w| w.records).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
        assert!(appended.writes[..2].iter().all(|w| w.complete));
    }

    #[tokio::test]
    async fn test_empty_append_writes_nothing() {
        let (counters, objects, allocator) = allocator(3);
        let appended = allocator.append_batch("features", "cats", Vec::new()).await.unwrap();
        assert!(appended.writes.is_empty());
        assert!(objects.is_empty());
        assert!(counters.batch_counter("features", "cats").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_after_missing_file() {
        let (counters, _, allocator) = allocator(3);
        counters
            .put_batch_counter(&BatchCounter {
                bucket: "features".to_string(),
                dataset: "cats".to_string(),
                sequence_number: 5,
                complete: false,
            })
            .await
            .unwrap();

        let appended = allocator
            .append_batch("features", "cats", records(0..1))
            .await
            .unwrap();
        assert_eq!(appended.writes[0].sequence_number, 5);
        assert_eq!(appended.writes[0].records, 1);
    }

    #[tokio::test]
    async fn test_missing_counter_keeps_existing_batch() {
        let objects = Arc::new(MemoryObjectStore::new());
        for run in 0..2 {
            let allocator =
                BatchAllocator::new(Arc::new(MemoryStore::new()), objects.clone(), 4).unwrap();
            allocator
                .append_batch("features", "cats", records(run * 3..run * 3 + 3))
                .await
                .unwrap();
        }

        let allocator =
            BatchAllocator::new(Arc::new(MemoryStore::new()), objects.clone(), 4).unwrap();
        assert_eq!(
            allocator.read_batch("features", "cats", 0).await.unwrap(),
            records(0..4)
        );
        assert_eq!(
            allocator.read_batch("features", "cats", 1).await.unwrap(),
            records(4..6)
        );
    }

    #[tokio::test]
    async fn test_malformed_batch_file() {
        let (_, objects, allocator) = allocator(3);
        allocator.append_batch("features", "cats", records(0..1)).await.unwrap();
        objects
            .put("features", &batch_key("cats", 0), b"{\"not\": \"array\"}")
            .await
            .unwrap();

        let err = allocator
            .append_batch("features", "cats", records(1..2))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::BatchFormat { .. }));
    }
}
