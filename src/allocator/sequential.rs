//! Sequential path allocation.
//!
//! Each dataset owns a monotonically increasing sequence. A sequence number
//! maps to `bucket/dataset/FFFF/NNNNNN.ext` where the folder holds
//! `folder_capacity` entries and folders are numbered from 1.
//!
//! Allocation is two-phase. [`SequentialAllocator::next_path`] reserves a
//! number atomically so concurrent callers never share one; the caller
//! uploads the artifact and then calls [`SequentialAllocator::commit`]. A
//! number that is never committed is skipped for good.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AllocatorError;
use crate::metrics::MetricsCollector;
use crate::store::CounterStore;

/// Default number of files per folder.
pub const DEFAULT_FOLDER_CAPACITY: u64 = 1000;

/// A reserved storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPath {
    pub bucket: String,
    /// Object key inside the bucket: `dataset/FFFF/NNNNNN.ext`.
    pub key: String,
    pub sequence_number: u64,
}

impl AllocatedPath {
    /// Full path including the bucket.
    pub fn path(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// Folder (1-based) and file (0-based) index for a sequence number.
pub fn folder_and_file(sequence: u64, folder_capacity: u64) -> (u64, u64) {
    (sequence / folder_capacity + 1, sequence % folder_capacity)
}

/// Object key for `sequence` inside its bucket.
pub fn format_key(dataset: &str, sequence: u64, folder_capacity: u64, extension: &str) -> String {
    let (folder, file) = folder_and_file(sequence, folder_capacity);
    format!(
        "{}/{:04}/{:06}.{}",
        dataset,
        folder,
        file,
        extension.trim_start_matches('.')
    )
}

/// Full path for `sequence`. Pure: depends only on its arguments.
pub fn format_path(
    bucket: &str,
    dataset: &str,
    sequence: u64,
    folder_capacity: u64,
    extension: &str,
) -> String {
    format!(
        "{}/{}",
        bucket,
        format_key(dataset, sequence, folder_capacity, extension)
    )
}

pub(crate) fn validate_segment(name: &str, value: &str) -> Result<(), AllocatorError> {
    if value.is_empty() {
        return Err(AllocatorError::InvalidInput(format!("{} is empty", name)));
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(AllocatorError::InvalidInput(format!(
            "{} '{}' is not a single path segment",
            name, value
        )));
    }
    Ok(())
}

/// Hands out per-dataset sequence numbers and their storage paths.
pub struct SequentialAllocator {
    counters: Arc<dyn CounterStore>,
    folder_capacity: u64,
    metrics: MetricsCollector,
}

impl SequentialAllocator {
    /// Creates an allocator over `counters`.
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::InvalidInput` if `folder_capacity` is zero.
    pub fn new(counters: Arc<dyn CounterStore>, folder_capacity: u64) -> Result<Self, AllocatorError> {
        if folder_capacity == 0 {
            return Err(AllocatorError::InvalidInput(
                "folder_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            counters,
            folder_capacity,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn folder_capacity(&self) -> u64 {
        self.folder_capacity
    }

    /// Reserves the next sequence number for `dataset` and returns its path.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty or multi-segment dataset, bucket or
    /// extension; `Store` when the counter store fails.
    pub async fn next_path(
        &self,
        dataset: &str,
        bucket: &str,
        extension: &str,
    ) -> Result<AllocatedPath, AllocatorError> {
        validate_segment("dataset", dataset)?;
        validate_segment("bucket", bucket)?;
        validate_segment("file extension", extension.trim_start_matches('.'))?;

        let sequence_number = self.counters.reserve_sequence(dataset).await?;
        self.metrics.record_sequence_allocation(dataset);

        let allocated = AllocatedPath {
            bucket: bucket.to_string(),
            key: format_key(dataset, sequence_number, self.folder_capacity, extension),
            sequence_number,
        };
        debug!(
            dataset = %dataset,
            sequence = sequence_number,
            path = %allocated.path(),
            "Allocated sequential path"
        );
        Ok(allocated)
    }

    /// Marks `sequence_number` as durably written for `dataset`.
    ///
    /// Idempotent, and a commit for an older number never moves the counter
    /// backwards.
    pub async fn commit(&self, dataset: &str, sequence_number: u64) -> Result<(), AllocatorError> {
        self.counters
            .commit_sequence(dataset, sequence_number, self.folder_capacity)
            .await?;
        debug!(dataset = %dataset, sequence = sequence_number, "Committed sequence");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn allocator(capacity: u64) -> (Arc<MemoryStore>, SequentialAllocator) {
        let store = Arc::new(MemoryStore::new());
        let allocator = SequentialAllocator::new(store.clone(), capacity).expect("capacity");
        (store, allocator)
    }

    #[test]
    fn test_folder_boundaries() {
        assert_eq!(folder_and_file(0, 1000), (1, 0));
        assert_eq!(folder_and_file(999, 1000), (1, 999));
        assert_eq!(folder_and_file(1000, 1000), (2, 0));
        assert_eq!(folder_and_file(1999, 1000), (2, 999));
        assert_eq!(folder_and_file(2000, 1000), (3, 0));
    }

    #[test]
    fn test_format_path() {
        assert_eq!(
            format_path("images", "cats", 0, 1000, "png"),
            "images/cats/0001/000000.png"
        );
        assert_eq!(
            format_path("images", "cats", 1234, 1000, ".jpg"),
            "images/cats/0002/000234.jpg"
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let store = Arc::new(MemoryStore::new());
        assert!(SequentialAllocator::new(store, 0).is_err());
    }

    #[tokio::test]
    async fn test_next_path_increments() {
        let (_, allocator) = allocator(2);

        let first = allocator.next_path("cats", "images", "png").await.unwrap();
        let second = allocator.next_path("cats", "images", "png").await.unwrap();
        let third = allocator.next_path("cats", "images", "png").await.unwrap();

        assert_eq!(first.path(), "images/cats/0001/000000.png");
        assert_eq!(second.path(), "images/cats/0001/000001.png");
        assert_eq!(third.path(), "images/cats/0002/000000.png");
        assert_eq!(third.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_datasets_are_independent() {
        let (_, allocator) = allocator(1000);
        allocator.next_path("cats", "images", "png").await.unwrap();
        let dogs = allocator.next_path("dogs", "images", "png").await.unwrap();
        assert_eq!(dogs.sequence_number, 0);
    }

    #[tokio::test]
    async fn test_commit_advances_counter() {
        let (store, allocator) = allocator(2);
        let mut last = None;
        for _ in 0..3 {
            last = Some(allocator.next_path("cats", "images", "png").await.unwrap());
        }
        let last = last.expect("allocated");
        allocator.commit("cats", last.sequence_number).await.unwrap();

        let counter = store.sequence_counter("cats").await.unwrap().expect("exists");
        assert_eq!((counter.subfolder_count, counter.file_count), (1, 1));
    }

    #[tokio::test]
    async fn test_uncommitted_number_is_skipped() {
        let (store, allocator) = allocator(1000);
        let lost = allocator.next_path("cats", "images", "png").await.unwrap();
        let kept = allocator.next_path("cats", "images", "png").await.unwrap();
        allocator.commit("cats", kept.sequence_number).await.unwrap();

        let next = allocator.next_path("cats", "images", "png").await.unwrap();
        assert_eq!(lost.sequence_number, 0);
        assert_eq!(next.sequence_number, 2);
        let counter = store.sequence_counter("cats").await.unwrap().expect("exists");
        assert_eq!(counter.file_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_segments() {
        let (_, allocator) = allocator(1000);
        assert!(allocator.next_path("", "images", "png").await.is_err());
        assert!(allocator.next_path("a/b", "images", "png").await.is_err());
        assert!(allocator.next_path("cats", "..", "png").await.is_err());
        assert!(allocator.next_path("cats", "images", "").await.is_err());
    }
}
