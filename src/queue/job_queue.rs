//! Job queue state machine.
//!
//! Jobs move `Pending → InProgress → {Completed, Failed}`. Every transition
//! is a single atomic store operation, so any number of worker processes can
//! poll the same queue:
//!
//! - `enqueue` allocates an output path when none is given, mints an ID64
//!   when the producer supplied none, and inserts into pending
//! - `dequeue` atomically claims the best pending job and stamps a lease
//! - `report_completion` / `report_failure` move an in-progress job into a
//!   terminal partition; an unknown job is `ReportOutcome::NotFound`
//! - `reap_expired` requeues or fails jobs whose lease ran out

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::allocator::SequentialAllocator;
use crate::error::QueueError;
use crate::id::Id64;
use crate::metrics::MetricsCollector;
use crate::store::JobStore;

use super::job::{
    EnqueueReceipt, EnqueueRequest, Job, JobFilter, Partition, QueueStats, ReportOutcome,
    BUCKET_KEY, DATASET_KEY, OUTPUT_PATH_KEY, SEQUENCE_NUMBER_KEY,
};

/// Dataset whose jobs are dequeued ahead of all others by default.
pub const DEFAULT_PRIORITY_DATASET: &str = "variants";

/// Default lease granted on dequeue.
pub const DEFAULT_LEASE_SECS: i64 = 1800;

/// Default number of claims before an expired job is failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapSummary {
    /// Expired jobs moved back to pending.
    pub requeued: usize,
    /// Expired jobs that ran out of attempts and moved to failed.
    pub failed: usize,
}

impl ReapSummary {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// The job queue over a `JobStore` and a sequential path allocator.
pub struct JobQueue {
    jobs: Arc<dyn JobStore>,
    paths: Arc<SequentialAllocator>,
    priority_dataset: Option<String>,
    lease: Duration,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobStore>, paths: Arc<SequentialAllocator>) -> Self {
        Self {
            jobs,
            paths,
            priority_dataset: Some(DEFAULT_PRIORITY_DATASET.to_string()),
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the dataset dequeued first. `None` disables the override.
    pub fn with_priority_dataset(mut self, dataset: Option<String>) -> Self {
        self.priority_dataset = dataset;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn priority_dataset(&self) -> Option<&str> {
        self.priority_dataset.as_deref()
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn allocator(&self) -> &Arc<SequentialAllocator> {
        &self.paths
    }

    /// Creates a job from `request` and inserts it into pending.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty task type, or for a request without an
    ///   output path that lacks a dataset, bucket or file extension
    /// - `Id` when the supplied uuid is not a formatted ID64
    /// - `Allocator` / `Store` when allocation or the insert fails; a number
    ///   reserved before a failed insert is skipped
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, QueueError> {
        let task_type = request.task_type.trim();
        if task_type.is_empty() {
            return Err(QueueError::InvalidInput("task_type is empty".to_string()));
        }

        let now = Utc::now();
        let uuid = match request.uuid.as_deref() {
            Some(formatted) => Id64::from_formatted_string(formatted)?,
            None => Id64::generate_at(now),
        };

        let dataset = request.resolved_dataset();
        let mut input = request.task_input;
        if let Some(dataset) = &dataset {
            input.insert(DATASET_KEY.to_string(), Value::from(dataset.as_str()));
        }

        let output_path = match &request.output_path {
            Some(path) => path.clone(),
            None => {
                let dataset = dataset.as_deref().ok_or_else(|| {
                    QueueError::InvalidInput(
                        "dataset is required when no output_path is given".to_string(),
                    )
                })?;
                let bucket = request.bucket.as_deref().ok_or_else(|| {
                    QueueError::InvalidInput(
                        "bucket is required when no output_path is given".to_string(),
                    )
                })?;
                let extension = request.file_extension.as_deref().ok_or_else(|| {
                    QueueError::InvalidInput(
                        "file_extension is required when no output_path is given".to_string(),
                    )
                })?;

                let allocated = self.paths.next_path(dataset, bucket, extension).await?;
                input.insert(BUCKET_KEY.to_string(), Value::from(bucket));
                input.insert(
                    SEQUENCE_NUMBER_KEY.to_string(),
                    Value::from(allocated.sequence_number),
                );
                allocated.path()
            }
        };
        input.insert(OUTPUT_PATH_KEY.to_string(), Value::from(output_path.as_str()));

        let job = Job::new(uuid, task_type, input).with_creation_time(now);
        self.jobs.insert_pending(&job).await?;
        self.metrics.record_enqueued(task_type);

        info!(
            job_id = %uuid,
            task_type = %task_type,
            dataset = dataset.as_deref().unwrap_or("-"),
            output_path = %output_path,
            "Enqueued job"
        );

        Ok(EnqueueReceipt {
            uuid,
            creation_time: now,
            output_path: Some(output_path),
        })
    }

    /// Claims the next pending job matching `filter`.
    ///
    /// Returns `Ok(None)` when nothing matches. Two concurrent callers never
    /// receive the same job.
    pub async fn dequeue(&self, filter: &JobFilter) -> Result<Option<Job>, QueueError> {
        let claimed = self
            .jobs
            .claim_pending(filter, self.priority_dataset.as_deref(), Utc::now(), self.lease)
            .await?;

        match &claimed {
            Some(job) => {
                self.metrics.record_dequeued(&job.task_type);
                info!(
                    job_id = %job.uuid,
                    task_type = %job.task_type,
                    attempt = job.task_attempts,
                    "Dequeued job"
                );
            }
            None => debug!(
                task_type = filter.task_type.as_deref().unwrap_or("*"),
                dataset = filter.dataset.as_deref().unwrap_or("*"),
                "No pending job available"
            ),
        }
        Ok(claimed)
    }

    /// Moves an in-progress job to completed and commits its reserved
    /// sequence number.
    ///
    /// Reporting a job that is not in progress, including one already
    /// reported, returns `ReportOutcome::NotFound`.
    ///
    /// The move is recorded even when the commit fails afterwards, since a
    /// retried report would only see `NotFound`. The committed position then
    /// lags until a later completion in the same dataset commits past it; if
    /// no such completion follows, it stays one behind.
    pub async fn report_completion(
        &self,
        uuid: Id64,
        output: Option<Map<String, Value>>,
    ) -> Result<ReportOutcome, QueueError> {
        let Some(job) = self.finish(uuid, Partition::Completed, output).await? else {
            return Ok(ReportOutcome::NotFound);
        };

        if let (Some(dataset), Some(sequence)) = (job.dataset(), job.sequence_number()) {
            if let Err(e) = self.paths.commit(dataset, sequence).await {
                warn!(
                    job_id = %uuid,
                    dataset = %dataset,
                    sequence = sequence,
                    error = %e,
                    "Sequence commit failed after completion"
                );
            }
        }
        Ok(ReportOutcome::Recorded {
            partition: Partition::Completed,
        })
    }

    /// Moves an in-progress job to failed. The reserved sequence number, if
    /// any, is left uncommitted.
    pub async fn report_failure(
        &self,
        uuid: Id64,
        output: Option<Map<String, Value>>,
    ) -> Result<ReportOutcome, QueueError> {
        Ok(match self.finish(uuid, Partition::Failed, output).await? {
            Some(_) => ReportOutcome::Recorded {
                partition: Partition::Failed,
            },
            None => ReportOutcome::NotFound,
        })
    }

    async fn finish(
        &self,
        uuid: Id64,
        terminal: Partition,
        output: Option<Map<String, Value>>,
    ) -> Result<Option<Job>, QueueError> {
        let finished = self.jobs.finish(uuid, terminal, output, Utc::now()).await?;

        match &finished {
            Some(job) => {
                self.metrics
                    .record_finished(&job.task_type, terminal, job.processing_seconds());
                info!(
                    job_id = %uuid,
                    task_type = %job.task_type,
                    partition = %terminal,
                    "Job finished"
                );
            }
            None => debug!(job_id = %uuid, partition = %terminal, "Report for job not in progress"),
        }
        Ok(finished)
    }

    /// Extends the lease of an in-progress job by the configured lease.
    ///
    /// Returns false when the job is no longer in progress, which tells the
    /// worker its claim was reaped.
    pub async fn renew_lease(&self, uuid: Id64) -> Result<bool, QueueError> {
        let until = Utc::now() + self.lease;
        let renewed = self.jobs.renew_lease(uuid, until).await?;
        if renewed {
            debug!(job_id = %uuid, until = %until, "Renewed lease");
        } else {
            warn!(job_id = %uuid, "Lease renewal for job not in progress");
        }
        Ok(renewed)
    }

    /// Finds the partition a job is in.
    pub async fn get(&self, uuid: Id64) -> Result<Option<(Partition, Job)>, QueueError> {
        Ok(self.jobs.get(uuid).await?)
    }

    /// Counts jobs per partition matching `filter`.
    pub async fn stats(&self, filter: &JobFilter) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for partition in Partition::ALL {
            stats.set(partition, self.jobs.count(partition, filter).await?);
        }
        if filter.task_type.is_none() && filter.dataset.is_none() {
            self.metrics.update_partition_depth(&stats);
        }
        Ok(stats)
    }

    /// Handles every in-progress job whose lease has expired.
    ///
    /// A job with attempts left goes back to pending; otherwise it moves to
    /// failed with an `{"error": "lease expired"}` output. A job reported by
    /// its worker between the scan and the move is left alone.
    pub async fn reap_expired(&self) -> Result<ReapSummary, QueueError> {
        let now = Utc::now();
        let expired = self.jobs.expired_leases(now).await?;
        let mut summary = ReapSummary::default();

        for job in expired {
            if job.task_attempts < self.max_attempts {
                if self.jobs.requeue(job.uuid).await? {
                    summary.requeued += 1;
                    self.metrics.record_reaped("requeued");
                    warn!(
                        job_id = %job.uuid,
                        task_type = %job.task_type,
                        attempts = job.task_attempts,
                        "Lease expired, job requeued"
                    );
                }
                continue;
            }

            let output = json!({
                "error": "lease expired",
                "attempts": job.task_attempts,
            });
            let output = output.as_object().cloned();
            if self
                .jobs
                .finish(job.uuid, Partition::Failed, output, now)
                .await?
                .is_some()
            {
                summary.failed += 1;
                self.metrics.record_reaped("failed");
                self.metrics
                    .record_finished(&job.task_type, Partition::Failed, job.processing_seconds());
                warn!(
                    job_id = %job.uuid,
                    task_type = %job.task_type,
                    attempts = job.task_attempts,
                    "Lease expired, attempts exhausted, job failed"
                );
            }
        }

        if summary.total() > 0 {
            info!(
                requeued = summary.requeued,
                failed = summary.failed,
                "Reaped expired leases"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{BatchCounter, CounterStore, MemoryStore, SequenceCounter};

    fn queue_with_store() -> (Arc<MemoryStore>, JobQueue) {
        let store = Arc::new(MemoryStore::new());
        let paths = Arc::new(SequentialAllocator::new(store.clone(), 1000).expect("capacity"));
        let queue = JobQueue::new(store.clone(), paths);
        (store, queue)
    }

    /// Counter store whose commits always fail.
    struct FailingCommits(MemoryStore);

    #[async_trait::async_trait]
    impl CounterStore for FailingCommits {
        async fn reserve_sequence(&self, dataset: &str) -> Result<u64, StoreError> {
            self.0.reserve_sequence(dataset).await
        }

        async fn commit_sequence(&self, _: &str, _: u64, _: u64) -> Result<(), StoreError> {
            Err(StoreError::ConnectionFailed("counter store unavailable".to_string()))
        }

        async fn sequence_counter(
            &self,
            dataset: &str,
        ) -> Result<Option<SequenceCounter>, StoreError> {
            self.0.sequence_counter(dataset).await
        }

        async fn batch_counter(
            &self,
            bucket: &str,
            dataset: &str,
        ) -> Result<Option<BatchCounter>, StoreError> {
            self.0.batch_counter(bucket, dataset).await
        }

        async fn put_batch_counter(&self, counter: &BatchCounter) -> Result<(), StoreError> {
            self.0.put_batch_counter(counter).await
        }
    }

    fn request(dataset: &str) -> EnqueueRequest {
        EnqueueRequest::new("gen")
            .with_dataset(dataset)
            .with_bucket("images")
            .with_file_extension("png")
    }

    #[tokio::test]
    async fn test_enqueue_allocates_path() {
        let (_, queue) = queue_with_store();
        let receipt = queue.enqueue(request("cats")).await.unwrap();
        assert_eq!(
            receipt.output_path.as_deref(),
            Some("images/cats/0001/000000.png")
        );

        let (partition, job) = queue.get(receipt.uuid).await.unwrap().expect("stored");
        assert_eq!(partition, Partition::Pending);
        assert_eq!(job.dataset(), Some("cats"));
        assert_eq!(job.sequence_number(), Some(0));
        assert_eq!(job.output_path(), Some("images/cats/0001/000000.png"));
        assert_eq!(job.task_creation_time, receipt.creation_time);
    }

    #[tokio::test]
    async fn test_enqueue_uses_supplied_path_and_uuid() {
        let (store, queue) = queue_with_store();
        let uuid = Id64::generate();
        let receipt = queue
            .enqueue(
                EnqueueRequest::new("gen")
                    .with_uuid(uuid.to_formatted_string())
                    .with_output_path("custom/place.json"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.uuid, uuid);
        assert_eq!(receipt.output_path.as_deref(), Some("custom/place.json"));
        let (_, job) = queue.get(uuid).await.unwrap().expect("stored");
        assert!(job.sequence_number().is_none());
        assert!(store.sequence_counter("cats").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_input() {
        let (_, queue) = queue_with_store();

        let err = queue.enqueue(request("cats").with_uuid("nope")).await.unwrap_err();
        assert!(matches!(err, QueueError::Id(_)));

        let err = queue
            .enqueue(EnqueueRequest::new("  ").with_output_path("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let err = queue
            .enqueue(EnqueueRequest::new("gen").with_bucket("images").with_file_extension("png"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let err = queue
            .enqueue(EnqueueRequest::new("gen").with_dataset("cats").with_file_extension("png"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_dequeue_empty_is_none() {
        let (_, queue) = queue_with_store();
        assert!(queue.dequeue(&JobFilter::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_lifecycle_commits_sequence() {
        let (store, queue) = queue_with_store();
        let receipt = queue.enqueue(request("cats")).await.unwrap();

        let job = queue
            .dequeue(&JobFilter::new().with_task_type("gen"))
            .await
            .unwrap()
            .expect("job");
        assert_eq!(job.uuid, receipt.uuid);
        assert!(job.task_lease_expiry.is_some());

        let output = serde_json::json!({"score": 0.9}).as_object().cloned();
        let outcome = queue.report_completion(job.uuid, output).await.unwrap();
        assert!(outcome.is_recorded());

        let again = queue.report_completion(job.uuid, None).await.unwrap();
        assert_eq!(again, ReportOutcome::NotFound);

        let counter = store.sequence_counter("cats").await.unwrap().expect("counter");
        assert_eq!(counter.file_count, 1);

        let stats = queue.stats(&JobFilter::new()).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_commit() {
        let (store, queue) = queue_with_store();
        queue.enqueue(request("cats")).await.unwrap();
        let job = queue.dequeue(&JobFilter::new()).await.unwrap().expect("job");

        let outcome = queue.report_failure(job.uuid, None).await.unwrap();
        assert_eq!(
            outcome,
            ReportOutcome::Recorded {
                partition: Partition::Failed
            }
        );

        let counter = store.sequence_counter("cats").await.unwrap().expect("counter");
        assert_eq!(counter.file_count, 0);
        assert_eq!(counter.next_sequence, 1);
    }

    #[tokio::test]
    async fn test_completion_recorded_when_commit_fails() {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(FailingCommits(MemoryStore::new()));
        let paths = Arc::new(SequentialAllocator::new(counters, 1000).expect("capacity"));
        let queue = JobQueue::new(store, paths);

        let receipt = queue.enqueue(request("cats")).await.unwrap();
        queue.dequeue(&JobFilter::new()).await.unwrap().expect("job");

        let outcome = queue.report_completion(receipt.uuid, None).await.unwrap();
        assert_eq!(
            outcome,
            ReportOutcome::Recorded {
                partition: Partition::Completed
            }
        );
        let (partition, _) = queue.get(receipt.uuid).await.unwrap().expect("stored");
        assert_eq!(partition, Partition::Completed);
    }

    #[tokio::test]
    async fn test_report_unknown_job() {
        let (_, queue) = queue_with_store();
        let outcome = queue.report_failure(Id64::generate(), None).await.unwrap();
        assert_eq!(outcome, ReportOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_renew_lease() {
        let (_, queue) = queue_with_store();
        queue.enqueue(request("cats")).await.unwrap();
        let job = queue.dequeue(&JobFilter::new()).await.unwrap().expect("job");

        assert!(queue.renew_lease(job.uuid).await.unwrap());
        queue.report_completion(job.uuid, None).await.unwrap();
        assert!(!queue.renew_lease(job.uuid).await.unwrap());
    }

    #[tokio::test]
    async fn test_reap_requeues_then_fails() {
        let store = Arc::new(MemoryStore::new());
        let paths = Arc::new(SequentialAllocator::new(store.clone(), 1000).expect("capacity"));
        let queue = JobQueue::new(store.clone(), paths)
            .with_lease(Duration::seconds(-1))
            .with_max_attempts(2);

        let receipt = queue.enqueue(request("cats")).await.unwrap();

        queue.dequeue(&JobFilter::new()).await.unwrap().expect("first claim");
        let summary = queue.reap_expired().await.unwrap();
        assert_eq!(summary, ReapSummary { requeued: 1, failed: 0 });

        queue.dequeue(&JobFilter::new()).await.unwrap().expect("second claim");
        let summary = queue.reap_expired().await.unwrap();
        assert_eq!(summary, ReapSummary { requeued: 0, failed: 1 });

        let (partition, job) = queue.get(receipt.uuid).await.unwrap().expect("stored");
        assert_eq!(partition, Partition::Failed);
        let output = job.task_output.expect("output");
        assert_eq!(output.get("error"), Some(&Value::from("lease expired")));
        assert_eq!(output.get("attempts"), Some(&Value::from(2)));
    }

    #[tokio::test]
    async fn test_reap_leaves_live_leases() {
        let (_, queue) = queue_with_store();
        queue.enqueue(request("cats")).await.unwrap();
        queue.dequeue(&JobFilter::new()).await.unwrap().expect("job");

        let summary = queue.reap_expired().await.unwrap();
        assert_eq!(summary.total(), 0);
    }
}
