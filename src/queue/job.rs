//! Job records and the request/response shapes of the queue.
//!
//! This module defines the core job types used by the queue:
//!
//! - `Job`: the persisted record that moves between partitions
//! - `Partition`: the four disjoint places a job can live
//! - `JobFilter`: optional task type / dataset selector for dequeue and stats
//! - `EnqueueRequest` / `EnqueueReceipt`: intake shapes
//! - `ReportOutcome`: result of a completion or failure report

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::Id64;

/// Key in `task_input` naming the dataset a job belongs to.
pub const DATASET_KEY: &str = "dataset";

/// Key in `task_input` holding the deterministic output path.
pub const OUTPUT_PATH_KEY: &str = "output_path";

/// Key in `task_input` holding the reserved sequence number, if any.
pub const SEQUENCE_NUMBER_KEY: &str = "sequence_number";

/// Key in `task_input` holding the bucket of the output path.
pub const BUCKET_KEY: &str = "bucket";

/// One of the four disjoint partitions a job occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Pending,
        Partition::InProgress,
        Partition::Completed,
        Partition::Failed,
    ];

    /// Returns whether no transition leaves this partition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Partition::Completed | Partition::Failed)
    }

    /// Checks a transition against the lifecycle
    /// `Pending → InProgress → {Completed, Failed}`, plus the lease reaper's
    /// `InProgress → Pending` requeue.
    pub fn can_transition_to(&self, target: Partition) -> bool {
        matches!(
            (self, target),
            (Partition::Pending, Partition::InProgress)
                | (Partition::InProgress, Partition::Completed)
                | (Partition::InProgress, Partition::Failed)
                | (Partition::InProgress, Partition::Pending)
        )
    }

    /// Name of the backing collection.
    pub fn collection(&self) -> &'static str {
        match self {
            Partition::Pending => "jobs_pending",
            Partition::InProgress => "jobs_in_progress",
            Partition::Completed => "jobs_completed",
            Partition::Failed => "jobs_failed",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Pending => write!(f, "pending"),
            Partition::InProgress => write!(f, "in_progress"),
            Partition::Completed => write!(f, "completed"),
            Partition::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work tracked by the queue.
///
/// The record is moved wholesale between partitions; `uuid` never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Id64,
    pub task_type: String,
    #[serde(default)]
    pub task_input: Map<String, Value>,
    #[serde(default)]
    pub task_output: Option<Map<String, Value>>,
    pub task_creation_time: DateTime<Utc>,
    #[serde(default)]
    pub task_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub task_completion_time: Option<DateTime<Utc>>,
    /// Number of times the job has been handed to a worker.
    #[serde(default)]
    pub task_attempts: u32,
    /// When the current worker's claim lapses. Only set while in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_lease_expiry: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job record stamped with the current time.
    pub fn new(uuid: Id64, task_type: impl Into<String>, task_input: Map<String, Value>) -> Self {
        Self {
            uuid,
            task_type: task_type.into(),
            task_input,
            task_output: None,
            task_creation_time: Utc::now(),
            task_start_time: None,
            task_completion_time: None,
            task_attempts: 0,
            task_lease_expiry: None,
        }
    }

    /// Sets the creation time.
    pub fn with_creation_time(mut self, time: DateTime<Utc>) -> Self {
        self.task_creation_time = time;
        self
    }

    /// The dataset tag carried in `task_input`, if any.
    pub fn dataset(&self) -> Option<&str> {
        self.task_input.get(DATASET_KEY).and_then(Value::as_str)
    }

    /// The output path carried in `task_input`, if any.
    pub fn output_path(&self) -> Option<&str> {
        self.task_input.get(OUTPUT_PATH_KEY).and_then(Value::as_str)
    }

    /// The reserved sequence number carried in `task_input`, if any.
    pub fn sequence_number(&self) -> Option<u64> {
        self.task_input
            .get(SEQUENCE_NUMBER_KEY)
            .and_then(Value::as_u64)
    }

    /// Applies the pending → in-progress stamps.
    pub fn mark_started(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.task_start_time = Some(now);
        self.task_lease_expiry = Some(now + lease);
        self.task_attempts += 1;
    }

    /// Applies the in-progress → terminal stamps.
    pub fn mark_finished(&mut self, output: Option<Map<String, Value>>, now: DateTime<Utc>) {
        if output.is_some() {
            self.task_output = output;
        }
        self.task_completion_time = Some(now);
        self.task_lease_expiry = None;
    }

    /// Reverts the in-progress stamps so the job can be claimed again.
    pub fn mark_requeued(&mut self) {
        self.task_start_time = None;
        self.task_lease_expiry = None;
    }

    /// Returns whether the job's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.task_lease_expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Seconds between start and completion, if both are known.
    pub fn processing_seconds(&self) -> Option<f64> {
        let start = self.task_start_time?;
        let end = self.task_completion_time?;
        let millis = (end - start).num_milliseconds();
        Some(millis as f64 / 1000.0)
    }
}

/// Optional selector applied by dequeue and stats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref task_type) = self.task_type {
            if &job.task_type != task_type {
                return false;
            }
        }
        if let Some(ref dataset) = self.dataset {
            if job.dataset() != Some(dataset.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Intake request for a new job.
///
/// When `output_path` is absent the queue computes one from `dataset`,
/// `bucket` and `file_extension` through the sequential path allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Producer-assigned identifier in formatted form; minted if absent.
    #[serde(default)]
    pub uuid: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub task_input: Map<String, Value>,
    /// Dataset tag; falls back to `task_input["dataset"]`.
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

impl EnqueueRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.task_input.insert(key.into(), value.into());
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = Some(extension.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// The dataset named by the request, either directly or in `task_input`.
    pub fn resolved_dataset(&self) -> Option<String> {
        self.dataset.clone().or_else(|| {
            self.task_input
                .get(DATASET_KEY)
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// Returned by enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub uuid: Id64,
    pub creation_time: DateTime<Utc>,
    /// The output path recorded on the job, whether supplied or allocated.
    #[serde(default)]
    pub output_path: Option<String>,
}

/// Result of reporting a terminal outcome for an in-progress job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReportOutcome {
    /// The job moved into the terminal partition.
    Recorded { partition: Partition },
    /// No in-progress job had that id; it may have been reported already.
    NotFound,
}

impl ReportOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, ReportOutcome::Recorded { .. })
    }
}

/// Counts per partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Returns the total number of jobs in all partitions.
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }

    pub fn get(&self, partition: Partition) -> u64 {
        match partition {
            Partition::Pending => self.pending,
            Partition::InProgress => self.in_progress,
            Partition::Completed => self.completed,
            Partition::Failed => self.failed,
        }
    }

    pub(crate) fn set(&mut self, partition: Partition, count: u64) {
        match partition {
            Partition::Pending => self.pending = count,
            Partition::InProgress => self.in_progress = count,
            Partition::Completed => self.completed = count,
            Partition::Failed => self.failed = count,
        }
    }
}
