//! Job lifecycle: records, the queue state machine and the lease reaper.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──► pending ──dequeue──► in_progress ──report_completion──► completed
//!                ▲                     │
//!                └──── reap (lease) ───┤
//!                                      └──report_failure / reap──► failed
//! ```
//!
//! A job lives in exactly one partition at a time.

pub mod job;
pub mod job_queue;
pub mod reaper;

pub use job::{
    EnqueueReceipt, EnqueueRequest, Job, JobFilter, Partition, QueueStats, ReportOutcome,
    BUCKET_KEY, DATASET_KEY, OUTPUT_PATH_KEY, SEQUENCE_NUMBER_KEY,
};
pub use job_queue::{
    JobQueue, ReapSummary, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY_DATASET,
};
pub use reaper::LeaseReaper;
