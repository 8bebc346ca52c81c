//! Metrics module for Prometheus-based monitoring.
//!
//! Counts queue transitions, reaper actions and allocator writes.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_enqueued("gen");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    BATCH_FILES_WRITTEN, JOBS_DEQUEUED, JOBS_ENQUEUED, JOBS_FINISHED, JOBS_REAPED,
    JOB_PROCESSING_DURATION, PARTITION_DEPTH, REGISTRY, SEQUENCE_ALLOCATIONS,
};
