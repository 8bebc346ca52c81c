//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use super::prometheus::{
    BATCH_FILES_WRITTEN, JOBS_DEQUEUED, JOBS_ENQUEUED, JOBS_FINISHED, JOBS_REAPED,
    JOB_PROCESSING_DURATION, PARTITION_DEPTH, SEQUENCE_ALLOCATIONS,
};
use crate::queue::{Partition, QueueStats};

/// Metrics collector for queue and allocator operations.
///
/// # Example
///
/// ```ignore
/// use jobforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_enqueued("gen");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_enqueued(&self, task_type: &str) {
        if let Some(counter) = JOBS_ENQUEUED.get() {
            counter.with_label_values(&[task_type]).inc();
        }
    }

    pub fn record_dequeued(&self, task_type: &str) {
        if let Some(counter) = JOBS_DEQUEUED.get() {
            counter.with_label_values(&[task_type]).inc();
        }
    }

    /// Record a job reaching a terminal partition.
    ///
    /// # Arguments
    ///
    /// * `task_type` - The job's task type
    /// * `outcome` - Terminal partition the job landed in
    /// * `processing_secs` - Claim-to-report time, when both stamps exist
    pub fn record_finished(&self, task_type: &str, outcome: Partition, processing_secs: Option<f64>) {
        let outcome = outcome.to_string();
        if let Some(counter) = JOBS_FINISHED.get() {
            counter.with_label_values(&[task_type, outcome.as_str()]).inc();
        }

        if let (Some(histogram), Some(secs)) = (JOB_PROCESSING_DURATION.get(), processing_secs) {
            histogram.with_label_values(&[task_type]).observe(secs);
        }

        tracing::trace!(
            task_type = task_type,
            outcome = %outcome,
            "Recorded finished job metric"
        );
    }

    /// Record a reaper action ("requeued" or "failed").
    pub fn record_reaped(&self, action: &str) {
        if let Some(counter) = JOBS_REAPED.get() {
            counter.with_label_values(&[action]).inc();
        }
    }

    pub fn update_partition_depth(&self, stats: &QueueStats) {
        let Some(gauge) = PARTITION_DEPTH.get() else {
            return;
        };
        for partition in Partition::ALL {
            let label = partition.to_string();
            gauge
                .with_label_values(&[label.as_str()])
                .set(stats.get(partition) as f64);
        }
    }

    pub fn record_sequence_allocation(&self, dataset: &str) {
        if let Some(counter) = SEQUENCE_ALLOCATIONS.get() {
            counter.with_label_values(&[dataset]).inc();
        }
    }

    pub fn record_batch_file_written(&self, dataset: &str) {
        if let Some(counter) = BATCH_FILES_WRITTEN.get() {
            counter.with_label_values(&[dataset]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_queue_operations() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.record_enqueued("gen");
        collector.record_dequeued("gen");
        collector.record_finished("gen", Partition::Completed, Some(2.0));
        collector.record_finished("gen", Partition::Failed, None);
        collector.record_reaped("requeued");

        let text = export_metrics();
        assert!(text.contains("jobforge_jobs_finished_total"));
        assert!(text.contains("outcome=\"completed\""));
    }

    #[test]
    fn test_update_partition_depth() {
        ensure_metrics_init();
        let stats = QueueStats {
            pending: 4,
            in_progress: 1,
            completed: 0,
            failed: 2,
        };
        MetricsCollector::new().update_partition_depth(&stats);

        let text = export_metrics();
        assert!(text.contains("jobforge_partition_depth{partition=\"in_progress\"}"));
    }

    #[test]
    fn test_record_allocations() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();
        collector.record_sequence_allocation("metrics-test-ds");
        collector.record_batch_file_written("metrics-test-ds");

        let counter = SEQUENCE_ALLOCATIONS.get().expect("initialized");
        assert!(counter.with_label_values(&["metrics-test-ds"]).get() >= 1.0);
    }
}
