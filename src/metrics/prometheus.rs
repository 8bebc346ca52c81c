//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs inserted into the pending partition, labeled by task type.
pub static JOBS_ENQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs claimed by a worker, labeled by task type.
pub static JOBS_DEQUEUED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs moved to a terminal partition, labeled by task type and outcome.
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Expired leases handled by the reaper, labeled by action (requeued/failed).
pub static JOBS_REAPED: OnceLock<CounterVec> = OnceLock::new();

/// Time from claim to terminal report in seconds, labeled by task type.
pub static JOB_PROCESSING_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs per partition as of the last stats call.
pub static PARTITION_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Sequence numbers reserved, labeled by dataset.
pub static SEQUENCE_ALLOCATIONS: OnceLock<CounterVec> = OnceLock::new();

/// Batch file writes, labeled by dataset.
pub static BATCH_FILES_WRITTEN: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this runs is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_enqueued = CounterVec::new(
        Opts::new("jobforge_jobs_enqueued_total", "Jobs inserted into pending"),
        &["task_type"],
    )?;

    let jobs_dequeued = CounterVec::new(
        Opts::new("jobforge_jobs_dequeued_total", "Jobs claimed by workers"),
        &["task_type"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new(
            "jobforge_jobs_finished_total",
            "Jobs moved to completed or failed",
        ),
        &["task_type", "outcome"],
    )?;

    let jobs_reaped = CounterVec::new(
        Opts::new("jobforge_jobs_reaped_total", "Expired leases handled"),
        &["action"],
    )?;

    let job_processing_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "jobforge_job_processing_duration_seconds",
            "Time from claim to terminal report in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["task_type"],
    )?;

    let partition_depth = GaugeVec::new(
        Opts::new("jobforge_partition_depth", "Jobs per partition"),
        &["partition"],
    )?;

    let sequence_allocations = CounterVec::new(
        Opts::new(
            "jobforge_sequence_allocations_total",
            "Sequence numbers reserved",
        ),
        &["dataset"],
    )?;

    let batch_files_written = CounterVec::new(
        Opts::new("jobforge_batch_files_written_total", "Batch file writes"),
        &["dataset"],
    )?;

    registry.register(Box::new(jobs_enqueued.clone()))?;
    registry.register(Box::new(jobs_dequeued.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(jobs_reaped.clone()))?;
    registry.register(Box::new(job_processing_duration.clone()))?;
    registry.register(Box::new(partition_depth.clone()))?;
    registry.register(Box::new(sequence_allocations.clone()))?;
    registry.register(Box::new(batch_files_written.clone()))?;

    // A second call leaves the first set of statics in place.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_ENQUEUED.set(jobs_enqueued);
    let _ = JOBS_DEQUEUED.set(jobs_dequeued);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = JOBS_REAPED.set(jobs_reaped);
    let _ = JOB_PROCESSING_DURATION.set(job_processing_duration);
    let _ = PARTITION_DEPTH.set(partition_depth);
    let _ = SEQUENCE_ALLOCATIONS.set(sequence_allocations);
    let _ = BATCH_FILES_WRITTEN.set(batch_files_written);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(enqueued) = JOBS_ENQUEUED.get() {
            enqueued.with_label_values(&["gen"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("jobforge_jobs_enqueued_total"));
    }
}
