//! Database schema constants.
//!
//! The four job partitions share one column layout. `seq` records insertion
//! order so that dequeue can break creation-time ties, and `dataset` mirrors
//! `task_input->>'dataset'` so it can be indexed.

macro_rules! partition_table {
    ($name:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ",
            $name,
            r#" (
    uuid BIGINT PRIMARY KEY,
    seq BIGSERIAL NOT NULL,
    task_type VARCHAR(255) NOT NULL,
    dataset VARCHAR(255),
    task_input JSONB NOT NULL,
    task_output JSONB,
    task_creation_time TIMESTAMPTZ NOT NULL,
    task_start_time TIMESTAMPTZ,
    task_completion_time TIMESTAMPTZ,
    task_attempts INTEGER NOT NULL DEFAULT 0,
    task_lease_expiry TIMESTAMPTZ
)"#
        )
    };
}

pub const CREATE_JOBS_PENDING_TABLE: &str = partition_table!("jobs_pending");

pub const CREATE_JOBS_IN_PROGRESS_TABLE: &str = partition_table!("jobs_in_progress");

pub const CREATE_JOBS_COMPLETED_TABLE: &str = partition_table!("jobs_completed");

pub const CREATE_JOBS_FAILED_TABLE: &str = partition_table!("jobs_failed");

/// One row per dataset, mutated only by the sequential path allocator.
pub const CREATE_SEQUENCE_COUNTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sequence_counters (
    dataset_name VARCHAR(255) PRIMARY KEY,
    subfolder_count BIGINT NOT NULL DEFAULT 0,
    file_count BIGINT NOT NULL DEFAULT 0,
    next_sequence BIGINT NOT NULL DEFAULT 0
)
"#;

/// One row per (bucket, dataset), mutated only by the batch allocator.
pub const CREATE_BATCH_COUNTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS batch_counters (
    bucket VARCHAR(255) NOT NULL,
    dataset VARCHAR(255) NOT NULL,
    sequence_number BIGINT NOT NULL,
    complete BOOLEAN NOT NULL,
    PRIMARY KEY (bucket, dataset)
)
"#;

/// Index statements, one per entry: prepared statements cannot batch.
pub const CREATE_INDEXES: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_jobs_pending_type_created ON jobs_pending(task_type, task_creation_time)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_pending_dataset_created ON jobs_pending(dataset, task_creation_time)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_in_progress_lease ON jobs_in_progress(task_lease_expiry)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_completed_type_created ON jobs_completed(task_type, task_creation_time)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_completed_dataset_created ON jobs_completed(dataset, task_creation_time)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_JOBS_PENDING_TABLE,
        CREATE_JOBS_IN_PROGRESS_TABLE,
        CREATE_JOBS_COMPLETED_TABLE,
        CREATE_JOBS_FAILED_TABLE,
        CREATE_SEQUENCE_COUNTERS_TABLE,
        CREATE_BATCH_COUNTERS_TABLE,
    ];
    statements.extend(CREATE_INDEXES);
    statements
}

/// Table names in the schema.
pub mod tables {
    pub const SEQUENCE_COUNTERS: &str = "sequence_counters";
    pub const BATCH_COUNTERS: &str = "batch_counters";
}
