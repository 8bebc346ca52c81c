//! jobforge: job lifecycle and identifier allocation engine.
//!
//! Work items move through pending, in-progress, completed and failed
//! partitions of a shared document store. Every artifact receives a
//! time-ordered 64-bit identifier and a deterministic storage path. Any
//! number of producer and worker processes can share one store without a
//! central lock manager.

pub mod allocator;
pub mod analytics;
pub mod cli;
pub mod config;
pub mod error;
pub mod id;
pub mod metrics;
pub mod queue;
pub mod store;

pub use allocator::{AllocatedPath, BatchAllocator, BatchAppend, SequentialAllocator};
pub use analytics::RateEstimator;
pub use config::EngineConfig;
pub use error::{AllocatorError, ConfigError, IdParseError, QueueError, StoreError};
pub use id::Id64;
pub use queue::{
    EnqueueReceipt, EnqueueRequest, Job, JobFilter, JobQueue, LeaseReaper, Partition,
    QueueStats, ReportOutcome,
};
pub use store::{CounterStore, JobStore, ObjectStore};
