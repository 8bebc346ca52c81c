//! Read-only analytics over the completed-job history.

pub mod cache;
pub mod rate;

pub use cache::{CacheStats, TtlCache};
pub use rate::{mean_rate, RateEstimator, DEFAULT_RATE, DEFAULT_SAMPLE_SIZE};
