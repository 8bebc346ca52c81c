//! Throughput estimation over completed jobs.
//!
//! The rate for a dataset is the arithmetic mean of the per-job rates
//! `1 / (completion - start)` over the most recently created completed jobs,
//! not the aggregate rate over the window.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::queue::Job;
use crate::store::JobStore;

use super::cache::{CacheStats, TtlCache};

/// Returned when there is nothing to measure.
pub const DEFAULT_RATE: f64 = 1.0;

/// Default number of completed jobs sampled.
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Mean of the per-job rates in jobs per second.
///
/// Jobs without both timestamps, or with a non-positive duration, are
/// skipped. Returns [`DEFAULT_RATE`] when no job qualifies.
pub fn mean_rate(jobs: &[Job]) -> f64 {
    let rates: Vec<f64> = jobs
        .iter()
        .filter_map(Job::processing_seconds)
        .filter(|secs| *secs > 0.0)
        .map(|secs| 1.0 / secs)
        .collect();

    if rates.is_empty() {
        return DEFAULT_RATE;
    }
    rates.iter().sum::<f64>() / rates.len() as f64
}

/// Cached per-dataset throughput estimates.
pub struct RateEstimator {
    jobs: Arc<dyn JobStore>,
    cache: TtlCache<(String, usize), f64>,
}

impl RateEstimator {
    /// Creates an estimator whose results live for `ttl`.
    pub fn new(jobs: Arc<dyn JobStore>, ttl: Duration) -> Self {
        Self {
            jobs,
            cache: TtlCache::new(ttl),
        }
    }

    /// Jobs per second for `dataset` over the last `sample_size` completed
    /// jobs, newest creation time first.
    ///
    /// # Errors
    ///
    /// Returns the store error untranslated; nothing is cached in that case.
    pub async fn rate_per_second(&self, dataset: &str, sample_size: usize) -> Result<f64, StoreError> {
        let key = (dataset.to_string(), sample_size);
        if let Some(rate) = self.cache.get(&key) {
            return Ok(rate);
        }

        let rate = if sample_size == 0 {
            DEFAULT_RATE
        } else {
            let samples = self.jobs.recent_completed(dataset, sample_size).await?;
            let rate = mean_rate(&samples);
            debug!(
                dataset = %dataset,
                samples = samples.len(),
                rate = rate,
                "Computed throughput rate"
            );
            rate
        };

        self.cache.insert(key, rate);
        Ok(rate)
    }

    /// Drops the cached estimate for `(dataset, sample_size)`.
    pub fn invalidate(&self, dataset: &str, sample_size: usize) -> bool {
        self.cache.invalidate(&(dataset.to_string(), sample_size))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id64;
    use crate::queue::{JobFilter, Partition};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn completed(start_secs: i64, duration_secs: i64) -> Job {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 10, 0, 0)
            .single()
            .expect("valid time")
            + chrono::Duration::seconds(start_secs);
        let input = json!({"dataset": "cats"}).as_object().cloned().expect("object");
        let mut job = Job::new(Id64::generate_at(start), "gen", input).with_creation_time(start);
        job.task_start_time = Some(start);
        job.task_completion_time = Some(start + chrono::Duration::seconds(duration_secs));
        job
    }

    #[test]
    fn test_mean_rate_empty_is_default() {
        assert_eq!(mean_rate(&[]), 1.0);
    }

    #[test]
    fn test_mean_rate_single_job() {
        assert_eq!(mean_rate(&[completed(0, 2)]), 0.5);
    }

    #[test]
    fn test_mean_rate_is_mean_of_rates() {
        let rate = mean_rate(&[completed(0, 1), completed(10, 4)]);
        assert!((rate - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_mean_rate_skips_unusable_samples() {
        let mut unstarted = completed(0, 3);
        unstarted.task_start_time = None;
        let instant = completed(0, 0);
        assert_eq!(mean_rate(&[unstarted.clone(), instant]), 1.0);
        assert_eq!(mean_rate(&[unstarted, completed(0, 4)]), 0.25);
    }

    async fn store_with_completed(durations: &[i64]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (i, secs) in durations.iter().enumerate() {
            let input = json!({"dataset": "cats"}).as_object().cloned().expect("object");
            let created = now + chrono::Duration::seconds(i as i64);
            let job = Job::new(Id64::generate_at(created), "gen", input).with_creation_time(created);
            store.insert_pending(&job).await.unwrap();
            let claimed = store
                .claim_pending(&JobFilter::new(), None, now, chrono::Duration::minutes(5))
                .await
                .unwrap()
                .expect("job");
            store
                .finish(
                    claimed.uuid,
                    Partition::Completed,
                    None,
                    now + chrono::Duration::seconds(*secs),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_rate_per_second_from_store() {
        let store = store_with_completed(&[2]).await;
        let estimator = RateEstimator::new(store, Duration::from_secs(60));

        assert_eq!(estimator.rate_per_second("cats", 10).await.unwrap(), 0.5);
        assert_eq!(estimator.rate_per_second("dogs", 10).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_rate_is_cached_until_invalidated() {
        let store = store_with_completed(&[2]).await;
        let estimator = RateEstimator::new(store, Duration::from_secs(60));

        assert_eq!(estimator.rate_per_second("cats", 10).await.unwrap(), 0.5);
        assert_eq!(estimator.rate_per_second("cats", 10).await.unwrap(), 0.5);
        assert_eq!(estimator.cache_stats().hits, 1);

        assert!(estimator.invalidate("cats", 10));
        assert!(!estimator.invalidate("cats", 10));
    }

    #[tokio::test]
    async fn test_sample_size_limits_window() {
        // Newest job took 1s, older one 4s.
        let store = store_with_completed(&[4, 1]).await;
        let estimator = RateEstimator::new(store, Duration::from_secs(60));

        assert_eq!(estimator.rate_per_second("cats", 1).await.unwrap(), 1.0);
        let both = estimator.rate_per_second("cats", 2).await.unwrap();
        assert!((both - 0.625).abs() < 1e-9);
    }
}
