//! In-process job and counter storage.
//!
//! Each operation runs inside one critical section of a single mutex, which
//! gives the same guarantee the database backends get from atomic
//! single-document operations: a claim can never hand the same job to two
//! callers and a reservation can never return the same number twice.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::id::Id64;
use crate::queue::{Job, JobFilter, Partition};

use super::{BatchCounter, CounterStore, JobStore, SequenceCounter};

/// A pending job plus its insertion order, used to break creation-time ties.
#[derive(Debug, Clone)]
struct PendingEntry {
    order: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct MemoryState {
    pending: Vec<PendingEntry>,
    in_progress: HashMap<Id64, Job>,
    completed: HashMap<Id64, Job>,
    failed: HashMap<Id64, Job>,
    next_order: u64,
    sequences: HashMap<String, SequenceCounter>,
    batches: HashMap<(String, String), BatchCounter>,
}

impl MemoryState {
    fn contains(&self, uuid: Id64) -> bool {
        self.pending.iter().any(|e| e.job.uuid == uuid)
            || self.in_progress.contains_key(&uuid)
            || self.completed.contains_key(&uuid)
            || self.failed.contains_key(&uuid)
    }

    fn push_pending(&mut self, job: Job) {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.push(PendingEntry { order, job });
    }

    fn terminal_mut(&mut self, partition: Partition) -> Option<&mut HashMap<Id64, Job>> {
        match partition {
            Partition::Completed => Some(&mut self.completed),
            Partition::Failed => Some(&mut self.failed),
            _ => None,
        }
    }
}

/// In-memory `JobStore` and `CounterStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_pending(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.contains(job.uuid) {
            return Err(StoreError::DuplicateKey(job.uuid.to_string()));
        }
        state.push_pending(job.clone());
        Ok(())
    }

    async fn claim_pending(
        &self,
        filter: &JobFilter,
        priority_dataset: Option<&str>,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock();

        let selected = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, entry)| filter.matches(&entry.job))
            .min_by_key(|(_, entry)| {
                let rank = match (priority_dataset, entry.job.dataset()) {
                    (Some(priority), Some(dataset)) if priority == dataset => 0u8,
                    _ => 1u8,
                };
                (rank, entry.job.task_creation_time, entry.order)
            })
            .map(|(idx, _)| idx);

        let Some(idx) = selected else {
            return Ok(None);
        };

        let mut job = state.pending.remove(idx).job;
        job.mark_started(now, lease);
        state.in_progress.insert(job.uuid, job.clone());
        Ok(Some(job))
    }

    async fn finish(
        &self,
        uuid: Id64,
        terminal: Partition,
        output: Option<Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        if !Partition::InProgress.can_transition_to(terminal) || !terminal.is_terminal() {
            return Err(StoreError::Corrupt(format!(
                "{} is not a terminal partition",
                terminal
            )));
        }
        let mut state = self.lock();

        let Some(mut job) = state.in_progress.remove(&uuid) else {
            return Ok(None);
        };
        job.mark_finished(output, now);

        if let Some(target) = state.terminal_mut(terminal) {
            target.insert(uuid, job.clone());
        }
        Ok(Some(job))
    }

    async fn renew_lease(&self, uuid: Id64, until: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.in_progress.get_mut(&uuid) {
            Some(job) => {
                job.task_lease_expiry = Some(until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut expired: Vec<Job> = state
            .in_progress
            .values()
            .filter(|job| job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.task_lease_expiry);
        Ok(expired)
    }

    async fn requeue(&self, uuid: Id64) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(mut job) = state.in_progress.remove(&uuid) else {
            return Ok(false);
        };
        debug_assert!(Partition::InProgress.can_transition_to(Partition::Pending));
        job.mark_requeued();
        state.push_pending(job);
        Ok(true)
    }

    async fn count(&self, partition: Partition, filter: &JobFilter) -> Result<u64, StoreError> {
        let state = self.lock();
        let count = match partition {
            Partition::Pending => state
                .pending
                .iter()
                .filter(|e| filter.matches(&e.job))
                .count(),
            Partition::InProgress => state.in_progress.values().filter(|j| filter.matches(j)).count(),
            Partition::Completed => state.completed.values().filter(|j| filter.matches(j)).count(),
            Partition::Failed => state.failed.values().filter(|j| filter.matches(j)).count(),
        };
        Ok(count as u64)
    }

    async fn recent_completed(
        &self,
        dataset: &str,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .completed
            .values()
            .filter(|job| job.dataset() == Some(dataset))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.task_creation_time.cmp(&a.task_creation_time));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn get(&self, uuid: Id64) -> Result<Option<(Partition, Job)>, StoreError> {
        let state = self.lock();
        if let Some(entry) = state.pending.iter().find(|e| e.job.uuid == uuid) {
            return Ok(Some((Partition::Pending, entry.job.clone())));
        }
        let found = [
            (Partition::InProgress, &state.in_progress),
            (Partition::Completed, &state.completed),
            (Partition::Failed, &state.failed),
        ]
        .into_iter()
        .find_map(|(partition, jobs)| jobs.get(&uuid).map(|job| (partition, job.clone())));
        Ok(found)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn reserve_sequence(&self, dataset: &str) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let counter = state
            .sequences
            .entry(dataset.to_string())
            .or_insert_with(|| SequenceCounter::new(dataset));
        let reserved = counter.next_sequence;
        counter.next_sequence += 1;
        Ok(reserved)
    }

    async fn commit_sequence(
        &self,
        dataset: &str,
        sequence: u64,
        folder_capacity: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state
            .sequences
            .entry(dataset.to_string())
            .or_insert_with(|| SequenceCounter::new(dataset))
            .advance_past(sequence, folder_capacity);
        Ok(())
    }

    async fn sequence_counter(
        &self,
        dataset: &str,
    ) -> Result<Option<SequenceCounter>, StoreError> {
        Ok(self.lock().sequences.get(dataset).cloned())
    }

    async fn batch_counter(
        &self,
        bucket: &str,
        dataset: &str,
    ) -> Result<Option<BatchCounter>, StoreError> {
        let key = (bucket.to_string(), dataset.to_string());
        Ok(self.lock().batches.get(&key).cloned())
    }

    async fn put_batch_counter(&self, counter: &BatchCounter) -> Result<(), StoreError> {
        let key = (counter.bucket.clone(), counter.dataset.clone());
        self.lock().batches.insert(key, counter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(task_type: &str, dataset: &str, created: DateTime<Utc>) -> Job {
        let input = json!({ "dataset": dataset })
            .as_object()
            .cloned()
            .expect("object");
        Job::new(Id64::generate_at(created), task_type, input).with_creation_time(created)
    }

    fn lease() -> Duration {
        Duration::minutes(5)
    }

    #[tokio::test]
    async fn test_claim_moves_job_to_in_progress() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let queued = job("gen", "cats", now);
        store.insert_pending(&queued).await.unwrap();

        let claimed = store
            .claim_pending(&JobFilter::new(), None, now, lease())
            .await
            .unwrap()
            .expect("job available");

        assert_eq!(claimed.uuid, queued.uuid);
        assert_eq!(claimed.task_start_time, Some(now));
        assert_eq!(claimed.task_attempts, 1);

        let (partition, _) = store.get(queued.uuid).await.unwrap().expect("present");
        assert_eq!(partition, Partition::InProgress);
        assert_eq!(
            store.count(Partition::Pending, &JobFilter::new()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_claim_orders_by_creation_then_insertion() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let later = job("gen", "cats", t0 + Duration::seconds(5));
        let first_tie = job("gen", "cats", t0);
        let second_tie = job("gen", "cats", t0);
        store.insert_pending(&later).await.unwrap();
        store.insert_pending(&first_tie).await.unwrap();
        store.insert_pending(&second_tie).await.unwrap();

        let mut order = Vec::new();
        while let Some(j) = store
            .claim_pending(&JobFilter::new(), None, t0, lease())
            .await
            .unwrap()
        {
            order.push(j.uuid);
        }

        assert_eq!(order, vec![first_tie.uuid, second_tie.uuid, later.uuid]);
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_dataset() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let old = job("gen", "other", t0);
        let prioritized = job("gen", "variants", t0 + Duration::seconds(10));
        store.insert_pending(&old).await.unwrap();
        store.insert_pending(&prioritized).await.unwrap();

        let claimed = store
            .claim_pending(&JobFilter::new(), Some("variants"), t0, lease())
            .await
            .unwrap()
            .expect("job");
        assert_eq!(claimed.uuid, prioritized.uuid);
    }

    #[tokio::test]
    async fn test_claim_respects_filter() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_pending(&job("score", "cats", now)).await.unwrap();

        let none = store
            .claim_pending(&JobFilter::new().with_task_type("gen"), None, now, lease())
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let queued = job("gen", "cats", Utc::now());
        store.insert_pending(&queued).await.unwrap();

        let err = store.insert_pending(&queued).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_finish_is_single_shot() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let queued = job("gen", "cats", now);
        store.insert_pending(&queued).await.unwrap();
        store
            .claim_pending(&JobFilter::new(), None, now, lease())
            .await
            .unwrap();

        let finished = store
            .finish(queued.uuid, Partition::Completed, None, now)
            .await
            .unwrap();
        assert!(finished.is_some());

        let again = store
            .finish(queued.uuid, Partition::Failed, None, now)
            .await
            .unwrap();
        assert!(again.is_none());

        let (partition, stored) = store.get(queued.uuid).await.unwrap().expect("present");
        assert_eq!(partition, Partition::Completed);
        assert_eq!(stored.task_completion_time, Some(now));
    }

    #[tokio::test]
    async fn test_finish_rejects_non_terminal_target() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let queued = job("gen", "cats", now);
        store.insert_pending(&queued).await.unwrap();
        store
            .claim_pending(&JobFilter::new(), None, now, lease())
            .await
            .unwrap();

        for target in [Partition::Pending, Partition::InProgress] {
            let err = store.finish(queued.uuid, target, None, now).await.unwrap_err();
            assert!(matches!(err, StoreError::Corrupt(_)));
        }

        let (partition, stored) = store.get(queued.uuid).await.unwrap().expect("present");
        assert_eq!(partition, Partition::InProgress);
        assert!(stored.task_completion_time.is_none());
    }

    #[tokio::test]
    async fn test_requeue_and_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let queued = job("gen", "cats", now);
        store.insert_pending(&queued).await.unwrap();
        store
            .claim_pending(&JobFilter::new(), None, now, Duration::seconds(1))
            .await
            .unwrap();

        assert!(store.expired_leases(now).await.unwrap().is_empty());
        let expired = store
            .expired_leases(now + Duration::seconds(2))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);

        assert!(store.requeue(queued.uuid).await.unwrap());
        assert!(!store.requeue(queued.uuid).await.unwrap());

        let (partition, stored) = store.get(queued.uuid).await.unwrap().expect("present");
        assert_eq!(partition, Partition::Pending);
        assert!(stored.task_start_time.is_none());
        assert_eq!(stored.task_attempts, 1);
    }

    #[tokio::test]
    async fn test_recent_completed_newest_first() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let mut ids = Vec::new();
        for offset in 0..3 {
            let j = job("gen", "cats", t0 + Duration::seconds(offset));
            ids.push(j.uuid);
            store.insert_pending(&j).await.unwrap();
        }
        while let Some(j) = store
            .claim_pending(&JobFilter::new(), None, t0, lease())
            .await
            .unwrap()
        {
            store
                .finish(j.uuid, Partition::Completed, None, t0)
                .await
                .unwrap();
        }

        let recent = store.recent_completed("cats", 2).await.unwrap();
        let recent_ids: Vec<Id64> = recent.iter().map(|j| j.uuid).collect();
        assert_eq!(recent_ids, vec![ids[2], ids[1]]);
        assert!(store.recent_completed("dogs", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_reservation_and_commit() {
        let store = MemoryStore::new();
        assert!(store.sequence_counter("cats").await.unwrap().is_none());

        assert_eq!(store.reserve_sequence("cats").await.unwrap(), 0);
        assert_eq!(store.reserve_sequence("cats").await.unwrap(), 1);
        assert_eq!(store.reserve_sequence("dogs").await.unwrap(), 0);

        store.commit_sequence("cats", 1, 1000).await.unwrap();
        let counter = store.sequence_counter("cats").await.unwrap().expect("exists");
        assert_eq!(counter.file_count, 2);
        assert_eq!(counter.subfolder_count, 0);
        assert_eq!(counter.next_sequence, 2);
    }

    #[tokio::test]
    async fn test_batch_counter_round_trip() {
        let store = MemoryStore::new();
        assert!(store.batch_counter("b", "cats").await.unwrap().is_none());

        let counter = BatchCounter {
            bucket: "b".to_string(),
            dataset: "cats".to_string(),
            sequence_number: 4,
            complete: false,
        };
        store.put_batch_counter(&counter).await.unwrap();
        assert_eq!(
            store.batch_counter("b", "cats").await.unwrap(),
            Some(counter)
        );
        assert!(store.batch_counter("other", "cats").await.unwrap().is_none());
    }
}
