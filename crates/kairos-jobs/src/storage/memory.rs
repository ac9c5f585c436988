//! In-process storage for tests and development. Nothing survives a restart.

use super::{sort_due, JobStorage};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::recurring::RecurringSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    recurring: BTreeMap<String, RecurringSchedule>,
}

/// Storage backed by locked maps.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored job records.
    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().jobs.is_empty()
    }
}

#[async_trait]
impl JobStorage for MemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, record: &JobRecord) -> JobResult<()> {
        self.inner.write().jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> JobResult<JobRecord> {
        self.inner
            .read()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::job_not_found(id))
    }

    async fn find_due(
        &self,
        before: DateTime<Utc>,
        states: &[JobState],
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let mut due: Vec<JobRecord> = self
            .inner
            .read()
            .jobs
            .values()
            .filter(|r| states.contains(&r.state) && r.scheduled_at <= before)
            .cloned()
            .collect();
        sort_due(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_state(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = self
            .inner
            .read()
            .jobs
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        sort_due(&mut records);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_state(&self) -> JobResult<HashMap<JobState, u64>> {
        let mut counts = HashMap::new();
        for record in self.inner.read().jobs.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete(&self, id: &JobId) -> JobResult<()> {
        self.inner
            .write()
            .jobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| JobError::job_not_found(id))
    }

    async fn compare_and_swap(&self, expected_version: u64, record: &JobRecord) -> JobResult<JobRecord> {
        let mut inner = self.inner.write();
        let current = inner
            .jobs
            .get_mut(&record.id)
            .ok_or_else(|| JobError::job_not_found(&record.id))?;

        if current.version != expected_version {
            return Err(JobError::VersionConflict(record.id.to_string()));
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn save_recurring(&self, schedule: &RecurringSchedule) -> JobResult<()> {
        self.inner
            .write()
            .recurring
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn load_recurring(&self, id: &str) -> JobResult<RecurringSchedule> {
        self.inner
            .read()
            .recurring
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::recurring_not_found(id))
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringSchedule>> {
        Ok(self.inner.read().recurring.values().cloned().collect())
    }

    async fn delete_recurring(&self, id: &str) -> JobResult<()> {
        self.inner
            .write()
            .recurring
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| JobError::recurring_not_found(id))
    }

    async fn fire_recurring(
        &self,
        expected_version: u64,
        advanced: &RecurringSchedule,
        instance: Option<&JobRecord>,
    ) -> JobResult<bool> {
        let mut inner = self.inner.write();
        match inner.recurring.get(&advanced.id) {
            Some(current) if current.version == expected_version => {}
            _ => return Ok(false),
        }

        let mut stored = advanced.clone();
        stored.version = expected_version + 1;
        inner.recurring.insert(stored.id.clone(), stored);
        if let Some(record) = instance {
            inner.jobs.insert(record.id, record.clone());
        }
        Ok(true)
    }

    async fn health_check(&self) -> JobResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record_at(offset_secs: i64, now: DateTime<Utc>) -> JobRecord {
        JobRecord::scheduled("demo", json!({}), 3, now + Duration::seconds(offset_secs), now)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let record = JobRecord::enqueued("demo", json!({"k": "v"}), 3, Utc::now());
        storage.save(&record).await.unwrap();

        assert_eq!(storage.load(&record.id).await.unwrap(), record);
        assert!(matches!(
            storage.load(&JobId::new()).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_due_orders_and_limits() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let late = record_at(-1, now);
        let early = record_at(-10, now);
        let future = record_at(30, now);
        for r in [&late, &early, &future] {
            storage.save(r).await.unwrap();
        }

        let due = storage
            .find_due(now, &[JobState::Scheduled, JobState::Enqueued], 10)
            .await
            .unwrap();
        assert_eq!(due.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);

        let limited = storage.find_due(now, &[JobState::Scheduled], 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, early.id);
    }

    #[tokio::test]
    async fn test_compare_and_swap_bumps_version() {
        let storage = MemoryStorage::new();
        let mut record = JobRecord::enqueued("demo", json!({}), 3, Utc::now());
        storage.save(&record).await.unwrap();

        record.last_error = Some("x".into());
        let stored = storage.compare_and_swap(0, &record).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = storage.compare_and_swap(0, &record).await.unwrap_err();
        assert!(matches!(err, JobError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_claim_once() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let record = JobRecord::enqueued("demo", json!({}), 3, now);
        storage.save(&record).await.unwrap();

        let claimed = storage.claim(&record, "worker-a", now).await.unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-a"));

        let second = storage.claim(&record, "worker-b", now).await;
        assert!(matches!(second, Err(JobError::AlreadyClaimed(_))));
    }

    #[tokio::test]
    async fn test_transactionally_update() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let record = JobRecord::enqueued("demo", json!({}), 3, now);
        storage.save(&record).await.unwrap();

        let updated = storage
            .transactionally_update(&record.id, &mut |r: &mut JobRecord| {
                r.transition_to(JobState::Deleted, now)
            })
            .await
            .unwrap();
        assert_eq!(updated.state, JobState::Deleted);

        let err = storage
            .transactionally_update(&record.id, &mut |r: &mut JobRecord| {
                r.transition_to(JobState::Enqueued, now)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_fire_recurring_is_single_shot() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let schedule = RecurringSchedule::new("tick", "* * * * * *", "demo", json!({}), now).unwrap();
        storage.save_recurring(&schedule).await.unwrap();

        let advanced = schedule.advanced(now + Duration::seconds(1), None).unwrap();
        let instance = schedule.spawn_instance(3, now + Duration::seconds(1));

        assert!(storage.fire_recurring(0, &advanced, Some(&instance)).await.unwrap());
        assert!(!storage.fire_recurring(0, &advanced, Some(&instance)).await.unwrap());

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.load_recurring("tick").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_count_and_delete() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        let a = JobRecord::enqueued("demo", json!({}), 3, now);
        let b = record_at(60, now);
        storage.save(&a).await.unwrap();
        storage.save(&b).await.unwrap();

        let counts = storage.count_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Enqueued), Some(&1));
        assert_eq!(counts.get(&JobState::Scheduled), Some(&1));

        storage.delete(&a.id).await.unwrap();
        assert!(storage.delete(&a.id).await.is_err());
        assert_eq!(storage.len(), 1);
    }
}
