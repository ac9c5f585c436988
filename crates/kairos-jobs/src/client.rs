//! Client API for creating, inspecting and removing jobs.
//!
//! Every write is persisted before the call returns; storage transients are
//! retried before `StorageUnavailable` reaches the caller.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobRecord, JobState};
use crate::metrics::JobMetrics;
use crate::recurring::RecurringSchedule;
use crate::registry::JobRegistry;
use crate::retry::TransientRetry;
use crate::storage::JobStorage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Record counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: u64,
    /// Keyed by state wire name; every state is present.
    pub by_state: BTreeMap<String, u64>,
}

impl JobStats {
    pub fn count(&self, state: JobState) -> u64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Entry point for callers that produce jobs.
#[derive(Clone)]
pub struct JobClient {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry>,
    transient: TransientRetry,
}

impl JobClient {
    pub fn new(storage: Arc<dyn JobStorage>, registry: Arc<JobRegistry>) -> Self {
        Self {
            storage,
            registry,
            transient: TransientRetry::default(),
        }
    }

    /// Sets the retry loop used for storage transients.
    pub fn with_transient_retry(mut self, transient: TransientRetry) -> Self {
        self.transient = transient;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Creates an ENQUEUED record eligible immediately.
    pub async fn enqueue(&self, job_type: &str, payload: serde_json::Value) -> JobResult<JobId> {
        let now = Utc::now();
        let record = JobRecord::enqueued(job_type, payload, self.registry.max_attempts_for(job_type), now);
        self.create(record).await
    }

    /// Creates a SCHEDULED record that becomes eligible at `at`.
    pub async fn schedule(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> JobResult<JobId> {
        let now = Utc::now();
        let record = JobRecord::scheduled(job_type, payload, self.registry.max_attempts_for(job_type), at, now);
        self.create(record).await
    }

    /// Enqueues a typed job.
    pub async fn enqueue_job<J: Job>(&self, job: &J) -> JobResult<JobId> {
        self.enqueue(J::NAME, serde_json::to_value(job)?).await
    }

    /// Schedules a typed job.
    pub async fn schedule_job<J: Job>(&self, job: &J, at: DateTime<Utc>) -> JobResult<JobId> {
        self.schedule(J::NAME, serde_json::to_value(job)?, at).await
    }

    async fn create(&self, record: JobRecord) -> JobResult<JobId> {
        if !self.registry.contains(&record.job_type) {
            debug!(job_type = %record.job_type, "Creating job of unregistered type");
        }

        let storage = &self.storage;
        let stored = &record;
        self.transient
            .execute("save_job", move || storage.save(stored))
            .await?;

        info!(
            job_id = %record.id,
            job_type = %record.job_type,
            state = %record.state,
            scheduled_at = %record.scheduled_at,
            "Job created"
        );
        JobMetrics::job_created(&record.job_type, record.state);
        Ok(record.id)
    }

    /// Loads a record.
    pub async fn get(&self, id: &JobId) -> JobResult<JobRecord> {
        let storage = &self.storage;
        self.transient.execute("load_job", move || storage.load(id)).await
    }

    /// Moves a record to DELETED so it never runs again.
    ///
    /// PROCESSING records cannot be deleted. Deleting a deleted record is a
    /// no-op.
    pub async fn delete(&self, id: &JobId) -> JobResult<JobRecord> {
        let now = Utc::now();
        let storage = &self.storage;

        let record = self
            .transient
            .execute("delete_job", move || async move {
                let mut mutator = |record: &mut JobRecord| -> JobResult<()> {
                    if record.state == JobState::Deleted {
                        return Ok(());
                    }
                    record.transition_to(JobState::Deleted, now)
                };
                storage.transactionally_update(id, &mut mutator).await
            })
            .await?;

        info!(job_id = %id, job_type = %record.job_type, "Job deleted");
        Ok(record)
    }

    /// Removes a terminal record from storage.
    pub async fn purge(&self, id: &JobId) -> JobResult<()> {
        let record = self.get(id).await?;
        if !record.state.is_terminal() {
            return Err(JobError::InvalidTransition {
                from: record.state,
                to: JobState::Deleted,
            });
        }

        let storage = &self.storage;
        self.transient
            .execute("purge_job", move || storage.delete(id))
            .await?;

        info!(job_id = %id, "Job purged");
        Ok(())
    }

    /// Page of records in `state`, earliest first.
    pub async fn list(&self, state: JobState, offset: usize, limit: usize) -> JobResult<Vec<JobRecord>> {
        let storage = &self.storage;
        self.transient
            .execute("list_jobs", move || storage.find_by_state(state, offset, limit))
            .await
    }

    pub async fn stats(&self) -> JobResult<JobStats> {
        let storage = &self.storage;
        let counts = self
            .transient
            .execute("count_jobs", move || storage.count_by_state())
            .await?;

        let mut stats = JobStats::default();
        for state in JobState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            stats.total += count;
            stats.by_state.insert(state.as_str().to_string(), count);
        }
        Ok(stats)
    }

    /// Creates or updates a recurring schedule; see [`JobClient::upsert_recurring`].
    pub async fn register_recurring(
        &self,
        id: &str,
        cron_expression: &str,
        job_type: &str,
        payload_template: serde_json::Value,
    ) -> JobResult<RecurringSchedule> {
        let registration = RecurringSchedule::new(id, cron_expression, job_type, payload_template, Utc::now())?;
        self.upsert_recurring(registration).await
    }

    /// Idempotent upsert keyed by schedule id.
    ///
    /// A changed cron expression takes the registration's freshly computed
    /// `next_fire_at`; an unchanged one keeps the pending window.
    pub async fn upsert_recurring(&self, registration: RecurringSchedule) -> JobResult<RecurringSchedule> {
        let storage = &self.storage;
        let registration = &registration;

        let stored = self
            .transient
            .execute("register_recurring", move || async move {
                loop {
                    let now = Utc::now();
                    match storage.load_recurring(&registration.id).await {
                        Ok(existing) => {
                            let expected = existing.version;
                            let mut updated = existing;
                            updated.update_from(registration.clone(), now);
                            // a concurrent fire or update moved the version
                            if storage.fire_recurring(expected, &updated, None).await? {
                                updated.version = expected + 1;
                                return Ok(updated);
                            }
                        }
                        Err(JobError::NotFound { .. }) => {
                            storage.save_recurring(registration).await?;
                            return Ok(registration.clone());
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await?;

        info!(
            recurring_id = %stored.id,
            job_type = %stored.job_type,
            cron = %stored.cron_expression,
            next_fire_at = %stored.next_fire_at,
            "Recurring job registered"
        );
        Ok(stored)
    }

    pub async fn get_recurring(&self, id: &str) -> JobResult<RecurringSchedule> {
        let storage = &self.storage;
        self.transient
            .execute("load_recurring", move || storage.load_recurring(id))
            .await
    }

    /// All schedules, ordered by id.
    pub async fn list_recurring(&self) -> JobResult<Vec<RecurringSchedule>> {
        let storage = &self.storage;
        self.transient
            .execute("list_recurring", move || storage.list_recurring())
            .await
    }

    /// Removes a schedule. Instances already spawned are unaffected.
    pub async fn delete_recurring(&self, id: &str) -> JobResult<()> {
        let storage = &self.storage;
        self.transient
            .execute("delete_recurring", move || storage.delete_recurring(id))
            .await?;

        info!(recurring_id = %id, "Recurring job deleted");
        Ok(())
    }

    /// Enqueues one instance of a schedule now, leaving `next_fire_at` alone.
    ///
    /// The instance becomes the schedule's `last_job_id` in the same atomic
    /// write, so the next cron window sees it. Unless the schedule allows
    /// overlap, fails with `InstanceStillRunning` while the previous instance
    /// is unfinished.
    pub async fn trigger_recurring(&self, id: &str) -> JobResult<JobId> {
        let storage = &self.storage;
        let registry = &self.registry;

        let instance = self
            .transient
            .execute("trigger_recurring", move || async move {
                loop {
                    let now = Utc::now();
                    let schedule = storage.load_recurring(id).await?;

                    if !schedule.allow_overlap {
                        if let Some(job_id) = storage.unfinished_instance(&schedule).await? {
                            return Err(JobError::InstanceStillRunning {
                                recurring_id: schedule.id,
                                job_id,
                            });
                        }
                    }

                    let instance =
                        schedule.spawn_instance(registry.max_attempts_for(&schedule.job_type), now);
                    let mut updated = schedule.clone();
                    updated.last_job_id = Some(instance.id);
                    updated.updated_at = now;

                    // a concurrent fire or update moved the version
                    if storage
                        .fire_recurring(schedule.version, &updated, Some(&instance))
                        .await?
                    {
                        return Ok(instance);
                    }
                }
            })
            .await?;

        info!(
            recurring_id = %id,
            job_id = %instance.id,
            job_type = %instance.job_type,
            "Recurring job triggered manually"
        );
        JobMetrics::job_created(&instance.job_type, instance.state);
        Ok(instance.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryStorage;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        host: String,
    }

    #[async_trait::async_trait]
    impl Job for Ping {
        const NAME: &'static str = "ping";
        const MAX_ATTEMPTS: u32 = 7;

        async fn execute(&self, _ctx: JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn client() -> JobClient {
        let registry = Arc::new(JobRegistry::new().with_default_policy(RetryPolicy::exponential(4)));
        registry.register_job::<Ping>().unwrap();
        JobClient::new(Arc::new(MemoryStorage::new()), registry)
    }

    #[tokio::test]
    async fn test_enqueue_then_get() {
        let client = client();
        let id = client.enqueue("email", json!({"to": "x@example.com"})).await.unwrap();

        let record = client.get(&id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.job_type, "email");
        assert_eq!(record.payload, json!({"to": "x@example.com"}));
        assert_eq!(record.state, JobState::Enqueued);
        assert_eq!(record.attempt_count, 0);
        // unregistered type falls back to the default policy
        assert_eq!(record.max_attempts, 4);
    }

    #[tokio::test]
    async fn test_typed_job_uses_registered_attempts() {
        let client = client();
        let at = Utc::now() + chrono::Duration::minutes(5);
        let id = client.schedule_job(&Ping { host: "db".into() }, at).await.unwrap();

        let record = client.get(&id).await.unwrap();
        assert_eq!(record.job_type, "ping");
        assert_eq!(record.state, JobState::Scheduled);
        assert_eq!(record.scheduled_at, at);
        assert_eq!(record.max_attempts, 7);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let client = client();
        assert!(matches!(client.get(&JobId::new()).await, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let client = client();
        let id = client.enqueue("email", json!({})).await.unwrap();

        assert!(matches!(
            client.purge(&id).await,
            Err(JobError::InvalidTransition { .. })
        ));

        let deleted = client.delete(&id).await.unwrap();
        assert_eq!(deleted.state, JobState::Deleted);
        assert_eq!(client.delete(&id).await.unwrap().state, JobState::Deleted);

        client.purge(&id).await.unwrap();
        assert!(client.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_cover_every_state() {
        let client = client();
        client.enqueue("a", json!({})).await.unwrap();
        client.enqueue("b", json!({})).await.unwrap();
        client
            .schedule("c", json!({}), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(JobState::Enqueued), 2);
        assert_eq!(stats.count(JobState::Scheduled), 1);
        assert_eq!(stats.by_state.len(), JobState::ALL.len());
    }

    #[tokio::test]
    async fn test_register_recurring_is_idempotent() {
        let client = client();
        let first = client
            .register_recurring("nightly", "0 0 0 * * *", "report", json!({"v": 1}))
            .await
            .unwrap();
        let second = client
            .register_recurring("nightly", "0 0 0 * * *", "report", json!({"v": 2}))
            .await
            .unwrap();

        assert_eq!(second.next_fire_at, first.next_fire_at);
        assert_eq!(second.version, first.version + 1);
        assert_eq!(client.list_recurring().await.unwrap().len(), 1);
        assert_eq!(
            client.get_recurring("nightly").await.unwrap().payload_template,
            json!({"v": 2})
        );
    }

    #[tokio::test]
    async fn test_changed_cron_recomputes_next_fire() {
        let client = client();
        let daily = client
            .register_recurring("report", "0 0 0 * * *", "report", json!({}))
            .await
            .unwrap();
        let minutely = client
            .register_recurring("report", "0 * * * * *", "report", json!({}))
            .await
            .unwrap();

        assert!(minutely.next_fire_at <= Utc::now() + chrono::Duration::minutes(1));
        assert!(minutely.next_fire_at <= daily.next_fire_at);
        assert_eq!(minutely.cron_expression, "0 * * * * *");
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let client = client();
        let result = client.register_recurring("bad", "every day", "report", json!({})).await;
        assert!(matches!(result, Err(JobError::InvalidCron { .. })));
    }

    #[tokio::test]
    async fn test_trigger_recurring_keeps_window() {
        let client = client();
        let schedule = client
            .register_recurring("nightly", "0 0 0 * * *", "ping", json!({"host": "db"}))
            .await
            .unwrap();

        let id = client.trigger_recurring("nightly").await.unwrap();
        let record = client.get(&id).await.unwrap();
        assert_eq!(record.recurring_id.as_deref(), Some("nightly"));
        assert_eq!(record.state, JobState::Enqueued);
        assert_eq!(record.max_attempts, 7);

        let after = client.get_recurring("nightly").await.unwrap();
        assert_eq!(after.next_fire_at, schedule.next_fire_at);
        assert_eq!(after.last_job_id, Some(id));

        assert!(matches!(
            client.trigger_recurring("nightly").await,
            Err(JobError::InstanceStillRunning { job_id, .. }) if job_id == id
        ));

        client.delete_recurring("nightly").await.unwrap();
        assert!(client.trigger_recurring("nightly").await.is_err());
    }
}
