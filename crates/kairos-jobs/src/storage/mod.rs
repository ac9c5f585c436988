//! Durable storage of job records and recurring schedules.
//!
//! Every backend implements [`JobStorage::compare_and_swap`]; claiming and
//! read-modify-write updates are built on top of it, so the storage is the
//! only arbiter of which executor owns a record.

mod memory;
mod redis;
mod sql;

pub use self::memory::MemoryStorage;
pub use self::redis::{create_pool, RedisKeys, RedisStorage};
pub use self::sql::SqlStorage;

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::recurring::RecurringSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_config::{StorageBackend, StorageConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Read-modify-write closure passed to [`JobStorage::transactionally_update`].
pub type RecordMutator<'a> = dyn FnMut(&mut JobRecord) -> JobResult<()> + Send + 'a;

/// CAS loops give up after this many lost races.
const MAX_UPDATE_RETRIES: usize = 16;

/// Storage engine contract.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Inserts or overwrites a record as given.
    async fn save(&self, record: &JobRecord) -> JobResult<()>;

    /// Loads a record, failing with `NotFound`.
    async fn load(&self, id: &JobId) -> JobResult<JobRecord>;

    /// Records in `states` with `scheduled_at <= before`, ordered by
    /// `(scheduled_at, id)`, at most `limit`.
    async fn find_due(
        &self,
        before: DateTime<Utc>,
        states: &[JobState],
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    /// Page of records in `state`, ordered by `(scheduled_at, id)`.
    async fn find_by_state(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    /// Number of records per state. States without records may be absent.
    async fn count_by_state(&self) -> JobResult<HashMap<JobState, u64>>;

    /// Removes a record from storage.
    async fn delete(&self, id: &JobId) -> JobResult<()>;

    /// Stores `record` with version `expected_version + 1` if the stored
    /// version still equals `expected_version`.
    ///
    /// Fails with `VersionConflict` on a lost race and `NotFound` if the
    /// record is gone. Returns the stored copy.
    async fn compare_and_swap(&self, expected_version: u64, record: &JobRecord) -> JobResult<JobRecord>;

    /// Inserts or overwrites a recurring schedule as given.
    async fn save_recurring(&self, schedule: &RecurringSchedule) -> JobResult<()>;

    async fn load_recurring(&self, id: &str) -> JobResult<RecurringSchedule>;

    /// All schedules, ordered by id.
    async fn list_recurring(&self) -> JobResult<Vec<RecurringSchedule>>;

    async fn delete_recurring(&self, id: &str) -> JobResult<()>;

    /// In one atomic step: checks the schedule is still at
    /// `expected_version`, stores `advanced` with version
    /// `expected_version + 1`, and inserts `instance` if given.
    ///
    /// Returns `false` without writing anything when another scheduler
    /// already fired this window or the schedule was removed.
    async fn fire_recurring(
        &self,
        expected_version: u64,
        advanced: &RecurringSchedule,
        instance: Option<&JobRecord>,
    ) -> JobResult<bool>;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> JobResult<()>;

    /// Loads, mutates and writes back a record, repeating on lost races.
    ///
    /// An error from `mutator` aborts the update.
    async fn transactionally_update(
        &self,
        id: &JobId,
        mutator: &mut RecordMutator<'_>,
    ) -> JobResult<JobRecord> {
        for _ in 0..MAX_UPDATE_RETRIES {
            let mut record = self.load(id).await?;
            let expected = record.version;
            mutator(&mut record)?;

            match self.compare_and_swap(expected, &record).await {
                Err(JobError::VersionConflict(_)) => continue,
                other => return other,
            }
        }
        Err(JobError::VersionConflict(id.to_string()))
    }

    /// Atomically moves a due record to PROCESSING for `worker_id`.
    ///
    /// `candidate` is the copy read by `find_due`. Increments
    /// `attempt_count`. Fails with `AlreadyClaimed` if the record changed
    /// since it was read.
    async fn claim(
        &self,
        candidate: &JobRecord,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord> {
        if !candidate.is_due(now) {
            return Err(JobError::AlreadyClaimed(candidate.id));
        }

        let mut claimed = candidate.clone();
        claimed.transition_to(JobState::Processing, now)?;
        claimed.attempt_count += 1;
        claimed.claimed_by = Some(worker_id.to_string());
        claimed.claimed_at = Some(now);

        match self.compare_and_swap(candidate.version, &claimed).await {
            Err(JobError::VersionConflict(_)) | Err(JobError::NotFound { .. }) => {
                Err(JobError::AlreadyClaimed(candidate.id))
            }
            other => other,
        }
    }

    /// The schedule's most recent instance, if it has not reached a
    /// terminal state.
    async fn unfinished_instance(&self, schedule: &RecurringSchedule) -> JobResult<Option<JobId>> {
        let Some(last_job_id) = schedule.last_job_id else {
            return Ok(None);
        };

        match self.load(&last_job_id).await {
            Ok(record) if !record.state.is_terminal() => Ok(Some(record.id)),
            Ok(_) | Err(JobError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// PROCESSING records claimed before `claimed_before`.
    async fn find_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.find_by_state(JobState::Processing, offset, limit).await?;
            let fetched = page.len();
            stale.extend(
                page.into_iter()
                    .filter(|r| r.claimed_at.map_or(true, |at| at < claimed_before)),
            );
            if stale.len() >= limit || fetched < limit {
                break;
            }
            offset += fetched;
        }
        stale.truncate(limit);
        Ok(stale)
    }
}

/// Connects the backend selected in configuration.
pub async fn connect(config: &StorageConfig) -> JobResult<Arc<dyn JobStorage>> {
    let storage: Arc<dyn JobStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Redis => {
            let pool = create_pool(&config.redis).await?;
            Arc::new(RedisStorage::new(pool, &config.redis.key_prefix))
        }
        StorageBackend::Sqlite => Arc::new(SqlStorage::connect(&config.sqlite).await?),
    };

    info!(backend = storage.backend_name(), "Job storage ready");
    Ok(storage)
}

/// Sorts records by `(scheduled_at, id)` ascending.
pub(crate) fn sort_due(records: &mut [JobRecord]) {
    records.sort_by(|a, b| (a.scheduled_at, a.id).cmp(&(b.scheduled_at, b.id)));
}

/// Microsecond sort key used by the SQL column and the Redis score.
pub(crate) fn schedule_score(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}
