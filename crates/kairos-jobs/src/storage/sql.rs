//! SQLite storage.
//!
//! Records are stored as JSON in `data`; `state`, `scheduled_at_us` and
//! `version` are duplicated into columns for the due-job index and CAS.

use super::{schedule_score, JobStorage};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::recurring::RecurringSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_config::SqliteStorageConfig;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS kairos_jobs (
        id TEXT PRIMARY KEY NOT NULL,
        job_type TEXT NOT NULL,
        state TEXT NOT NULL,
        scheduled_at_us INTEGER NOT NULL,
        version INTEGER NOT NULL,
        data TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS kairos_jobs_due
        ON kairos_jobs (state, scheduled_at_us, id)",
    "CREATE TABLE IF NOT EXISTS kairos_recurring_jobs (
        id TEXT PRIMARY KEY NOT NULL,
        version INTEGER NOT NULL,
        data TEXT NOT NULL
    )",
];

const UPSERT_JOB: &str = "INSERT INTO kairos_jobs (id, job_type, state, scheduled_at_us, version, data)
    VALUES (?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        job_type = excluded.job_type,
        state = excluded.state,
        scheduled_at_us = excluded.scheduled_at_us,
        version = excluded.version,
        data = excluded.data";

/// SQLite-backed storage.
#[derive(Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    /// Opens the configured database and creates the tables.
    pub async fn connect(config: &SqliteStorageConfig) -> JobResult<Self> {
        info!(url = %config.url, "Connecting to SQLite job storage...");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> JobResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the tables if needed.
    pub async fn from_pool(pool: SqlitePool) -> JobResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    async fn upsert<'e, E>(executor: E, record: &JobRecord) -> JobResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(UPSERT_JOB)
            .bind(record.id.to_string())
            .bind(&record.job_type)
            .bind(record.state.as_str())
            .bind(schedule_score(record.scheduled_at))
            .bind(record.version as i64)
            .bind(serde_json::to_string(record)?)
            .execute(executor)
            .await?;
        Ok(())
    }
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> JobResult<Vec<T>> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(JobError::from))
        .collect()
}

#[async_trait]
impl JobStorage for SqlStorage {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn save(&self, record: &JobRecord) -> JobResult<()> {
        Self::upsert(&self.pool, record).await?;
        debug!(job_id = %record.id, state = %record.state, "Saved job record");
        Ok(())
    }

    async fn load(&self, id: &JobId) -> JobResult<JobRecord> {
        let data = sqlx::query_scalar::<_, String>("SELECT data FROM kairos_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(JobError::job_not_found(id)),
        }
    }

    async fn find_due(
        &self,
        before: DateTime<Utc>,
        states: &[JobState],
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        if states.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT data FROM kairos_jobs WHERE scheduled_at_us <= ");
        query.push_bind(schedule_score(before));
        query.push(" AND state IN (");
        let mut separated = query.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        separated.push_unseparated(")");
        query.push(" ORDER BY scheduled_at_us, id LIMIT ");
        query.push_bind(limit as i64);

        let rows: Vec<String> = query.build_query_scalar::<String>().fetch_all(&self.pool).await?;
        decode_all(rows)
    }

    async fn find_by_state(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT data FROM kairos_jobs WHERE state = ?
             ORDER BY scheduled_at_us, id LIMIT ? OFFSET ?",
        )
        .bind(state.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        decode_all(rows)
    }

    async fn count_by_state(&self) -> JobResult<HashMap<JobState, u64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT state, COUNT(*) FROM kairos_jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(state, count)| Ok((JobState::from_str(&state)?, count as u64)))
            .collect()
    }

    async fn delete(&self, id: &JobId) -> JobResult<()> {
        let result = sqlx::query("DELETE FROM kairos_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::job_not_found(id));
        }
        debug!(job_id = %id, "Removed job record");
        Ok(())
    }

    async fn compare_and_swap(&self, expected_version: u64, record: &JobRecord) -> JobResult<JobRecord> {
        let mut stored = record.clone();
        stored.version = expected_version + 1;

        let result = sqlx::query(
            "UPDATE kairos_jobs
             SET job_type = ?, state = ?, scheduled_at_us = ?, version = ?, data = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&stored.job_type)
        .bind(stored.state.as_str())
        .bind(schedule_score(stored.scheduled_at))
        .bind(stored.version as i64)
        .bind(serde_json::to_string(&stored)?)
        .bind(stored.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(stored);
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM kairos_jobs WHERE id = ?")
            .bind(record.id.to_string())
            .fetch_one(&self.pool)
            .await?;

        if exists == 0 {
            Err(JobError::job_not_found(&record.id))
        } else {
            Err(JobError::VersionConflict(record.id.to_string()))
        }
    }

    async fn save_recurring(&self, schedule: &RecurringSchedule) -> JobResult<()> {
        sqlx::query(
            "INSERT INTO kairos_recurring_jobs (id, version, data) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version, data = excluded.data",
        )
        .bind(&schedule.id)
        .bind(schedule.version as i64)
        .bind(serde_json::to_string(schedule)?)
        .execute(&self.pool)
        .await?;

        debug!(recurring_id = %schedule.id, "Saved recurring schedule");
        Ok(())
    }

    async fn load_recurring(&self, id: &str) -> JobResult<RecurringSchedule> {
        let data = sqlx::query_scalar::<_, String>("SELECT data FROM kairos_recurring_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(JobError::recurring_not_found(id)),
        }
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringSchedule>> {
        let rows = sqlx::query_scalar::<_, String>("SELECT data FROM kairos_recurring_jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        decode_all(rows)
    }

    async fn delete_recurring(&self, id: &str) -> JobResult<()> {
        let result = sqlx::query("DELETE FROM kairos_recurring_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::recurring_not_found(id));
        }
        Ok(())
    }

    async fn fire_recurring(
        &self,
        expected_version: u64,
        advanced: &RecurringSchedule,
        instance: Option<&JobRecord>,
    ) -> JobResult<bool> {
        let mut stored = advanced.clone();
        stored.version = expected_version + 1;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE kairos_recurring_jobs SET version = ?, data = ? WHERE id = ? AND version = ?",
        )
        .bind(stored.version as i64)
        .bind(serde_json::to_string(&stored)?)
        .bind(&stored.id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(record) = instance {
            Self::upsert(&mut *tx, record).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn health_check(&self) -> JobResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_load_and_overwrite() {
        let storage = SqlStorage::in_memory().await.unwrap();
        let mut record = JobRecord::enqueued("email", json!({"to": "a@example.com"}), 3, Utc::now());
        storage.save(&record).await.unwrap();
        assert_eq!(storage.load(&record.id).await.unwrap(), record);

        record.last_error = Some("boom".into());
        storage.save(&record).await.unwrap();
        assert_eq!(storage.load(&record.id).await.unwrap().last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_find_due_filters_by_state_and_time() {
        let storage = SqlStorage::in_memory().await.unwrap();
        let now = Utc::now();
        let due = JobRecord::scheduled("a", json!({}), 3, now - Duration::seconds(5), now);
        let ready = JobRecord::enqueued("b", json!({}), 3, now - Duration::seconds(1));
        let future = JobRecord::scheduled("c", json!({}), 3, now + Duration::seconds(60), now);
        for r in [&due, &ready, &future] {
            storage.save(r).await.unwrap();
        }

        let found = storage
            .find_due(now, &[JobState::Scheduled, JobState::Enqueued], 10)
            .await
            .unwrap();
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![due.id, ready.id]);

        let only_scheduled = storage.find_due(now, &[JobState::Scheduled], 10).await.unwrap();
        assert_eq!(only_scheduled.len(), 1);
        assert!(storage.find_due(now, &[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap_conflict_and_missing() {
        let storage = SqlStorage::in_memory().await.unwrap();
        let record = JobRecord::enqueued("a", json!({}), 3, Utc::now());
        storage.save(&record).await.unwrap();

        let stored = storage.compare_and_swap(0, &record).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(storage.load(&record.id).await.unwrap().version, 1);

        assert!(matches!(
            storage.compare_and_swap(0, &record).await,
            Err(JobError::VersionConflict(_))
        ));

        let other = JobRecord::enqueued("a", json!({}), 3, Utc::now());
        assert!(matches!(
            storage.compare_and_swap(0, &other).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_count_and_page_by_state() {
        let storage = SqlStorage::in_memory().await.unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let r = JobRecord::scheduled("a", json!({ "i": i }), 3, now + Duration::seconds(i), now);
            storage.save(&r).await.unwrap();
        }

        let counts = storage.count_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Scheduled), Some(&5));

        let page = storage.find_by_state(JobState::Scheduled, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].payload, json!({ "i": 2 }));
    }

    #[tokio::test]
    async fn test_recurring_fire_transaction() {
        let storage = SqlStorage::in_memory().await.unwrap();
        let now = Utc::now();
        let schedule = RecurringSchedule::new("nightly", "0 0 0 * * *", "report", json!({}), now).unwrap();
        storage.save_recurring(&schedule).await.unwrap();

        let fire_at = schedule.next_fire_at;
        let instance = schedule.spawn_instance(3, fire_at);
        let advanced = schedule.advanced(fire_at, Some(instance.id)).unwrap();

        assert!(storage.fire_recurring(0, &advanced, Some(&instance)).await.unwrap());
        assert!(!storage.fire_recurring(0, &advanced, Some(&instance)).await.unwrap());

        let reloaded = storage.load_recurring("nightly").await.unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.last_job_id, Some(instance.id));
        assert_eq!(storage.load(&instance.id).await.unwrap().recurring_id.as_deref(), Some("nightly"));

        assert_eq!(storage.list_recurring().await.unwrap().len(), 1);
        storage.delete_recurring("nightly").await.unwrap();
        assert!(storage.load_recurring("nightly").await.is_err());
        assert!(!storage.fire_recurring(1, &advanced, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check() {
        let storage = SqlStorage::in_memory().await.unwrap();
        assert!(storage.health_check().await.is_ok());
    }
}
