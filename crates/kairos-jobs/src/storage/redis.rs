//! Redis storage.
//!
//! Layout under the configured prefix:
//! - `{prefix}:job:{id}` hash with `data` (JSON record), `version` and `state`
//! - `{prefix}:state:{STATE}` sorted set of ids scored by scheduled time in micros
//! - `{prefix}:recurring:{id}` hash with `data` and `version`
//! - `{prefix}:recurring` set of recurring ids
//!
//! Every write that touches a record and its state index runs as a Lua
//! script so the pair never diverges.

use super::{schedule_score, sort_due, JobStorage};
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::recurring::RecurringSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use kairos_config::RedisStorageConfig;
use redis::{AsyncCommands, Script, ScriptInvocation};
use std::collections::HashMap;
use tracing::{debug, info};

/// KEYS: job hash, then the six state sets in `JobState::ALL` order.
/// ARGV: id, data, version, state, position of the target set in KEYS, score.
const SAVE_SCRIPT: &str = r#"
    for i = 2, #KEYS do
        redis.call('ZREM', KEYS[i], ARGV[1])
    end
    redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', ARGV[3], 'state', ARGV[4])
    redis.call('ZADD', KEYS[tonumber(ARGV[5])], ARGV[6], ARGV[1])
    return 1
"#;

/// Same keys as SAVE. ARGV: id, expected version, data, new version, state,
/// target set position, score. Returns -1 if missing, 0 on conflict.
const CAS_SCRIPT: &str = r#"
    local current = redis.call('HGET', KEYS[1], 'version')
    if not current then
        return -1
    end
    if current ~= ARGV[2] then
        return 0
    end
    for i = 2, #KEYS do
        redis.call('ZREM', KEYS[i], ARGV[1])
    end
    redis.call('HSET', KEYS[1], 'data', ARGV[3], 'version', ARGV[4], 'state', ARGV[5])
    redis.call('ZADD', KEYS[tonumber(ARGV[6])], ARGV[7], ARGV[1])
    return 1
"#;

/// Same keys as SAVE. ARGV: id. Returns 0 if missing.
const DELETE_SCRIPT: &str = r#"
    if redis.call('DEL', KEYS[1]) == 0 then
        return 0
    end
    for i = 2, #KEYS do
        redis.call('ZREM', KEYS[i], ARGV[1])
    end
    return 1
"#;

/// KEYS: recurring hash, recurring set, and when an instance is spawned the
/// job hash followed by the six state sets.
/// ARGV: schedule id, expected version, schedule data, new version, then
/// for the instance: job id, data, version, state, target set position, score.
const FIRE_SCRIPT: &str = r#"
    local current = redis.call('HGET', KEYS[1], 'version')
    if current ~= ARGV[2] then
        return 0
    end
    redis.call('HSET', KEYS[1], 'data', ARGV[3], 'version', ARGV[4])
    redis.call('SADD', KEYS[2], ARGV[1])
    if #KEYS > 2 then
        redis.call('HSET', KEYS[3], 'data', ARGV[6], 'version', ARGV[7], 'state', ARGV[8])
        redis.call('ZADD', KEYS[tonumber(ARGV[9])], ARGV[10], ARGV[5])
    end
    return 1
"#;

/// Create a Redis connection pool and verify it with PING.
pub async fn create_pool(config: &RedisStorageConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job storage...");

    let pool = Config::from_url(&config.url)
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for job storage.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Job record hash.
    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    /// Sorted set of ids in `state`, scored by scheduled time.
    pub fn state_index(&self, state: JobState) -> String {
        format!("{}:state:{}", self.prefix, state.as_str())
    }

    /// Recurring schedule hash.
    pub fn recurring(&self, id: &str) -> String {
        format!("{}:recurring:{}", self.prefix, id)
    }

    /// Set of recurring schedule ids.
    pub fn recurring_index(&self) -> String {
        format!("{}:recurring", self.prefix)
    }

    fn state_indexes(&self) -> impl Iterator<Item = String> + '_ {
        JobState::ALL.iter().map(move |s| self.state_index(*s))
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("kairos")
    }
}

/// Lua KEYS position of the state set for `state`, counted after `offset`
/// leading keys.
fn state_slot(state: JobState, offset: usize) -> usize {
    let index = JobState::ALL.iter().position(|s| *s == state).unwrap_or(0);
    offset + index + 1
}

/// Redis-backed storage.
pub struct RedisStorage {
    pool: Pool,
    keys: RedisKeys,
    save_script: Script,
    cas_script: Script,
    delete_script: Script,
    fire_script: Script,
}

impl RedisStorage {
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            save_script: Script::new(SAVE_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
            fire_script: Script::new(FIRE_SCRIPT),
        }
    }

    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn with_record_keys(&self, invocation: &mut ScriptInvocation<'_>, id: &JobId) {
        invocation.key(self.keys.job(id));
        for key in self.keys.state_indexes() {
            invocation.key(key);
        }
    }

    /// Loads records by id, skipping ids whose hash vanished in between.
    async fn load_many(&self, ids: &[String]) -> JobResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hget(format!("{}:job:{}", self.keys.prefix, id), "data");
        }

        let mut conn = self.conn().await?;
        let raw: Vec<Option<String>> = pipe.query_async(&mut *conn).await?;

        raw.into_iter()
            .flatten()
            .map(|data| serde_json::from_str(&data).map_err(JobError::from))
            .collect()
    }
}

#[async_trait]
impl JobStorage for RedisStorage {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn save(&self, record: &JobRecord) -> JobResult<()> {
        let data = serde_json::to_string(record)?;
        let mut invocation = self.save_script.prepare_invoke();
        self.with_record_keys(&mut invocation, &record.id);
        invocation
            .arg(record.id.to_string())
            .arg(data)
            .arg(record.version)
            .arg(record.state.as_str())
            .arg(state_slot(record.state, 1))
            .arg(schedule_score(record.scheduled_at));

        let mut conn = self.conn().await?;
        let _: i64 = invocation.invoke_async(&mut *conn).await?;

        debug!(job_id = %record.id, state = %record.state, "Saved job record");
        Ok(())
    }

    async fn load(&self, id: &JobId) -> JobResult<JobRecord> {
        let mut conn = self.conn().await?;
        let data: Option<String> = conn.hget(self.keys.job(id), "data").await?;

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
        if limit == 0 {
            return Ok(Vec::new());
        }

        let max_score = schedule_score(before);
        let mut ids = Vec::new();
        {
            let mut conn = self.conn().await?;
            for state in states {
                let found: Vec<String> = conn
                    .zrangebyscore_limit(self.keys.state_index(*state), "-inf", max_score, 0, limit as isize)
                    .await?;
                ids.extend(found);
            }
        }

        // Records may have moved between the index read and the load.
        let mut due: Vec<JobRecord> = self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|r| states.contains(&r.state) && r.scheduled_at <= before)
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
        if limit == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.zrange(
                self.keys.state_index(state),
                offset as isize,
                (offset + limit - 1) as isize,
            )
            .await?
        };

        let mut records: Vec<JobRecord> = self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect();
        sort_due(&mut records);
        Ok(records)
    }

    async fn count_by_state(&self) -> JobResult<HashMap<JobState, u64>> {
        let mut pipe = redis::pipe();
        for key in self.keys.state_indexes() {
            pipe.zcard(key);
        }

        let mut conn = self.conn().await?;
        let counts: Vec<u64> = pipe.query_async(&mut *conn).await?;

        Ok(JobState::ALL
            .iter()
            .copied()
            .zip(counts)
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn delete(&self, id: &JobId) -> JobResult<()> {
        let mut invocation = self.delete_script.prepare_invoke();
        self.with_record_keys(&mut invocation, id);
        invocation.arg(id.to_string());

        let mut conn = self.conn().await?;
        let removed: i64 = invocation.invoke_async(&mut *conn).await?;

        if removed == 0 {
            return Err(JobError::job_not_found(id));
        }
        debug!(job_id = %id, "Removed job record");
        Ok(())
    }

    async fn compare_and_swap(&self, expected_version: u64, record: &JobRecord) -> JobResult<JobRecord> {
        let mut stored = record.clone();
        stored.version = expected_version + 1;
        let data = serde_json::to_string(&stored)?;

        let mut invocation = self.cas_script.prepare_invoke();
        self.with_record_keys(&mut invocation, &record.id);
        invocation
            .arg(record.id.to_string())
            .arg(expected_version)
            .arg(data)
            .arg(stored.version)
            .arg(stored.state.as_str())
            .arg(state_slot(stored.state, 1))
            .arg(schedule_score(stored.scheduled_at));

        let mut conn = self.conn().await?;
        let outcome: i64 = invocation.invoke_async(&mut *conn).await?;

        match outcome {
            1 => Ok(stored),
            0 => Err(JobError::VersionConflict(record.id.to_string())),
            _ => Err(JobError::job_not_found(&record.id)),
        }
    }

    async fn save_recurring(&self, schedule: &RecurringSchedule) -> JobResult<()> {
        let data = serde_json::to_string(schedule)?;
        let mut conn = self.conn().await?;

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.keys.recurring(&schedule.id),
                &[("data", data), ("version", schedule.version.to_string())],
            )
            .ignore()
            .sadd(self.keys.recurring_index(), &schedule.id)
            .ignore()
            .query_async(&mut *conn)
            .await?;

        debug!(recurring_id = %schedule.id, "Saved recurring schedule");
        Ok(())
    }

    async fn load_recurring(&self, id: &str) -> JobResult<RecurringSchedule> {
        let mut conn = self.conn().await?;
        let data: Option<String> = conn.hget(self.keys.recurring(id), "data").await?;

        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Err(JobError::recurring_not_found(id)),
        }
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringSchedule>> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = conn.smembers(self.keys.recurring_index()).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.keys.recurring(id), "data");
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut *conn).await?;

        raw.into_iter()
            .flatten()
            .map(|data| serde_json::from_str(&data).map_err(JobError::from))
            .collect()
    }

    async fn delete_recurring(&self, id: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let (removed, _): (u64, u64) = redis::pipe()
            .atomic()
            .del(self.keys.recurring(id))
            .srem(self.keys.recurring_index(), id)
            .query_async(&mut *conn)
            .await?;

        if removed == 0 {
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

        let mut invocation = self.fire_script.prepare_invoke();
        invocation
            .key(self.keys.recurring(&advanced.id))
            .key(self.keys.recurring_index())
            .arg(&advanced.id)
            .arg(expected_version.to_string())
            .arg(serde_json::to_string(&stored)?)
            .arg(stored.version);

        if let Some(record) = instance {
            self.with_record_keys(&mut invocation, &record.id);
            invocation
                .arg(record.id.to_string())
                .arg(serde_json::to_string(record)?)
                .arg(record.version)
                .arg(record.state.as_str())
                .arg(state_slot(record.state, 3))
                .arg(schedule_score(record.scheduled_at));
        }

        let mut conn = self.conn().await?;
        let fired: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(fired == 1)
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
