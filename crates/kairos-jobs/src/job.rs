//! Job records, lifecycle states and the typed `Job` trait.

use crate::error::{JobError, JobResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
///
/// UUIDv7, so ids created later sort after ids created earlier. This makes
/// `(scheduled_at, id)` a stable total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for `scheduled_at` to pass.
    Scheduled,
    /// Eligible for any executor.
    Enqueued,
    /// Claimed by exactly one executor.
    Processing,
    /// Handler completed.
    Succeeded,
    /// Attempts exhausted or non-retryable failure.
    Failed,
    /// Removed by an operator.
    Deleted,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    /// Returns the wire name of the state.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "SCHEDULED",
            JobState::Enqueued => "ENQUEUED",
            JobState::Processing => "PROCESSING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Deleted => "DELETED",
        }
    }

    /// Terminal records are never picked up again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Deleted)
    }

    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub const fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Scheduled, Enqueued | Processing | Deleted)
                | (Enqueued, Processing | Deleted)
                | (Processing, Succeeded | Scheduled | Failed)
                | (Succeeded | Failed, Deleted)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| JobError::Configuration(format!("Unknown job state: {}", s)))
    }
}

/// Durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    /// Registry key of the handler.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Opaque handler input.
    pub payload: serde_json::Value,

    pub state: JobState,

    /// Earliest time the record may run.
    pub scheduled_at: DateTime<Utc>,

    /// Attempts started so far. Incremented by the claim.
    pub attempt_count: u32,

    pub max_attempts: u32,

    pub last_error: Option<String>,

    /// Schedule that spawned this record, if any.
    pub recurring_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Bumped by storage on every write.
    #[serde(default)]
    pub version: u64,

    /// Executor owning a PROCESSING record.
    #[serde(default)]
    pub claimed_by: Option<String>,

    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a record that is eligible immediately.
    pub fn enqueued(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(job_type.into(), payload, JobState::Enqueued, now, max_attempts, now)
    }

    /// Creates a record that becomes eligible at `at`.
    pub fn scheduled(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(job_type.into(), payload, JobState::Scheduled, at, max_attempts, now)
    }

    fn new(
        job_type: String,
        payload: serde_json::Value,
        state: JobState,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            payload,
            state,
            scheduled_at,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            recurring_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
            claimed_by: None,
            claimed_at: None,
            finished_at: None,
        }
    }

    /// Marks the record as spawned by a recurring schedule.
    pub fn with_recurring_id(mut self, recurring_id: impl Into<String>) -> Self {
        self.recurring_id = Some(recurring_id.into());
        self
    }

    /// Moves the record to `next`, enforcing the lifecycle.
    ///
    /// Leaving PROCESSING clears the claim. Entering a terminal state sets
    /// `finished_at`.
    pub fn transition_to(&mut self, next: JobState, now: DateTime<Utc>) -> JobResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if self.state == JobState::Processing {
            self.claimed_by = None;
            self.claimed_at = None;
        }
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }

        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Eligible for claiming at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Scheduled | JobState::Enqueued) && self.scheduled_at <= now
    }

    /// Builds the execution context for the current attempt.
    pub fn to_context(&self, worker_id: &str, started_at: DateTime<Utc>) -> JobContext {
        JobContext {
            job_id: self.id,
            job_type: self.job_type.clone(),
            attempt: self.attempt_count,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            started_at,
            worker_id: worker_id.to_string(),
            recurring_id: self.recurring_id.clone(),
        }
    }
}

/// Job execution context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,

    pub job_type: String,

    /// Current attempt number (1-based), read from the durable record.
    pub attempt: u32,

    pub max_attempts: u32,

    pub scheduled_at: DateTime<Utc>,

    pub started_at: DateTime<Utc>,

    /// Executor running this attempt.
    pub worker_id: String,

    pub recurring_id: Option<String>,
}

impl JobContext {
    /// Returns true on the first attempt.
    pub fn is_first_attempt(&self) -> bool {
        self.attempt <= 1
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts after this one.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// Trait for defining typed jobs.
///
/// The struct itself is the payload: it is serialized into the record on
/// enqueue and deserialized again before `execute`.
///
/// # Example
///
/// ```rust,ignore
/// use kairos_jobs::{Job, JobContext, JobError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendReport {
///     recipient: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendReport {
///     const NAME: &'static str = "send-report";
///     const MAX_ATTEMPTS: u32 = 5;
///
///     async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
///         tracing::info!(attempt = ctx.attempt, "sending report to {}", self.recipient);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name for this job type.
    const NAME: &'static str;

    /// Maximum attempts, including the first run.
    const MAX_ATTEMPTS: u32 = 3;

    /// Job timeout in seconds.
    const TIMEOUT_SECS: u64 = 300;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> Result<(), JobError>;

    /// Returns the retry policy for this job type.
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::exponential(Self::MAX_ATTEMPTS)
    }

    /// Returns the job timeout.
    fn timeout() -> Duration {
        Duration::from_secs(Self::TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_job_ids_are_time_ordered() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(serde_json::to_string(&JobState::Enqueued).unwrap(), "\"ENQUEUED\"");
        assert_eq!("processing".parse::<JobState>().unwrap(), JobState::Processing);
        assert!("RUNNING".parse::<JobState>().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        use JobState::*;
        assert!(Scheduled.can_transition_to(Enqueued));
        assert!(Enqueued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Scheduled));
        assert!(Processing.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(Deleted));

        assert!(!Processing.can_transition_to(Deleted));
        assert!(!Succeeded.can_transition_to(Enqueued));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Deleted.can_transition_to(Enqueued));
        assert!(!Enqueued.can_transition_to(Scheduled));
    }

    #[test]
    fn test_transition_sets_finished_and_clears_claim() {
        let now = Utc::now();
        let mut record = JobRecord::enqueued("demo", serde_json::json!({}), 3, now);
        record.transition_to(JobState::Processing, now).unwrap();
        record.claimed_by = Some("worker-1".into());
        record.claimed_at = Some(now);

        let later = now + ChronoDuration::seconds(2);
        record.transition_to(JobState::Succeeded, later).unwrap();
        assert_eq!(record.finished_at, Some(later));
        assert!(record.claimed_by.is_none());
        assert_eq!(record.updated_at, later);
    }

    #[test]
    fn test_invalid_transition_leaves_record_untouched() {
        let now = Utc::now();
        let mut record = JobRecord::enqueued("demo", serde_json::json!({}), 3, now);
        let err = record.transition_to(JobState::Succeeded, now).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(record.state, JobState::Enqueued);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let record = JobRecord::scheduled(
            "demo",
            serde_json::Value::Null,
            3,
            now + ChronoDuration::seconds(15),
            now,
        );
        assert!(!record.is_due(now));
        assert!(record.is_due(now + ChronoDuration::seconds(15)));
    }

    #[test]
    fn test_record_serializes_type_field() {
        let record = JobRecord::enqueued("fire-and-forget-job", serde_json::json!({"a": 1}), 0, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "fire-and-forget-job");
        assert_eq!(json["state"], "ENQUEUED");
        assert_eq!(json["max_attempts"], 1);
    }

    #[test]
    fn test_context_attempt_helpers() {
        let now = Utc::now();
        let mut record = JobRecord::enqueued("demo", serde_json::Value::Null, 3, now);
        record.attempt_count = 1;
        let ctx = record.to_context("worker-1", now);
        assert!(ctx.is_first_attempt());
        assert!(!ctx.is_last_attempt());
        assert_eq!(ctx.remaining_attempts(), 2);
    }
}
