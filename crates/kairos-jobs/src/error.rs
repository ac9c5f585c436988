//! Job error types.

use crate::job::{JobId, JobState};
use kairos_core::KairosError;
use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Storage backend unreachable or failing. Transient.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another executor claimed the record first.
    #[error("Job {0} was already claimed")]
    AlreadyClaimed(JobId),

    /// No handler registered for the job type.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// The handler returned an error or panicked.
    #[error("Job handler failed: {0}")]
    HandlerFailure(String),

    /// The handler exceeded its timeout.
    #[error("Job timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Job record or recurring schedule not found.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// State change not allowed by the job lifecycle.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// Compare-and-swap lost against a concurrent writer.
    #[error("Version conflict on {0}")]
    VersionConflict(String),

    /// A recurring schedule's previous instance has not finished.
    #[error("Recurring schedule {recurring_id} still has instance {job_id} running")]
    InstanceStillRunning { recurring_id: String, job_id: JobId },

    /// Cron expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl JobError {
    /// Creates a handler failure from any displayable error.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::HandlerFailure(message.to_string())
    }

    /// Creates a not found error for a job record.
    pub fn job_not_found(id: &JobId) -> Self {
        Self::NotFound {
            resource: "Job",
            id: id.to_string(),
        }
    }

    /// Creates a not found error for a recurring schedule.
    pub fn recurring_not_found(id: &str) -> Self {
        Self::NotFound {
            resource: "RecurringSchedule",
            id: id.to_string(),
        }
    }

    /// Returns true if a job that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::HandlerFailure(_) | JobError::Timeout(_) | JobError::StorageUnavailable(_)
        )
    }

    /// Returns true if the storage call itself may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::StorageUnavailable(_))
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::StorageUnavailable(_) => "storage_unavailable",
            JobError::AlreadyClaimed(_) => "already_claimed",
            JobError::UnknownJobType(_) => "unknown_job_type",
            JobError::HandlerFailure(_) => "handler_failure",
            JobError::Timeout(_) => "timeout",
            JobError::NotFound { .. } => "not_found",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::VersionConflict(_) => "version_conflict",
            JobError::InstanceStillRunning { .. } => "instance_still_running",
            JobError::InvalidCron { .. } => "invalid_cron",
            JobError::Serialization(_) => "serialization",
            JobError::Configuration(_) => "configuration",
        }
    }
}

impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        JobError::StorageUnavailable(format!("redis: {}", err))
    }
}

impl From<deadpool_redis::PoolError> for JobError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        JobError::StorageUnavailable(format!("redis pool: {}", err))
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::StorageUnavailable(format!("sql: {}", err))
    }
}

impl From<JobError> for KairosError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::StorageUnavailable(msg) => KairosError::StorageUnavailable(msg),
            JobError::NotFound { resource, id } => KairosError::NotFound {
                resource_type: resource,
                id,
            },
            e @ (JobError::AlreadyClaimed(_)
            | JobError::InvalidTransition { .. }
            | JobError::VersionConflict(_)
            | JobError::InstanceStillRunning { .. }) => KairosError::Conflict(e.to_string()),
            e @ (JobError::UnknownJobType(_)
            | JobError::InvalidCron { .. }
            | JobError::Serialization(_)) => KairosError::Validation(e.to_string()),
            JobError::Configuration(msg) => KairosError::Configuration(msg),
            e @ JobError::Timeout(_) => KairosError::Timeout(e.to_string()),
            e @ JobError::HandlerFailure(_) => KairosError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_failures_are_retryable() {
        assert!(JobError::handler("boom").is_retryable());
        assert!(JobError::Timeout(Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_unknown_job_type_is_not_retryable() {
        assert!(!JobError::UnknownJobType("mystery".into()).is_retryable());
        assert!(!JobError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn test_only_storage_errors_are_transient() {
        assert!(JobError::StorageUnavailable("down".into()).is_transient());
        assert!(!JobError::handler("boom").is_transient());
        assert!(!JobError::AlreadyClaimed(JobId::new()).is_transient());
    }

    #[test]
    fn test_error_display_timeout() {
        let err = JobError::Timeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = JobError::InvalidTransition {
            from: JobState::Processing,
            to: JobState::Deleted,
        };
        assert_eq!(err.to_string(), "Invalid state transition: PROCESSING -> DELETED");
    }

    #[test]
    fn test_into_kairos_error() {
        let id = JobId::new();
        let err: KairosError = JobError::job_not_found(&id).into();
        assert_eq!(err.status_code(), 404);

        let err: KairosError = JobError::InvalidTransition {
            from: JobState::Processing,
            to: JobState::Deleted,
        }
        .into();
        assert_eq!(err.status_code(), 409);

        let err: KairosError = JobError::InstanceStillRunning {
            recurring_id: "nightly".into(),
            job_id: id,
        }
        .into();
        assert_eq!(err.status_code(), 409);

        let err: KairosError = JobError::StorageUnavailable("redis down".into()).into();
        assert_eq!(err.status_code(), 503);

        let err: KairosError = JobError::InvalidCron {
            expression: "nope".into(),
            message: "bad".into(),
        }
        .into();
        assert_eq!(err.status_code(), 400);
    }
}
