//! Writes attempt outcomes back to storage.
//!
//! Every outcome is guarded on the record still carrying the claim that
//! produced it, so a late report from an abandoned or orphaned execution
//! never overwrites a newer attempt.

use crate::error::{JobError, JobResult};
use crate::job::{JobRecord, JobState};
use crate::metrics::JobMetrics;
use crate::registry::JobRegistry;
use crate::retry::TransientRetry;
use crate::storage::JobStorage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of reporting an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Rescheduled in SCHEDULED for another attempt.
    RetryScheduled { retry_at: DateTime<Utc> },
    /// Terminal failure.
    Failed,
    /// The claim was lost before the report; nothing was written.
    Stale,
}

/// Applies success and failure outcomes using per-type retry policies.
#[derive(Clone)]
pub struct RetryController {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry>,
    transient: TransientRetry,
}

impl RetryController {
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

    /// Marks the claimed attempt as SUCCEEDED and clears `last_error`.
    pub async fn on_success(
        &self,
        claimed: &JobRecord,
        now: DateTime<Utc>,
    ) -> JobResult<AttemptOutcome> {
        let written = self
            .apply("complete_job", claimed, |record| {
                record.transition_to(JobState::Succeeded, now)?;
                record.last_error = None;
                Ok(())
            })
            .await?;

        if written.is_none() {
            return Ok(AttemptOutcome::Stale);
        }

        info!(
            job_id = %claimed.id,
            job_type = %claimed.job_type,
            attempt = claimed.attempt_count,
            worker_id = claimed.claimed_by.as_deref().unwrap_or_default(),
            "Job succeeded"
        );
        Ok(AttemptOutcome::Succeeded)
    }

    /// Reschedules or terminally fails the claimed attempt.
    ///
    /// A retry happens only when the error is retryable and the type's
    /// policy allows another attempt. The attempt limit is the one stored on
    /// the record when it was created.
    pub async fn on_failure(
        &self,
        claimed: &JobRecord,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> JobResult<AttemptOutcome> {
        let mut policy = self.registry.retry_policy_for(&claimed.job_type);
        policy.max_attempts = claimed.max_attempts;
        let retry = error.is_retryable() && policy.should_retry(claimed.attempt_count);

        let retry_at = retry.then(|| {
            let delay = policy.delay_for_attempt(claimed.attempt_count);
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delta| now.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        let message = error.to_string();

        let written = self
            .apply("fail_job", claimed, |record| {
                match retry_at {
                    Some(at) => {
                        record.transition_to(JobState::Scheduled, now)?;
                        record.scheduled_at = at;
                    }
                    None => record.transition_to(JobState::Failed, now)?,
                }
                record.last_error = Some(message.clone());
                Ok(())
            })
            .await?;

        if written.is_none() {
            return Ok(AttemptOutcome::Stale);
        }

        let worker_id = claimed.claimed_by.as_deref().unwrap_or_default();
        match retry_at {
            Some(retry_at) => {
                warn!(
                    job_id = %claimed.id,
                    job_type = %claimed.job_type,
                    attempt = claimed.attempt_count,
                    worker_id,
                    error = %message,
                    retry_at = %retry_at,
                    "Job failed, retry scheduled"
                );
                JobMetrics::job_retried(&claimed.job_type, claimed.attempt_count);
                Ok(AttemptOutcome::RetryScheduled { retry_at })
            }
            None => {
                warn!(
                    job_id = %claimed.id,
                    job_type = %claimed.job_type,
                    attempt = claimed.attempt_count,
                    worker_id,
                    error = %message,
                    "Job failed permanently"
                );
                JobMetrics::job_failed(&claimed.job_type, error.kind());
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Fails a claim whose executor stopped reporting.
    pub async fn on_orphaned(&self, stale: &JobRecord, now: DateTime<Utc>) -> JobResult<AttemptOutcome> {
        let outcome = self
            .on_failure(stale, &JobError::handler("orphaned"), now)
            .await?;

        if outcome != AttemptOutcome::Stale {
            info!(
                job_id = %stale.id,
                job_type = %stale.job_type,
                attempt = stale.attempt_count,
                worker_id = stale.claimed_by.as_deref().unwrap_or_default(),
                "Recovered orphaned job"
            );
            JobMetrics::job_recovered(&stale.job_type);
        }
        Ok(outcome)
    }

    /// Runs `mutate` under the claim guard. `None` means the claim was lost.
    async fn apply<M>(
        &self,
        operation: &'static str,
        claimed: &JobRecord,
        mutate: M,
    ) -> JobResult<Option<JobRecord>>
    where
        M: Fn(&mut JobRecord) -> JobResult<()> + Send + Sync,
    {
        let id = claimed.id;
        let claimed_by = claimed.claimed_by.as_deref();
        let claimed_at = claimed.claimed_at;
        let mutate = &mutate;
        let storage = &self.storage;

        let result = self
            .transient
            .execute(operation, move || async move {
                let mut guarded = |record: &mut JobRecord| -> JobResult<()> {
                    if record.state != JobState::Processing
                        || record.claimed_by.as_deref() != claimed_by
                        || record.claimed_at != claimed_at
                    {
                        return Err(JobError::AlreadyClaimed(record.id));
                    }
                    mutate(record)
                };
                storage.transactionally_update(&id, &mut guarded).await
            })
            .await;

        match result {
            Ok(record) => Ok(Some(record)),
            Err(JobError::AlreadyClaimed(_)) | Err(JobError::NotFound { .. }) => {
                warn!(
                    job_id = %id,
                    worker_id = claimed_by.unwrap_or_default(),
                    operation,
                    "Dropping stale outcome, claim no longer held"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
