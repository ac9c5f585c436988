//! Demo job types exercised by the `/jobs/*` endpoints.

use async_trait::async_trait;
use chrono::Utc;
use kairos_jobs::{Job, JobContext, JobDefinition, JobError, JobRegistry, JobResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Recurring schedule id of the heartbeat job.
pub const HEARTBEAT_SCHEDULE_ID: &str = "heartbeat-recurring-job";

/// Fires every minute.
pub const HEARTBEAT_CRON: &str = "*/1 * * * *";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireAndForgetJob {
    pub source: String,
}

#[async_trait]
impl Job for FireAndForgetJob {
    const NAME: &'static str = "fire-and-forget-job";

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id, source = %self.source, at = %Utc::now(), "Fire-and-forget job ran");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedJob {
    pub payload: String,
}

#[async_trait]
impl Job for DelayedJob {
    const NAME: &'static str = "delayed-job";

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        let late_ms = (ctx.started_at - ctx.scheduled_at).num_milliseconds();
        info!(job_id = %ctx.job_id, payload = %self.payload, late_ms, "Delayed job ran");
        Ok(())
    }
}

/// Sleeps for [`SlowJob::DURATION`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowJob {
    pub payload: String,
}

impl SlowJob {
    pub const DURATION: Duration = Duration::from_secs(7);
}

#[async_trait]
impl Job for SlowJob {
    const NAME: &'static str = "slow-job";
    const TIMEOUT_SECS: u64 = 60;

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id, payload = %self.payload, "Slow job started");
        tokio::time::sleep(Self::DURATION).await;
        info!(job_id = %ctx.job_id, payload = %self.payload, "Slow job finished");
        Ok(())
    }
}

/// Fails on every attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingJob {
    pub payload: String,
}

#[async_trait]
impl Job for FailingJob {
    const NAME: &'static str = "failing-job";

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id, attempt = ctx.attempt, payload = %self.payload, "Failing job ran");
        Err(JobError::handler("Intentional failure for retry demo"))
    }
}

/// Fails on its first attempt only.
///
/// The decision reads the durable attempt count, so it holds across
/// restarts and across workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailOnceThenSuccessJob {
    pub correlation_key: String,
}

#[async_trait]
impl Job for FailOnceThenSuccessJob {
    const NAME: &'static str = "fail-once-then-success-job";

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        if ctx.is_first_attempt() {
            info!(job_id = %ctx.job_id, key = %self.correlation_key, "Fail-once job failing first attempt");
            return Err(JobError::handler("Intentional first failure for retry demo"));
        }

        info!(
            job_id = %ctx.job_id,
            key = %self.correlation_key,
            attempt = ctx.attempt,
            "Fail-once job recovered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatJob {}

#[async_trait]
impl Job for HeartbeatJob {
    const NAME: &'static str = "heartbeat-recurring-job";
    const MAX_ATTEMPTS: u32 = 1;

    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id, recurring_id = ?ctx.recurring_id, at = %Utc::now(), "Recurring heartbeat");
        Ok(())
    }
}

/// Registers every demo job type, including the heartbeat schedule.
pub fn register_demo_jobs(registry: &JobRegistry) -> JobResult<()> {
    registry.register_job::<FireAndForgetJob>()?;
    registry.register_job::<DelayedJob>()?;
    registry.register_job::<SlowJob>()?;
    registry.register_job::<FailingJob>()?;
    registry.register_job::<FailOnceThenSuccessJob>()?;
    registry.register(
        JobDefinition::for_job::<HeartbeatJob>().with_recurring(
            HEARTBEAT_SCHEDULE_ID,
            HEARTBEAT_CRON,
            serde_json::to_value(HeartbeatJob::default())?,
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_jobs::JobRecord;
    use serde_json::json;

    fn context(attempt: u32) -> JobContext {
        let mut record = JobRecord::enqueued(FailOnceThenSuccessJob::NAME, json!({}), 3, Utc::now());
        record.attempt_count = attempt;
        record.to_context("test-worker", Utc::now())
    }

    #[tokio::test]
    async fn test_fail_once_uses_attempt_count() {
        let job = FailOnceThenSuccessJob {
            correlation_key: "k".to_string(),
        };
        assert!(job.execute(context(1)).await.is_err());
        assert!(job.execute(context(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_job_always_fails() {
        let job = FailingJob {
            payload: "p".to_string(),
        };
        for attempt in 1..=3 {
            let err = job.execute(context(attempt)).await.unwrap_err();
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_register_demo_jobs() {
        let registry = JobRegistry::new();
        register_demo_jobs(&registry).unwrap();

        assert_eq!(registry.len(), 6);
        assert_eq!(registry.timeout_for(SlowJob::NAME), Duration::from_secs(60));

        let specs = registry.recurring_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].0, HeartbeatJob::NAME);
        assert_eq!(specs[0].1.id, HEARTBEAT_SCHEDULE_ID);
        assert_eq!(specs[0].1.cron_expression, HEARTBEAT_CRON);
    }
}
