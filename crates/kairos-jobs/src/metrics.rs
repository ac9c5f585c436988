//! Metrics for job scheduler monitoring.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host installs a recorder.

use crate::job::JobState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::collections::HashMap;
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total records created by clients.
    pub const JOBS_CREATED_TOTAL: &str = "kairos_jobs_created_total";
    /// Total claims won by executors.
    pub const JOBS_CLAIMED_TOTAL: &str = "kairos_jobs_claimed_total";
    /// Total attempts that succeeded.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "kairos_jobs_succeeded_total";
    /// Total records moved to FAILED.
    pub const JOBS_FAILED_TOTAL: &str = "kairos_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "kairos_jobs_retried_total";
    /// Total attempts that hit their timeout.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "kairos_jobs_timed_out_total";
    /// Total orphaned claims recovered.
    pub const JOBS_RECOVERED_TOTAL: &str = "kairos_jobs_recovered_total";
    /// Total SCHEDULED records promoted to ENQUEUED.
    pub const JOBS_PROMOTED_TOTAL: &str = "kairos_jobs_promoted_total";

    /// Records per state.
    pub const JOBS_BY_STATE: &str = "kairos_jobs_by_state";

    /// Handler duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "kairos_job_duration_seconds";
    /// Delay between scheduled time and claim, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "kairos_job_wait_time_seconds";

    /// Busy executors.
    pub const WORKERS_ACTIVE: &str = "kairos_workers_active";
    /// Executor concurrency.
    pub const WORKERS_CONCURRENCY: &str = "kairos_workers_concurrency";

    /// Recurring instances spawned.
    pub const RECURRING_FIRED_TOTAL: &str = "kairos_recurring_fired_total";
    /// Recurring windows skipped because the previous instance was running.
    pub const RECURRING_SKIPPED_TOTAL: &str = "kairos_recurring_skipped_total";
    /// Scheduler ticks that failed.
    pub const SCHEDULER_TICK_ERRORS_TOTAL: &str = "kairos_scheduler_tick_errors_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_CREATED_TOTAL, "Total number of job records created");
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of claims won by executors");
    describe_counter!(names::JOBS_SUCCEEDED_TOTAL, "Total number of attempts that succeeded");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs moved to FAILED");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of attempts that timed out");
    describe_counter!(names::JOBS_RECOVERED_TOTAL, "Total number of orphaned claims recovered");
    describe_counter!(names::JOBS_PROMOTED_TOTAL, "Total number of scheduled jobs promoted");

    describe_gauge!(names::JOBS_BY_STATE, "Current number of job records per state");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job handler duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Delay between scheduled time and claim in seconds"
    );

    describe_gauge!(names::WORKERS_ACTIVE, "Number of busy executors");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker pool concurrency setting");

    describe_counter!(names::RECURRING_FIRED_TOTAL, "Total number of recurring instances spawned");
    describe_counter!(
        names::RECURRING_SKIPPED_TOTAL,
        "Total number of recurring windows skipped due to overlap"
    );
    describe_counter!(names::SCHEDULER_TICK_ERRORS_TOTAL, "Total number of failed scheduler ticks");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_created(job_type: &str, state: JobState) {
        counter!(
            names::JOBS_CREATED_TOTAL,
            "job_type" => job_type.to_string(),
            "state" => state.as_str()
        )
        .increment(1);
    }

    /// Record a won claim and how long the record waited past its schedule.
    pub fn job_claimed(job_type: &str, wait_time: Duration) {
        counter!(names::JOBS_CLAIMED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        histogram!(names::JOB_WAIT_TIME_SECONDS, "job_type" => job_type.to_string())
            .record(wait_time.as_secs_f64());
    }

    pub fn job_succeeded(job_type: &str, duration: Duration) {
        counter!(names::JOBS_SUCCEEDED_TOTAL, "job_type" => job_type.to_string()).increment(1);
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record an attempt failure. `duration` is `None` when no handler ran.
    pub fn attempt_failed(job_type: &str, error_kind: &str, duration: Option<Duration>) {
        if let Some(duration) = duration {
            histogram!(
                names::JOB_DURATION_SECONDS,
                "job_type" => job_type.to_string(),
                "status" => "failed"
            )
            .record(duration.as_secs_f64());
        }
        if error_kind == "timeout" {
            counter!(names::JOBS_TIMED_OUT_TOTAL, "job_type" => job_type.to_string()).increment(1);
        }
    }

    pub fn job_retried(job_type: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_type" => job_type.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    pub fn job_failed(job_type: &str, error_kind: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.to_string(),
            "error_kind" => error_kind.to_string()
        )
        .increment(1);
    }

    pub fn job_recovered(job_type: &str) {
        counter!(names::JOBS_RECOVERED_TOTAL, "job_type" => job_type.to_string()).increment(1);
    }

    pub fn jobs_promoted(count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL).increment(count);
    }

    /// Update the per-state gauges. States missing from `counts` are set to zero.
    pub fn update_state_counts(counts: &HashMap<JobState, u64>) {
        for state in JobState::ALL {
            let value = counts.get(&state).copied().unwrap_or(0);
            gauge!(names::JOBS_BY_STATE, "state" => state.as_str()).set(value as f64);
        }
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn update_workers(worker_id: &str, active: u64, concurrency: usize) {
        gauge!(names::WORKERS_ACTIVE, "worker_id" => worker_id.to_string()).set(active as f64);
        gauge!(names::WORKERS_CONCURRENCY, "worker_id" => worker_id.to_string())
            .set(concurrency as f64);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn recurring_fired(recurring_id: &str) {
        counter!(names::RECURRING_FIRED_TOTAL, "recurring_id" => recurring_id.to_string())
            .increment(1);
    }

    pub fn recurring_skipped(recurring_id: &str) {
        counter!(names::RECURRING_SKIPPED_TOTAL, "recurring_id" => recurring_id.to_string())
            .increment(1);
    }

    pub fn tick_failed() {
        counter!(names::SCHEDULER_TICK_ERRORS_TOTAL).increment(1);
    }
}
