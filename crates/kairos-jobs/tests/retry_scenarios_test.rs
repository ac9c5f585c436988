//! End-to-end retry and delay scenarios, run against every local backend.

mod common;

use chrono::Utc;
use common::{seconds, Harness};
use kairos_jobs::{AttemptOutcome, JobContext, JobDefinition, JobError, JobRegistry, JobState, RetryPolicy};
use serde_json::json;
use std::time::Duration;

async fn fail_once(_: serde_json::Value, ctx: JobContext) -> Result<(), JobError> {
    if ctx.attempt == 1 {
        return Err(JobError::handler("first attempt fails"));
    }
    Ok(())
}

async fn always_fail(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
    Err(JobError::handler("downstream rejected the request"))
}

async fn ok(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
    Ok(())
}

async fn sleepy(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

fn registry() -> JobRegistry {
    let registry = JobRegistry::new().with_default_policy(RetryPolicy::fixed(3, 1_000).without_jitter());
    registry.register_fn("fail-once", fail_once).unwrap();
    registry.register_fn("always-fail", always_fail).unwrap();
    registry.register_fn("ok", ok).unwrap();
    registry
        .register(
            JobDefinition::from_fn("sleepy", sleepy)
                .with_retry_policy(RetryPolicy::none())
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    registry
}

async fn fail_once_then_succeeds(harness: Harness) {
    let id = harness.client.enqueue("fail-once", json!({ "n": 1 })).await.unwrap();
    let t0 = Utc::now();

    let first = harness.run_until_idle(t0).await;
    assert_eq!(first.len(), 1);
    assert!(matches!(first[0].outcome, AttemptOutcome::RetryScheduled { .. }));

    let record = harness.client.get(&id).await.unwrap();
    assert_eq!(record.state, JobState::Scheduled);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("Job handler failed: first attempt fails"));
    assert!(record.scheduled_at > t0);

    // Not due again until the backoff has elapsed.
    assert!(harness.pool.process_next(t0).await.unwrap().is_none());

    let second = harness.run_until_idle(t0 + seconds(10)).await;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].outcome, AttemptOutcome::Succeeded);

    let record = harness.client.get(&id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.attempt_count, 2);
    assert!(record.finished_at.is_some());
    assert!(record.claimed_by.is_none());
}

async fn always_failing_job_exhausts_attempts(harness: Harness) {
    let id = harness.client.enqueue("always-fail", json!({})).await.unwrap();
    let t0 = Utc::now();

    let mut outcomes = Vec::new();
    for step in 0..5 {
        for processed in harness.run_until_idle(t0 + seconds(10 * step)).await {
            outcomes.push(processed.outcome);
        }
    }

    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[0], AttemptOutcome::RetryScheduled { .. }));
    assert!(matches!(outcomes[1], AttemptOutcome::RetryScheduled { .. }));
    assert_eq!(outcomes[2], AttemptOutcome::Failed);

    let record = harness.client.get(&id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.max_attempts, 3);
    assert_eq!(record.last_error.as_deref(), Some("Job handler failed: downstream rejected the request"));
}

#[tokio::test]
async fn test_fail_once_then_succeeds_in_memory() {
    fail_once_then_succeeds(Harness::memory(registry())).await;
}

#[tokio::test]
async fn test_fail_once_then_succeeds_sqlite() {
    fail_once_then_succeeds(Harness::sqlite(registry()).await).await;
}

#[tokio::test]
async fn test_always_failing_job_exhausts_attempts_in_memory() {
    always_failing_job_exhausts_attempts(Harness::memory(registry())).await;
}

#[tokio::test]
async fn test_always_failing_job_exhausts_attempts_sqlite() {
    always_failing_job_exhausts_attempts(Harness::sqlite(registry()).await).await;
}

#[tokio::test]
async fn test_delayed_job_becomes_due_at_its_time() {
    let harness = Harness::memory(registry());
    let t0 = Utc::now();
    let id = harness
        .client
        .schedule("ok", json!({ "delay": 15 }), t0 + seconds(15))
        .await
        .unwrap();

    let report = harness.tick(t0 + seconds(14)).await;
    assert_eq!(report.promoted, 0);
    assert!(harness.pool.process_next(t0 + seconds(14)).await.unwrap().is_none());
    assert_eq!(harness.client.get(&id).await.unwrap().state, JobState::Scheduled);

    let report = harness.tick(t0 + seconds(15)).await;
    assert_eq!(report.promoted, 1);
    assert_eq!(harness.client.get(&id).await.unwrap().state, JobState::Enqueued);

    let processed = harness.pool.process_next(t0 + seconds(15)).await.unwrap().unwrap();
    assert_eq!(processed.job_id, id);
    assert_eq!(processed.outcome, AttemptOutcome::Succeeded);
}

#[tokio::test]
async fn test_enqueue_round_trip() {
    let harness = Harness::sqlite(registry()).await;
    let payload = json!({ "source": "integration", "tags": ["a", "b"] });

    let id = harness.client.enqueue("ok", payload.clone()).await.unwrap();
    let record = harness.client.get(&id).await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.job_type, "ok");
    assert_eq!(record.payload, payload);
    assert_eq!(record.state, JobState::Enqueued);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.max_attempts, 3);
    assert!(record.last_error.is_none());
    assert!(record.recurring_id.is_none());
}

#[tokio::test]
async fn test_deleted_job_is_never_claimed() {
    let harness = Harness::memory(registry());
    let id = harness.client.enqueue("ok", json!({})).await.unwrap();

    let deleted = harness.client.delete(&id).await.unwrap();
    assert_eq!(deleted.state, JobState::Deleted);

    assert!(harness.run_until_idle(Utc::now()).await.is_empty());
    assert_eq!(harness.client.get(&id).await.unwrap().state, JobState::Deleted);
}

#[tokio::test]
async fn test_timed_out_job_fails_without_retry_policy() {
    let harness = Harness::memory(registry());
    let id = harness.client.enqueue("sleepy", json!({})).await.unwrap();

    let processed = harness.run_until_idle(Utc::now()).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].outcome, AttemptOutcome::Failed);

    let record = harness.client.get(&id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempt_count, 1);
    assert!(record.last_error.is_some());
}

#[tokio::test]
async fn test_unknown_job_type_fails_closed() {
    let harness = Harness::memory(registry());
    let id = harness.client.enqueue("not-registered", json!({})).await.unwrap();

    let processed = harness.run_until_idle(Utc::now()).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].outcome, AttemptOutcome::Failed);
    assert_eq!(harness.client.get(&id).await.unwrap().state, JobState::Failed);
}
