//! Concurrent claimers racing for the same record.

mod common;

use chrono::Utc;
use kairos_jobs::{JobError, JobRecord, JobState, JobStorage, MemoryStorage, SqlStorage};
use serde_json::json;
use std::sync::Arc;

const CLAIMERS: usize = 16;

async fn exactly_one_claim_wins(storage: Arc<dyn JobStorage>) {
    let now = Utc::now();
    let record = JobRecord::enqueued("race", json!({}), 3, now);
    storage.save(&record).await.unwrap();

    let candidate = storage
        .find_due(now, &[JobState::Enqueued], 1)
        .await
        .unwrap()
        .remove(0);

    let mut handles = Vec::new();
    for i in 0..CLAIMERS {
        let storage = storage.clone();
        let candidate = candidate.clone();
        handles.push(tokio::spawn(async move {
            storage.claim(&candidate, &format!("worker-{}", i), now).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(claimed) => winners.push(claimed),
            Err(JobError::AlreadyClaimed(id)) => assert_eq!(id, record.id),
            Err(e) => panic!("unexpected claim error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = storage.load(&record.id).await.unwrap();
    assert_eq!(stored.state, JobState::Processing);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.version, candidate.version + 1);
    assert_eq!(stored.claimed_by, winners[0].claimed_by);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_claim_wins_in_memory() {
    exactly_one_claim_wins(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_claim_wins_sqlite() {
    exactly_one_claim_wins(Arc::new(SqlStorage::in_memory().await.unwrap())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_drain_queue_without_duplicates() {
    let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
    let now = Utc::now();
    for _ in 0..50 {
        storage
            .save(&JobRecord::enqueued("race", json!({}), 3, now))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", i);
            let mut claimed = Vec::new();
            loop {
                let candidates = storage.find_due(now, &[JobState::Enqueued], 4).await.unwrap();
                if candidates.is_empty() {
                    break;
                }
                for candidate in candidates {
                    if let Ok(record) = storage.claim(&candidate, &worker_id, now).await {
                        claimed.push(record.id);
                    }
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort_by_key(|id| *id.as_uuid());
    all.dedup();

    assert_eq!(total, 50);
    assert_eq!(all.len(), 50);
}
