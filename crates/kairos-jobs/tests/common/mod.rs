//! Shared harness for scheduler integration tests.
//!
//! Tests drive time explicitly: `tick(now)` and `process_next(now)` are
//! called directly instead of running the background loops.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use kairos_jobs::{
    JobClient, JobRegistry, JobStorage, MemoryStorage, ProcessedJob, RetryController, SchedulerCore,
    SchedulerCoreConfig, SqlStorage, TickReport, TransientRetry, WorkerPool, WorkerPoolConfig,
};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub storage: Arc<dyn JobStorage>,
    pub registry: Arc<JobRegistry>,
    pub client: JobClient,
    pub scheduler: SchedulerCore,
    pub pool: WorkerPool,
}

impl Harness {
    pub fn new(storage: Arc<dyn JobStorage>, registry: JobRegistry) -> Self {
        let registry = Arc::new(registry);
        let controller = RetryController::new(storage.clone(), registry.clone())
            .with_transient_retry(TransientRetry::disabled());

        let scheduler = SchedulerCore::new(
            storage.clone(),
            registry.clone(),
            controller.clone(),
            SchedulerCoreConfig {
                poll_interval: Duration::from_millis(20),
                batch_size: 100,
                orphan_timeout: Duration::from_secs(900),
                max_backoff: Duration::from_secs(1),
            },
        );
        let pool = WorkerPool::new(
            storage.clone(),
            registry.clone(),
            controller,
            WorkerPoolConfig {
                worker_id: "harness".to_string(),
                concurrency: 1,
                poll_interval: Duration::from_millis(10),
                poll_jitter: Duration::ZERO,
                shutdown_timeout: Duration::from_secs(5),
                abort_on_timeout: true,
            },
        );
        let client = JobClient::new(storage.clone(), registry.clone())
            .with_transient_retry(TransientRetry::disabled());

        Self {
            storage,
            registry,
            client,
            scheduler,
            pool,
        }
    }

    pub fn memory(registry: JobRegistry) -> Self {
        Self::new(Arc::new(MemoryStorage::new()), registry)
    }

    pub async fn sqlite(registry: JobRegistry) -> Self {
        let storage = SqlStorage::in_memory().await.expect("in-memory sqlite");
        Self::new(Arc::new(storage), registry)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.scheduler.tick(now).await.expect("scheduler tick")
    }

    /// Runs one tick, then processes due jobs until none is left.
    pub async fn run_until_idle(&self, now: DateTime<Utc>) -> Vec<ProcessedJob> {
        self.tick(now).await;

        let mut processed = Vec::new();
        while let Some(job) = self.pool.process_next(now).await.expect("process next") {
            processed.push(job);
        }
        processed
    }
}

pub fn seconds(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}
