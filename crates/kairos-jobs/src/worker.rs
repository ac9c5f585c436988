//! Worker pool: executors that claim due jobs and run their handlers.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::registry::JobRegistry;
use crate::retry_controller::{AttemptOutcome, RetryController};
use crate::storage::JobStorage;
use chrono::{DateTime, Utc};
use kairos_config::WorkerConfig;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Due records fetched per claim attempt.
const CLAIM_CANDIDATES: usize = 8;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Pool identity; executors are named `{worker_id}-{index}`.
    pub worker_id: String,

    /// Number of concurrent executors.
    pub concurrency: usize,

    /// Idle delay between polls.
    pub poll_interval: Duration,

    /// Random extra delay added to each idle poll.
    pub poll_jitter: Duration,

    /// Shutdown timeout.
    pub shutdown_timeout: Duration,

    /// Abort timed-out handler tasks instead of detaching them.
    pub abort_on_timeout: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4())),
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            poll_jitter: Duration::from_millis(config.poll_jitter_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            abort_on_timeout: config.abort_on_timeout,
        }
    }
}

/// One finished claim/execute/report cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: JobId,
    pub job_type: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub id: String,
    pub running: bool,
    pub concurrency: usize,
    /// Handlers currently executing.
    pub in_flight: u64,
    /// Attempts finished, whatever the outcome.
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Attempts that failed, including those scheduled for retry.
    pub jobs_failed: u64,
}

/// Pool of executors sharing one storage and registry.
pub struct WorkerPool {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry>,
    controller: RetryController,
    config: WorkerPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: AtomicBool,
    running: AtomicBool,
    in_flight: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry>,
        controller: RetryController,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            storage,
            registry,
            controller,
            config,
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claims and runs at most one due job as this pool's id.
    ///
    /// Returns `None` when nothing due could be claimed.
    pub async fn process_next(&self, now: DateTime<Utc>) -> JobResult<Option<ProcessedJob>> {
        self.process_next_as(&self.config.worker_id, now).await
    }

    async fn process_next_as(
        &self,
        executor_id: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<ProcessedJob>> {
        let Some(claimed) = self.claim_next(executor_id, now).await? else {
            return Ok(None);
        };

        let started = Instant::now();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.report_workers();

        let result = self.execute(&claimed, executor_id, now).await;
        let finished_at = now
            + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.report_workers();
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);

        let outcome = match result {
            Ok(()) => {
                self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_succeeded(&claimed.job_type, started.elapsed());
                self.controller.on_success(&claimed, finished_at).await?
            }
            Err(e) => {
                self.jobs_failed.fetch_add(1, Ordering::Relaxed);
                let ran = !matches!(e, JobError::UnknownJobType(_));
                JobMetrics::attempt_failed(&claimed.job_type, e.kind(), ran.then(|| started.elapsed()));
                self.controller.on_failure(&claimed, &e, finished_at).await?
            }
        };

        Ok(Some(ProcessedJob {
            job_id: claimed.id,
            job_type: claimed.job_type,
            attempt: claimed.attempt_count,
            outcome,
        }))
    }

    /// Claims the first due record that no other executor takes first.
    async fn claim_next(&self, executor_id: &str, now: DateTime<Utc>) -> JobResult<Option<JobRecord>> {
        let candidates = self
            .storage
            .find_due(now, &[JobState::Scheduled, JobState::Enqueued], CLAIM_CANDIDATES)
            .await?;

        for candidate in candidates {
            match self.storage.claim(&candidate, executor_id, now).await {
                Ok(claimed) => {
                    let wait = (now - claimed.scheduled_at).to_std().unwrap_or_default();
                    JobMetrics::job_claimed(&claimed.job_type, wait);
                    return Ok(Some(claimed));
                }
                Err(JobError::AlreadyClaimed(id)) => {
                    debug!(job_id = %id, worker_id = executor_id, "Lost claim race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Runs the handler for a claimed record in its own task.
    async fn execute(&self, claimed: &JobRecord, executor_id: &str, now: DateTime<Utc>) -> Result<(), JobError> {
        let Some(definition) = self.registry.get(&claimed.job_type) else {
            error!(
                job_id = %claimed.id,
                job_type = %claimed.job_type,
                worker_id = executor_id,
                "No handler registered for job type"
            );
            return Err(JobError::UnknownJobType(claimed.job_type.clone()));
        };

        info!(
            job_id = %claimed.id,
            job_type = %claimed.job_type,
            attempt = claimed.attempt_count,
            worker_id = executor_id,
            "Job started"
        );

        let ctx = claimed.to_context(executor_id, now);
        let handler = definition.handler.clone();
        let payload = claimed.payload.clone();
        let span = info_span!("job", job_id = %claimed.id, job_type = %claimed.job_type);
        let mut task = tokio::spawn(async move { handler.handle(payload, ctx).await }.instrument(span));

        match timeout(definition.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(JobError::HandlerFailure(panic_message(join_error))),
            Err(_) => {
                if self.config.abort_on_timeout {
                    task.abort();
                }
                warn!(
                    job_id = %claimed.id,
                    job_type = %claimed.job_type,
                    worker_id = executor_id,
                    timeout_secs = definition.timeout.as_secs(),
                    aborted = self.config.abort_on_timeout,
                    "Job timed out"
                );
                Err(JobError::Timeout(definition.timeout))
            }
        }
    }

    /// Start the worker pool and run until [`WorkerPool::stop`].
    ///
    /// In-flight jobs get `shutdown_timeout` to finish; executors still busy
    /// after that are aborted and their claims left for orphan recovery.
    pub async fn start(self: Arc<Self>) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Worker pool already running".to_string()));
        }

        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting worker pool"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut executors = Vec::with_capacity(self.config.concurrency);
        for index in 0..self.config.concurrency {
            let executor_id = format!("{}-{}", self.config.worker_id, index);
            let rx = self.shutdown_tx.subscribe();
            let span = info_span!("executor", executor_id = %executor_id);
            executors.push(tokio::spawn(self.clone().run_executor(executor_id, rx).instrument(span)));
        }

        if !self.shutdown_requested.load(Ordering::SeqCst) {
            let _ = shutdown_rx.recv().await;
        }

        info!(worker_id = %self.config.worker_id, "Waiting for workers to finish...");
        let drained = timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(executors.iter_mut()),
        )
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.config.worker_id,
                in_flight = self.in_flight.load(Ordering::Relaxed),
                "Shutdown timeout elapsed, aborting busy executors"
            );
            for executor in &executors {
                executor.abort();
            }
        }

        self.running.store(false, Ordering::SeqCst);

        info!(
            worker_id = %self.config.worker_id,
            processed = self.jobs_processed.load(Ordering::Relaxed),
            failed = self.jobs_failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
        Ok(())
    }

    async fn run_executor(self: Arc<Self>, executor_id: String, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(worker_id = %executor_id, "Executor started");

        while !self.shutdown_requested.load(Ordering::SeqCst) {
            let busy = match self.process_next_as(&executor_id, Utc::now()).await {
                Ok(processed) => processed.is_some(),
                Err(e) => {
                    error!(worker_id = %executor_id, error = %e, "Failed to process next job");
                    false
                }
            };
            if busy {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.next_poll_delay()) => {}
            }
        }

        debug!(worker_id = %executor_id, "Executor stopped");
    }

    fn next_poll_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.poll_interval;
        }
        self.config.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn report_workers(&self) {
        WorkerMetrics::update_workers(
            &self.config.worker_id,
            self.in_flight.load(Ordering::Relaxed),
            self.config.concurrency,
        );
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(worker_id = %self.config.worker_id, "Stopping worker pool...");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.config.worker_id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let panic = error.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobContext;
    use crate::registry::JobDefinition;
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    async fn ok(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
        Ok(())
    }

    async fn explode(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
        panic!("kaboom")
    }

    async fn sleepy(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    fn pool(storage: Arc<dyn JobStorage>, registry: Arc<JobRegistry>) -> WorkerPool {
        let controller = RetryController::new(storage.clone(), registry.clone());
        let config = WorkerPoolConfig {
            worker_id: "test-worker".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            poll_jitter: Duration::from_millis(5),
            ..WorkerPoolConfig::default()
        };
        WorkerPool::new(storage, registry, controller, config)
    }

    #[test]
    fn test_config_from_worker_config() {
        let config = WorkerConfig {
            worker_id: Some("w".to_string()),
            concurrency: 0,
            ..WorkerConfig::default()
        };
        let pool_config = WorkerPoolConfig::from(&config);
        assert_eq!(pool_config.worker_id, "w");
        assert_eq!(pool_config.concurrency, 1);
    }

    #[tokio::test]
    async fn test_process_next_idle() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let pool = pool(storage, Arc::new(JobRegistry::new()));
        assert!(pool.process_next(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_next_success() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(JobRegistry::new());
        registry.register_fn("ok", ok).unwrap();
        let pool = pool(storage.clone(), registry);

        let now = Utc::now();
        let record = JobRecord::enqueued("ok", json!({}), 3, now);
        storage.save(&record).await.unwrap();

        let processed = pool.process_next(now).await.unwrap().unwrap();
        assert_eq!(processed.job_id, record.id);
        assert_eq!(processed.attempt, 1);
        assert_eq!(processed.outcome, AttemptOutcome::Succeeded);
        assert_eq!(storage.load(&record.id).await.unwrap().state, JobState::Succeeded);
        assert_eq!(pool.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_closed() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let pool = pool(storage.clone(), Arc::new(JobRegistry::new()));

        let now = Utc::now();
        let record = JobRecord::enqueued("nobody-handles-this", json!({}), 5, now);
        storage.save(&record).await.unwrap();

        let processed = pool.process_next(now).await.unwrap().unwrap();
        assert_eq!(processed.outcome, AttemptOutcome::Failed);

        let stored = storage.load(&record.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.last_error.unwrap().contains("Unknown job type"));
    }

    #[tokio::test]
    async fn test_panic_is_handler_failure() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(JobRegistry::new().with_default_policy(RetryPolicy::none()));
        registry.register_fn("explode", explode).unwrap();
        let pool = pool(storage.clone(), registry);

        let now = Utc::now();
        let record = JobRecord::enqueued("explode", json!({}), 1, now);
        storage.save(&record).await.unwrap();

        let processed = pool.process_next(now).await.unwrap().unwrap();
        assert_eq!(processed.outcome, AttemptOutcome::Failed);
        let stored = storage.load(&record.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(
                JobDefinition::from_fn("sleepy", sleepy)
                    .with_retry_policy(RetryPolicy::none())
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        let pool = pool(storage.clone(), registry);

        let now = Utc::now();
        let record = JobRecord::enqueued("sleepy", json!({}), 1, now);
        storage.save(&record).await.unwrap();

        let processed = pool.process_next(now).await.unwrap().unwrap();
        assert_eq!(processed.outcome, AttemptOutcome::Failed);
        let stored = storage.load(&record.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_start_runs_jobs_until_stopped() {
        let storage: Arc<dyn JobStorage> = Arc::new(MemoryStorage::new());
        let registry = Arc::new(JobRegistry::new());
        registry.register_fn("ok", ok).unwrap();
        let pool = Arc::new(pool(storage.clone(), registry));

        let record = JobRecord::enqueued("ok", json!({}), 3, Utc::now());
        storage.save(&record).await.unwrap();

        let handle = tokio::spawn(pool.clone().start());
        for _ in 0..100 {
            if storage.load(&record.id).await.unwrap().state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(storage.load(&record.id).await.unwrap().state, JobState::Succeeded);
        assert!(!pool.is_running());
    }
}
