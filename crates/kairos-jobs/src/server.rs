//! Job server: one scheduler loop and one worker pool sharing storage.

use crate::client::JobClient;
use crate::error::{JobError, JobResult};
use crate::recurring::RecurringSchedule;
use crate::registry::JobRegistry;
use crate::retry::TransientRetry;
use crate::retry_controller::RetryController;
use crate::scheduler::{SchedulerCore, SchedulerCoreConfig, SchedulerStats};
use crate::storage::JobStorage;
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use chrono::Utc;
use kairos_config::AppConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Job server configuration.
#[derive(Debug, Clone)]
pub struct JobServerConfig {
    pub scheduler: SchedulerCoreConfig,
    pub worker: WorkerPoolConfig,
    pub run_scheduler: bool,
    pub run_workers: bool,
    pub transient_retry: TransientRetry,
}

impl Default for JobServerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for JobServerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            scheduler: SchedulerCoreConfig::from(&config.scheduler),
            worker: WorkerPoolConfig::from(&config.worker),
            run_scheduler: config.scheduler.enabled,
            run_workers: config.worker.enabled,
            transient_retry: TransientRetry::from(&config.storage.transient_retry),
        }
    }
}

/// Runs the scheduler and worker pool as background tasks.
pub struct JobServer {
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry>,
    client: JobClient,
    scheduler: Arc<SchedulerCore>,
    pool: Arc<WorkerPool>,
    config: JobServerConfig,
    tasks: Mutex<Vec<JoinHandle<JobResult<()>>>>,
}

impl JobServer {
    pub fn new(storage: Arc<dyn JobStorage>, registry: Arc<JobRegistry>, config: JobServerConfig) -> Self {
        let controller = RetryController::new(storage.clone(), registry.clone())
            .with_transient_retry(config.transient_retry.clone());

        let scheduler = SchedulerCore::new(
            storage.clone(),
            registry.clone(),
            controller.clone(),
            config.scheduler.clone(),
        );
        let pool = WorkerPool::new(storage.clone(), registry.clone(), controller, config.worker.clone());
        let client = JobClient::new(storage.clone(), registry.clone())
            .with_transient_retry(config.transient_retry.clone());

        Self {
            storage,
            registry,
            client,
            scheduler: Arc::new(scheduler),
            pool: Arc::new(pool),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Client bound to the same storage and registry.
    pub fn client(&self) -> &JobClient {
        &self.client
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<SchedulerCore> {
        &self.scheduler
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Registers recurring schedules declared in the registry, then starts
    /// the enabled loops.
    ///
    /// Refuses to start if a job type's timeout reaches the orphan timeout,
    /// since a live attempt would then be recovered and run twice.
    pub async fn start(&self) -> JobResult<()> {
        if !self.tasks.lock().is_empty() {
            return Err(JobError::Configuration("Job server already started".to_string()));
        }
        self.registry.check_claim_timeout(self.config.scheduler.orphan_timeout)?;

        self.register_declared_schedules().await?;

        let mut tasks = Vec::new();
        if self.config.run_scheduler {
            let scheduler = self.scheduler.clone();
            tasks.push(tokio::spawn(async move { scheduler.start().await }));
        }
        if self.config.run_workers {
            tasks.push(tokio::spawn(self.pool.clone().start()));
        }

        info!(
            backend = self.storage.backend_name(),
            job_types = ?self.registry.names(),
            scheduler = self.config.run_scheduler,
            workers = self.config.run_workers,
            "Job server started"
        );

        *self.tasks.lock() = tasks;
        Ok(())
    }

    async fn register_declared_schedules(&self) -> JobResult<()> {
        let now = Utc::now();
        for (job_type, spec) in self.registry.recurring_specs() {
            let registration =
                RecurringSchedule::new(&spec.id, &spec.cron_expression, &job_type, spec.payload, now)?
                    .with_allow_overlap(spec.allow_overlap);
            self.client.upsert_recurring(registration).await?;
        }
        Ok(())
    }

    /// Stops both loops and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down job server...");
        self.scheduler.stop();
        self.pool.stop();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Job server task failed"),
                Err(e) => error!(error = %e, "Job server task panicked"),
            }
        }
        info!("Job server stopped");
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn worker_stats(&self) -> WorkerPoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobState};
    use crate::registry::JobDefinition;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    async fn ok(_: serde_json::Value, _: JobContext) -> Result<(), JobError> {
        Ok(())
    }

    fn fast_config() -> JobServerConfig {
        let mut config = JobServerConfig::default();
        config.scheduler.poll_interval = Duration::from_millis(20);
        config.worker.poll_interval = Duration::from_millis(10);
        config.worker.poll_jitter = Duration::from_millis(5);
        config.worker.concurrency = 2;
        config
    }

    #[tokio::test]
    async fn test_declared_schedules_registered_on_start() {
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(JobDefinition::from_fn("heartbeat", ok).with_recurring("heartbeat", "*/1 * * * *", json!({})))
            .unwrap();
        let server = JobServer::new(Arc::new(MemoryStorage::new()), registry, fast_config());

        server.start().await.unwrap();
        assert!(server.start().await.is_err());

        let schedules = server.client().list_recurring().await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].job_type, "heartbeat");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_timeout_outliving_claim() {
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(JobDefinition::from_fn("long", ok).with_timeout(Duration::from_secs(1800)))
            .unwrap();
        let server = JobServer::new(Arc::new(MemoryStorage::new()), registry, fast_config());

        assert!(matches!(server.start().await, Err(JobError::Configuration(_))));
        assert!(!server.scheduler().is_running());
        assert!(!server.worker_pool().is_running());
    }

    #[tokio::test]
    async fn test_enqueued_job_runs() {
        let registry = Arc::new(JobRegistry::new());
        registry.register_fn("ok", ok).unwrap();
        let server = JobServer::new(Arc::new(MemoryStorage::new()), registry, fast_config());
        server.start().await.unwrap();

        let id = server.client().enqueue("ok", json!({})).await.unwrap();
        let mut state = JobState::Enqueued;
        for _ in 0..200 {
            state = server.client().get(&id).await.unwrap().state;
            if state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.shutdown().await;
        assert_eq!(state, JobState::Succeeded);
        assert_eq!(server.worker_stats().jobs_succeeded, 1);
    }
}
