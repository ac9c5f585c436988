//! Scheduler core: promotes due jobs, expands recurring schedules and
//! recovers orphaned claims.
//!
//! Any number of schedulers may run against the same storage. Promotion and
//! recovery go through compare-and-swap, and a recurring window is consumed
//! by exactly one `fire_recurring` call.

use crate::error::{JobError, JobResult};
use crate::job::JobState;
use crate::metrics::{JobMetrics, SchedulerMetrics};
use crate::recurring::RecurringSchedule;
use crate::registry::JobRegistry;
use crate::retry_controller::{AttemptOutcome, RetryController};
use crate::storage::JobStorage;
use chrono::{DateTime, Utc};
use kairos_config::SchedulerConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerCoreConfig {
    /// Delay between ticks.
    pub poll_interval: Duration,

    /// Upper bound on records handled per phase per tick.
    pub batch_size: usize,

    /// Claims older than this are orphans.
    pub orphan_timeout: Duration,

    /// Cap on the delay after consecutive failed ticks.
    pub max_backoff: Duration,
}

impl Default for SchedulerCoreConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerCoreConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.batch_size.max(1),
            orphan_timeout: config.orphan_timeout(),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: u64,
    pub recurring_fired: u64,
    /// Windows consumed without spawning because the previous instance was still running.
    pub recurring_skipped: u64,
    pub orphans_recovered: u64,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub id: String,
    pub running: bool,
    pub ticks: u64,
    pub tick_errors: u64,
    pub promoted: u64,
    pub recurring_fired: u64,
    pub orphans_recovered: u64,
}

/// Polling scheduler.
pub struct SchedulerCore {
    id: String,
    storage: Arc<dyn JobStorage>,
    registry: Arc<JobRegistry>,
    controller: RetryController,
    config: SchedulerCoreConfig,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: AtomicBool,
    running: AtomicBool,
    ticks: AtomicU64,
    tick_errors: AtomicU64,
    promoted: AtomicU64,
    recurring_fired: AtomicU64,
    orphans_recovered: AtomicU64,
}

impl SchedulerCore {
    pub fn new(
        storage: Arc<dyn JobStorage>,
        registry: Arc<JobRegistry>,
        controller: RetryController,
        config: SchedulerCoreConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            storage,
            registry,
            controller,
            config,
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            tick_errors: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            recurring_fired: AtomicU64::new(0),
            orphans_recovered: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs one scheduling pass as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> JobResult<TickReport> {
        let mut report = TickReport {
            promoted: self.promote_due(now).await?,
            ..TickReport::default()
        };

        let (fired, skipped) = self.expand_recurring(now).await?;
        report.recurring_fired = fired;
        report.recurring_skipped = skipped;

        report.orphans_recovered = self.recover_orphans(now).await?;

        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.promoted.fetch_add(report.promoted, Ordering::Relaxed);
        self.recurring_fired.fetch_add(report.recurring_fired, Ordering::Relaxed);
        self.orphans_recovered.fetch_add(report.orphans_recovered, Ordering::Relaxed);

        if report != TickReport::default() {
            debug!(scheduler_id = %self.id, ?report, "Scheduler tick");
        }
        Ok(report)
    }

    /// Moves SCHEDULED records whose time has come to ENQUEUED.
    async fn promote_due(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let due = self
            .storage
            .find_due(now, &[JobState::Scheduled], self.config.batch_size)
            .await?;

        let mut promoted = 0;
        for record in due {
            let mut next = record.clone();
            next.transition_to(JobState::Enqueued, now)?;

            match self.storage.compare_and_swap(record.version, &next).await {
                Ok(_) => {
                    promoted += 1;
                    debug!(job_id = %record.id, job_type = %record.job_type, "Promoted scheduled job");
                }
                // claimed or deleted since it was read
                Err(JobError::VersionConflict(_)) | Err(JobError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if promoted > 0 {
            JobMetrics::jobs_promoted(promoted);
        }
        Ok(promoted)
    }

    /// Fires every recurring schedule whose window has passed.
    async fn expand_recurring(&self, now: DateTime<Utc>) -> JobResult<(u64, u64)> {
        let mut fired = 0;
        let mut skipped = 0;

        for schedule in self.storage.list_recurring().await? {
            if !schedule.is_due(now) {
                continue;
            }

            match self.fire(&schedule, now).await {
                Ok(Some(true)) => fired += 1,
                Ok(Some(false)) => skipped += 1,
                Ok(None) => {}
                Err(e @ JobError::InvalidCron { .. }) => {
                    error!(recurring_id = %schedule.id, error = %e, "Recurring schedule has no valid next window");
                }
                Err(e) => return Err(e),
            }
        }

        Ok((fired, skipped))
    }

    /// Consumes the current window of `schedule`.
    ///
    /// Returns `Some(true)` if an instance was spawned, `Some(false)` if the
    /// window was skipped for overlap, `None` if another scheduler won.
    async fn fire(&self, schedule: &RecurringSchedule, now: DateTime<Utc>) -> JobResult<Option<bool>> {
        if !schedule.allow_overlap && self.storage.unfinished_instance(schedule).await?.is_some() {
            let advanced = schedule.advanced(now, None)?;
            if !self.storage.fire_recurring(schedule.version, &advanced, None).await? {
                return Ok(None);
            }

            info!(
                recurring_id = %schedule.id,
                job_type = %schedule.job_type,
                window = %schedule.next_fire_at,
                next_fire_at = %advanced.next_fire_at,
                "Skipped recurring window, previous instance still running"
            );
            SchedulerMetrics::recurring_skipped(&schedule.id);
            return Ok(Some(false));
        }

        let instance = schedule.spawn_instance(self.registry.max_attempts_for(&schedule.job_type), now);
        let advanced = schedule.advanced(now, Some(instance.id))?;
        if !self
            .storage
            .fire_recurring(schedule.version, &advanced, Some(&instance))
            .await?
        {
            return Ok(None);
        }

        info!(
            recurring_id = %schedule.id,
            job_id = %instance.id,
            job_type = %instance.job_type,
            window = %schedule.next_fire_at,
            next_fire_at = %advanced.next_fire_at,
            "Recurring job fired"
        );
        SchedulerMetrics::recurring_fired(&schedule.id);
        JobMetrics::job_created(&instance.job_type, instance.state);
        Ok(Some(true))
    }

    /// Fails PROCESSING records whose claim is older than the orphan timeout.
    async fn recover_orphans(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let timeout = chrono::Duration::from_std(self.config.orphan_timeout)
            .map_err(|e| JobError::Configuration(format!("Invalid orphan timeout: {}", e)))?;
        let stale = self
            .storage
            .find_stale_claims(now - timeout, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for record in stale {
            if self.controller.on_orphaned(&record, now).await? != AttemptOutcome::Stale {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Runs ticks until [`SchedulerCore::stop`] is called.
    ///
    /// A failed tick is logged and delays the next one exponentially, up to
    /// `max_backoff`. A good tick resets the delay.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Scheduler already running".to_string()));
        }

        info!(
            scheduler_id = %self.id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting scheduler"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut delay = Duration::ZERO;

        while !self.shutdown_requested.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(scheduler_id = %self.id, "Received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    match self.tick(Utc::now()).await {
                        Ok(_) => {
                            delay = self.config.poll_interval;
                            if let Ok(counts) = self.storage.count_by_state().await {
                                JobMetrics::update_state_counts(&counts);
                            }
                        }
                        Err(e) => {
                            self.tick_errors.fetch_add(1, Ordering::Relaxed);
                            SchedulerMetrics::tick_failed();
                            delay = next_backoff(delay, self.config.poll_interval, self.config.max_backoff);
                            error!(
                                scheduler_id = %self.id,
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Scheduler tick failed"
                            );
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %self.id, ticks = self.ticks.load(Ordering::Relaxed), "Scheduler stopped");
        Ok(())
    }

    /// Stop the scheduler.
    pub fn stop(&self) {
        info!(scheduler_id = %self.id, "Stopping scheduler...");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        if self.shutdown_tx.send(()).is_err() {
            warn!(scheduler_id = %self.id, "Scheduler was not listening for shutdown");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            id: self.id.clone(),
            running: self.is_running(),
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_errors: self.tick_errors.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            recurring_fired: self.recurring_fired.load(Ordering::Relaxed),
            orphans_recovered: self.orphans_recovered.load(Ordering::Relaxed),
        }
    }
}

/// Doubles `current`, starting from `base` and capped at `max`.
fn next_backoff(current: Duration, base: Duration, max: Duration) -> Duration {
    current.max(base).saturating_mul(2).min(max.max(base))
}
