//! Kairos Jobs - Persistent Background Job Scheduler
//!
//! Durable job records with at-least-once execution:
//! - Immediate, delayed and cron-driven recurring jobs
//! - Pluggable storage (in-memory, Redis, SQLite) with compare-and-swap claims
//! - Polling scheduler that promotes due jobs and recovers orphaned claims
//! - Worker pool with per-type timeouts and retry policies
//! - Exponential, linear or fixed backoff with jitter
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                                                               │
//! │  JobClient ──enqueue/schedule/register_recurring──┐           │
//! │                                                   ▼           │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │                      JobStorage                         │  │
//! │  │   job records (state, scheduled_at, version)            │  │
//! │  │   recurring schedules (cron, next_fire_at, version)     │  │
//! │  └───────▲──────────────────────────────────▲──────────────┘  │
//! │          │ promote / fire / recover         │ claim / report  │
//! │  ┌───────┴────────┐                 ┌───────┴──────────────┐  │
//! │  │ SchedulerCore  │                 │      WorkerPool      │  │
//! │  │  (tick loop)   │                 │ executor 1..N        │  │
//! │  └────────────────┘                 │  └─ RetryController  │  │
//! │                                     └──────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kairos_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmailJob {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmailJob {
//!     const NAME: &'static str = "send-email";
//!     const MAX_ATTEMPTS: u32 = 5;
//!
//!     async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
//!         tracing::info!(attempt = ctx.attempt, to = %self.to, "sending");
//!         Ok(())
//!     }
//! }
//!
//! let registry = Arc::new(JobRegistry::new());
//! registry.register_job::<SendEmailJob>()?;
//!
//! let server = JobServer::new(storage, registry, JobServerConfig::default());
//! server.start().await?;
//! server.client().enqueue_job(&SendEmailJob { to: "user@example.com".into() }).await?;
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod metrics;
pub mod recurring;
pub mod registry;
pub mod retry;
pub mod retry_controller;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worker;

pub use client::{JobClient, JobStats};
pub use error::{JobError, JobResult};
pub use job::{Job, JobContext, JobId, JobRecord, JobState};
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use recurring::{next_occurrence, parse_cron, RecurringSchedule};
pub use registry::{JobDefinition, JobHandler, JobRegistry, RecurringSpec};
pub use retry::{RetryPolicy, RetryStrategy, TransientRetry};
pub use retry_controller::{AttemptOutcome, RetryController};
pub use scheduler::{SchedulerCore, SchedulerCoreConfig, SchedulerStats, TickReport};
pub use server::{JobServer, JobServerConfig};
pub use storage::{connect, JobStorage, MemoryStorage, RedisStorage, SqlStorage};
pub use worker::{ProcessedJob, WorkerPool, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::client::JobClient;
    pub use crate::job::{Job, JobState};
    pub use crate::registry::{JobDefinition, JobRegistry};
    pub use crate::retry::RetryPolicy;
    pub use crate::server::{JobServer, JobServerConfig};
    pub use crate::storage::JobStorage;
    pub use crate::{JobContext, JobError, JobId, JobResult};
}
