//! Application configuration structures.

use kairos_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Job storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Scheduler core loop.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worker pool.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Default retry policy for job types without an override.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per job type overrides, keyed by job type name.
    #[serde(default)]
    pub job_types: HashMap<String, JobTypeConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "kairos".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable CORS.
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// CORS allowed origins.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

impl ServerConfig {
    /// Returns the socket address string to bind.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Which storage engine backs the job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local maps. Nothing survives a restart.
    #[default]
    Memory,
    /// Redis hashes and sorted sets.
    Redis,
    /// SQLite through sqlx.
    Sqlite,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selected backend.
    #[serde(default)]
    pub backend: StorageBackend,

    /// Redis backend settings.
    #[serde(default)]
    pub redis: RedisStorageConfig,

    /// SQLite backend settings.
    #[serde(default)]
    pub sqlite: SqliteStorageConfig,

    /// Retries applied to transient storage failures.
    #[serde(default)]
    pub transient_retry: TransientRetryConfig,
}

/// Redis backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStorageConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Connection pool size.
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    /// Key prefix for every key the backend writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "kairos".to_string()
}

/// SQLite backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStorageConfig {
    /// Connection URL, e.g. `sqlite://kairos.db?mode=rwc`.
    #[serde(default = "default_sqlite_url")]
    pub url: String,
    /// Maximum pool connections.
    #[serde(default = "default_sqlite_max_connections")]
    pub max_connections: u32,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            url: default_sqlite_url(),
            max_connections: default_sqlite_max_connections(),
        }
    }
}

fn default_sqlite_url() -> String {
    "sqlite://kairos.db?mode=rwc".to_string()
}

fn default_sqlite_max_connections() -> u32 {
    5
}

/// Retry settings for storage calls that fail with a transient error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientRetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_transient_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_transient_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound on a single delay in milliseconds.
    #[serde(default = "default_transient_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for TransientRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_transient_attempts(),
            initial_delay_ms: default_transient_delay(),
            max_delay_ms: default_transient_max_delay(),
        }
    }
}

fn default_transient_attempts() -> u32 {
    3
}

fn default_transient_delay() -> u64 {
    50
}

fn default_transient_max_delay() -> u64 {
    1_000
}

/// Scheduler core loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run the scheduler loop in this process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between ticks in milliseconds.
    #[serde(default = "default_scheduler_poll")]
    pub poll_interval_ms: u64,
    /// Maximum records promoted per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// A PROCESSING record claimed longer ago than this is an orphan.
    #[serde(default = "default_orphan_timeout")]
    pub orphan_timeout_secs: u64,
    /// Cap on the error backoff between failing ticks in milliseconds.
    #[serde(default = "default_scheduler_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_scheduler_poll(),
            batch_size: default_batch_size(),
            orphan_timeout_secs: default_orphan_timeout(),
            max_backoff_ms: default_scheduler_max_backoff(),
        }
    }
}

impl SchedulerConfig {
    /// Returns the tick interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the orphan timeout as a Duration.
    #[must_use]
    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }
}

fn default_scheduler_poll() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    100
}

fn default_orphan_timeout() -> u64 {
    900 // 15 minutes
}

fn default_scheduler_max_backoff() -> u64 {
    30_000
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Run executors in this process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Worker identity prefix. A random one is generated when absent.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Number of executors.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Base polling interval of each executor in milliseconds.
    #[serde(default = "default_worker_poll")]
    pub poll_interval_ms: u64,
    /// Random extra delay added to each poll, up to this many milliseconds.
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter_ms: u64,
    /// Handler timeout in seconds for types without an override.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// How long shutdown waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Abort the handler task on timeout instead of detaching it.
    #[serde(default)]
    pub abort_on_timeout: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_worker_poll(),
            poll_jitter_ms: default_poll_jitter(),
            job_timeout_secs: default_job_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            abort_on_timeout: false,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .max(4)
}

fn default_worker_poll() -> u64 {
    500
}

fn default_poll_jitter() -> u64 {
    250
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Backoff strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Never retry.
    None,
    /// Constant delay.
    Fixed,
    /// Delay grows by `initial_delay` per attempt.
    Linear,
    /// Delay multiplies by `multiplier` per attempt.
    #[default]
    Exponential,
}

/// Default retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    #[serde(default)]
    pub strategy: BackoffKind,
    /// Maximum attempts, including the first run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Exponential multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0 - 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::default(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    3_600_000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Per job type override. Unset fields fall back to the registered
/// definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTypeConfig {
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub strategy: Option<BackoffKind>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}
