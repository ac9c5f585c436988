//! Retry policies for failed jobs and for transient storage errors.

use crate::error::JobResult;
use kairos_config::{BackoffKind, JobTypeConfig, RetryConfig, TransientRetryConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff.
    Exponential,
    /// Linear backoff.
    Linear,
}

impl From<BackoffKind> for RetryStrategy {
    fn from(kind: BackoffKind) -> Self {
        match kind {
            BackoffKind::None => RetryStrategy::None,
            BackoffKind::Fixed => RetryStrategy::Fixed,
            BackoffKind::Linear => RetryStrategy::Linear,
            BackoffKind::Exponential => RetryStrategy::Exponential,
        }
    }
}

/// Per job type retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,

    /// Maximum attempts, including the first run.
    pub max_attempts: u32,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (exponential only).
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Creates a policy that runs the job once.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            initial_delay_ms: 1_000,
            max_delay_ms: 3_600_000, // 1 hour
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(max_attempts: u32, increment_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            max_attempts,
            initial_delay_ms: increment_ms,
            max_delay_ms: increment_ms.saturating_mul(u64::from(max_attempts.max(1))),
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_millis(delay);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_millis(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter factor.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Applies a `[job_types.<name>]` override on top of this policy.
    pub fn with_overrides(mut self, overrides: &JobTypeConfig) -> Self {
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy.into();
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(initial) = overrides.initial_delay_ms {
            self.initial_delay_ms = initial;
        }
        if let Some(max) = overrides.max_delay_ms {
            self.max_delay_ms = max;
        }
        if let Some(multiplier) = overrides.multiplier {
            self.multiplier = multiplier;
        }
        self
    }

    /// Returns true if a job that has started `attempt_count` attempts may
    /// run again.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        self.strategy != RetryStrategy::None && attempt_count < self.max_attempts
    }

    /// Calculate delay before the retry that follows failed attempt `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.strategy == RetryStrategy::None {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
                if delay.is_finite() && delay < u64::MAX as f64 {
                    delay as u64
                } else {
                    u64::MAX
                }
            }
            RetryStrategy::Linear => self.initial_delay_ms.saturating_mul(u64::from(attempt)),
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            if jitter_range == 0 {
                capped_delay
            } else {
                let jitter = rand::thread_rng().gen_range(0..=jitter_range);
                capped_delay
                    .saturating_add(jitter)
                    .saturating_sub(jitter_range / 2)
            }
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy.into(),
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Retry loop for storage calls.
///
/// Only errors that are [`crate::JobError::is_transient`] are retried; every
/// other error returns immediately.
#[derive(Debug, Clone)]
pub struct TransientRetry {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self::from(&TransientRetryConfig::default())
    }
}

impl From<&TransientRetryConfig> for TransientRetry {
    fn from(config: &TransientRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl TransientRetry {
    /// Never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `f`, repeating it while it fails with a transient error.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> JobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JobResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(operation, attempt, ?delay, error = %e, "Transient storage error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(operation, attempts = attempt, error = %e, "Storage retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
