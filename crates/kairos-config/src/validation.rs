//! Configuration validation.
//!
//! Runs once after loading so a bad value stops the process at startup
//! instead of surfacing as a stalled scheduler later.

use crate::{AppConfig, BackoffKind, StorageBackend};
use std::fmt;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Port number is invalid (must be 1-65535).
    InvalidPort { value: u16 },
    /// A count that must be at least one is zero.
    ZeroCount { name: String },
    /// An interval or timeout is zero.
    NonPositiveInterval { name: String },
    /// URL for the selected backend is missing or malformed.
    InvalidUrl { url_type: String, message: String },
    /// Exponential multiplier below 1.0 would shrink delays.
    InvalidMultiplier { name: String, value: f64 },
    /// Jitter factor outside 0.0 - 1.0.
    InvalidJitter { value: f64 },
    /// Initial delay greater than the maximum delay.
    DelayBoundsInverted { name: String, initial: u64, max: u64 },
    /// A job timeout that does not end before its claim would be treated as orphaned.
    TimeoutOutlivesClaim { name: String, timeout_secs: u64, orphan_timeout_secs: u64 },
    /// Log filter directive is empty.
    EmptyLogFilter,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort { value } => {
                write!(f, "Invalid server port: {} (must be 1-65535)", value)
            }
            Self::ZeroCount { name } => write!(f, "'{}' must be at least 1", name),
            Self::NonPositiveInterval { name } => {
                write!(f, "Interval '{}' must be positive", name)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidMultiplier { name, value } => {
                write!(f, "Invalid multiplier for {}: {} (must be >= 1.0)", name, value)
            }
            Self::InvalidJitter { value } => {
                write!(f, "Invalid jitter factor: {} (must be between 0.0 and 1.0)", value)
            }
            Self::DelayBoundsInverted { name, initial, max } => {
                write!(
                    f,
                    "Initial delay of {} ({} ms) exceeds its maximum ({} ms)",
                    name, initial, max
                )
            }
            Self::TimeoutOutlivesClaim {
                name,
                timeout_secs,
                orphan_timeout_secs,
            } => {
                write!(
                    f,
                    "Timeout '{}' ({}s) must be shorter than scheduler.orphan_timeout_secs ({}s)",
                    name, timeout_secs, orphan_timeout_secs
                )
            }
            Self::EmptyLogFilter => write!(f, "Log filter cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the entire application configuration.
    ///
    /// Returns every problem found, not only the first.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_server(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_scheduler(config, &mut errors);
        Self::validate_worker(config, &mut errors);
        Self::validate_retry(config, &mut errors);

        if config.logging.filter.trim().is_empty() {
            errors.push(ConfigValidationError::EmptyLogFilter);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.server.port == 0 {
            errors.push(ConfigValidationError::InvalidPort { value: 0 });
        }
    }

    fn validate_storage(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let storage = &config.storage;
        match storage.backend {
            StorageBackend::Memory => {}
            StorageBackend::Redis => {
                let url = &storage.redis.url;
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    errors.push(ConfigValidationError::InvalidUrl {
                        url_type: "redis".to_string(),
                        message: "URL must start with redis:// or rediss://".to_string(),
                    });
                }
                if storage.redis.pool_size == 0 {
                    errors.push(ConfigValidationError::ZeroCount {
                        name: "storage.redis.pool_size".to_string(),
                    });
                }
            }
            StorageBackend::Sqlite => {
                if !storage.sqlite.url.starts_with("sqlite:") {
                    errors.push(ConfigValidationError::InvalidUrl {
                        url_type: "sqlite".to_string(),
                        message: "URL must start with sqlite:".to_string(),
                    });
                }
                if storage.sqlite.max_connections == 0 {
                    errors.push(ConfigValidationError::ZeroCount {
                        name: "storage.sqlite.max_connections".to_string(),
                    });
                }
            }
        }

        if storage.transient_retry.max_attempts == 0 {
            errors.push(ConfigValidationError::ZeroCount {
                name: "storage.transient_retry.max_attempts".to_string(),
            });
        }
    }

    fn validate_scheduler(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let scheduler = &config.scheduler;
        if scheduler.poll_interval_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveInterval {
                name: "scheduler.poll_interval_ms".to_string(),
            });
        }
        if scheduler.batch_size == 0 {
            errors.push(ConfigValidationError::ZeroCount {
                name: "scheduler.batch_size".to_string(),
            });
        }
        if scheduler.orphan_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveInterval {
                name: "scheduler.orphan_timeout_secs".to_string(),
            });
        }
    }

    fn validate_worker(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let worker = &config.worker;
        if worker.concurrency == 0 {
            errors.push(ConfigValidationError::ZeroCount {
                name: "worker.concurrency".to_string(),
            });
        }
        if worker.poll_interval_ms == 0 {
            errors.push(ConfigValidationError::NonPositiveInterval {
                name: "worker.poll_interval_ms".to_string(),
            });
        }
        if worker.job_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveInterval {
                name: "worker.job_timeout_secs".to_string(),
            });
        }
        Self::check_claim_outlives("worker.job_timeout_secs", worker.job_timeout_secs, config, errors);
    }

    /// A running attempt must time out before orphan recovery may reclaim it.
    fn check_claim_outlives(
        name: &str,
        timeout_secs: u64,
        config: &AppConfig,
        errors: &mut Vec<ConfigValidationError>,
    ) {
        let orphan_timeout_secs = config.scheduler.orphan_timeout_secs;
        if orphan_timeout_secs > 0 && timeout_secs >= orphan_timeout_secs {
            errors.push(ConfigValidationError::TimeoutOutlivesClaim {
                name: name.to_string(),
                timeout_secs,
                orphan_timeout_secs,
            });
        }
    }

    fn validate_retry(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let retry = &config.retry;
        if retry.max_attempts == 0 {
            errors.push(ConfigValidationError::ZeroCount {
                name: "retry.max_attempts".to_string(),
            });
        }
        if retry.strategy == BackoffKind::Exponential && retry.multiplier < 1.0 {
            errors.push(ConfigValidationError::InvalidMultiplier {
                name: "retry".to_string(),
                value: retry.multiplier,
            });
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            errors.push(ConfigValidationError::InvalidJitter {
                value: retry.jitter_factor,
            });
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            errors.push(ConfigValidationError::DelayBoundsInverted {
                name: "retry".to_string(),
                initial: retry.initial_delay_ms,
                max: retry.max_delay_ms,
            });
        }

        for (job_type, overrides) in &config.job_types {
            if overrides.max_attempts == Some(0) {
                errors.push(ConfigValidationError::ZeroCount {
                    name: format!("job_types.{}.max_attempts", job_type),
                });
            }
            if let Some(timeout_secs) = overrides.timeout_secs {
                let name = format!("job_types.{}.timeout_secs", job_type);
                if timeout_secs == 0 {
                    errors.push(ConfigValidationError::NonPositiveInterval { name });
                } else {
                    Self::check_claim_outlives(&name, timeout_secs, config, errors);
                }
            }
            if let Some(multiplier) = overrides.multiplier {
                if multiplier < 1.0 {
                    errors.push(ConfigValidationError::InvalidMultiplier {
                        name: format!("job_types.{}", job_type),
                        value: multiplier,
                    });
                }
            }
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
