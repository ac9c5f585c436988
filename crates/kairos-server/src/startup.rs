//! Server startup utilities.

use kairos_config::AppConfig;
use kairos_jobs::{JobRegistry, RetryPolicy};
use std::time::Duration;
use tracing::info;

/// Builds an empty registry whose defaults come from configuration.
///
/// Per-type overrides in `job_types` apply to every later registration, and
/// any registration whose timeout reaches the orphan timeout is rejected.
pub fn build_registry(config: &AppConfig) -> JobRegistry {
    JobRegistry::new()
        .with_default_policy(RetryPolicy::from(&config.retry))
        .with_default_timeout(Duration::from_secs(config.worker.job_timeout_secs))
        .with_overrides(config.job_types.clone())
        .with_claim_timeout(config.scheduler.orphan_timeout())
}

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __        _
   / /_____ _(_)________  _____
  / //_/ __ `/ / ___/ __ \/ ___/
 / ,< / /_/ / / /  / /_/ (__  )
/_/|_|\__,_/_/_/   \____/____/
    "#);
}

/// Prints server startup information.
pub fn print_startup_info(addr: &str, backend: &str) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("HTTP API:  http://{}/api/v1/jobs", addr);
    info!("Demo:      http://{}/jobs/cases", addr);
    info!("Health:    http://{}/health", addr);
    info!("Storage:   {}", backend);
    info!("{}", separator);
}
