//! Job definition registry: job type name to handler and metadata.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use crate::recurring::parse_cron;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use kairos_config::JobTypeConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Executable handler for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one attempt with the record's payload.
    async fn handle(&self, payload: serde_json::Value, ctx: JobContext) -> Result<(), JobError>;
}

/// Adapts a typed [`Job`] into a [`JobHandler`].
struct TypedHandler<J>(PhantomData<fn() -> J>);

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, payload: serde_json::Value, ctx: JobContext) -> Result<(), JobError> {
        let job: J = serde_json::from_value(payload)?;
        job.execute(ctx).await
    }
}

/// Adapts an async closure into a [`JobHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value, ctx: JobContext) -> Result<(), JobError> {
        (self.0)(payload, ctx).await
    }
}

/// Recurring schedule declared alongside a job definition.
#[derive(Debug, Clone)]
pub struct RecurringSpec {
    pub id: String,
    pub cron_expression: String,
    pub payload: serde_json::Value,
    pub allow_overlap: bool,
}

/// Handler plus metadata for one job type.
#[derive(Clone)]
pub struct JobDefinition {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
    pub recurring: Option<RecurringSpec>,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("recurring", &self.recurring)
            .finish()
    }
}

impl JobDefinition {
    /// Creates a definition with the default policy and timeout.
    pub fn new(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            retry_policy: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
            recurring: None,
        }
    }

    /// Creates a definition for a typed job.
    pub fn for_job<J: Job>() -> Self {
        Self {
            name: J::NAME.to_string(),
            handler: Arc::new(TypedHandler::<J>(PhantomData)),
            retry_policy: J::retry_policy(),
            timeout: J::timeout(),
            recurring: None,
        }
    }

    /// Creates a definition from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnHandler(f)))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declares a recurring schedule registered when the job server starts.
    pub fn with_recurring(
        mut self,
        id: impl Into<String>,
        cron_expression: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        self.recurring = Some(RecurringSpec {
            id: id.into(),
            cron_expression: cron_expression.into(),
            payload,
            allow_overlap: false,
        });
        self
    }
}

/// Registry of job definitions keyed by job type name.
///
/// Lookups of unregistered names return `None`; callers fail closed.
pub struct JobRegistry {
    definitions: RwLock<HashMap<String, JobDefinition>>,
    default_policy: RetryPolicy,
    default_timeout: Duration,
    overrides: HashMap<String, JobTypeConfig>,
    claim_timeout: Option<Duration>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            default_policy: RetryPolicy::default(),
            default_timeout: Duration::from_secs(300),
            overrides: HashMap::new(),
            claim_timeout: None,
        }
    }

    /// Policy applied to job types without a definition.
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Timeout applied to job types without their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Per-type overrides applied on top of every later registration.
    pub fn with_overrides(mut self, overrides: HashMap<String, JobTypeConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Rejects later registrations whose timeout is not shorter than
    /// `claim_timeout`, the age at which a claim counts as orphaned.
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = Some(claim_timeout);
        self
    }

    /// Fails if any registered type could still be running when its claim
    /// reaches `claim_timeout`.
    pub fn check_claim_timeout(&self, claim_timeout: Duration) -> JobResult<()> {
        let definitions = self.definitions.read();
        let mut names: Vec<&String> = definitions.keys().collect();
        names.sort();
        for name in names {
            ensure_within_claim(name, definitions[name].timeout, claim_timeout)?;
        }
        Ok(())
    }

    /// Registers a definition, replacing any previous one with the same name.
    pub fn register(&self, mut definition: JobDefinition) -> JobResult<()> {
        if definition.name.trim().is_empty() {
            return Err(JobError::Configuration("Job type name cannot be empty".to_string()));
        }
        if let Some(spec) = &definition.recurring {
            parse_cron(&spec.cron_expression)?;
        }

        if let Some(overrides) = self.overrides.get(&definition.name) {
            definition.retry_policy = definition.retry_policy.with_overrides(overrides);
            if let Some(secs) = overrides.timeout_secs {
                definition.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(claim_timeout) = self.claim_timeout {
            ensure_within_claim(&definition.name, definition.timeout, claim_timeout)?;
        }

        info!(
            job_type = %definition.name,
            max_attempts = definition.retry_policy.max_attempts,
            timeout_secs = definition.timeout.as_secs(),
            "Registered job type"
        );

        let name = definition.name.clone();
        if self.definitions.write().insert(name.clone(), definition).is_some() {
            warn!(job_type = %name, "Replaced existing job definition");
        }
        Ok(())
    }

    /// Registers a typed job.
    pub fn register_job<J: Job>(&self) -> JobResult<()> {
        self.register(JobDefinition::for_job::<J>())
    }

    /// Registers an async closure under `name` with the default policy.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> JobResult<()>
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let definition = JobDefinition::from_fn(name, f)
            .with_retry_policy(self.default_policy.clone())
            .with_timeout(self.default_timeout);
        self.register(definition)
    }

    /// Returns the definition for `name`.
    pub fn get(&self, name: &str) -> Option<JobDefinition> {
        self.definitions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    /// Retry policy for `name`, falling back to the default.
    pub fn retry_policy_for(&self, name: &str) -> RetryPolicy {
        self.definitions
            .read()
            .get(name)
            .map_or_else(|| self.default_policy.clone(), |d| d.retry_policy.clone())
    }

    /// Attempts recorded on new records of type `name`.
    pub fn max_attempts_for(&self, name: &str) -> u32 {
        self.retry_policy_for(name).max_attempts.max(1)
    }

    /// Timeout for `name`, falling back to the default.
    pub fn timeout_for(&self, name: &str) -> Duration {
        self.definitions
            .read()
            .get(name)
            .map_or(self.default_timeout, |d| d.timeout)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Recurring schedules declared by registered definitions.
    pub fn recurring_specs(&self) -> Vec<(String, RecurringSpec)> {
        self.definitions
            .read()
            .values()
            .filter_map(|d| d.recurring.clone().map(|spec| (d.name.clone(), spec)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}

fn ensure_within_claim(name: &str, timeout: Duration, claim_timeout: Duration) -> JobResult<()> {
    if timeout >= claim_timeout {
        return Err(JobError::Configuration(format!(
            "Timeout of job type '{}' ({}s) must be shorter than the orphan timeout ({}s)",
            name,
            timeout.as_secs(),
            claim_timeout.as_secs()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    #[async_trait]
    impl Job for Greet {
        const NAME: &'static str = "greet";
        const MAX_ATTEMPTS: u32 = 5;
        const TIMEOUT_SECS: u64 = 10;

        async fn execute(&self, _ctx: JobContext) -> Result<(), JobError> {
            if self.name.is_empty() {
                return Err(JobError::handler("empty name"));
            }
            Ok(())
        }
    }

    async fn noop(_payload: serde_json::Value, _ctx: JobContext) -> Result<(), JobError> {
        Ok(())
    }

    fn context() -> JobContext {
        crate::job::JobRecord::enqueued("greet", serde_json::Value::Null, 1, Utc::now())
            .to_context("worker-test", Utc::now())
    }

    #[test]
    fn test_register_typed_job() {
        let registry = JobRegistry::new();
        registry.register_job::<Greet>().unwrap();

        let definition = registry.get("greet").unwrap();
        assert_eq!(definition.retry_policy.max_attempts, 5);
        assert_eq!(definition.timeout, Duration::from_secs(10));
        assert_eq!(registry.max_attempts_for("greet"), 5);
    }

    #[tokio::test]
    async fn test_typed_handler_deserializes_payload() {
        let registry = JobRegistry::new();
        registry.register_job::<Greet>().unwrap();
        let handler = registry.get("greet").unwrap().handler;

        assert!(handler.handle(serde_json::json!({"name": "kairos"}), context()).await.is_ok());
        assert!(matches!(
            handler.handle(serde_json::json!({"name": ""}), context()).await,
            Err(JobError::HandlerFailure(_))
        ));
        assert!(matches!(
            handler.handle(serde_json::json!({"wrong": 1}), context()).await,
            Err(JobError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_register_fn() {
        let registry = JobRegistry::new().with_default_policy(RetryPolicy::fixed(2, 100));
        registry
            .register_fn("noop", noop)
            .unwrap();

        let definition = registry.get("noop").unwrap();
        assert_eq!(definition.retry_policy, RetryPolicy::fixed(2, 100));
        assert!(definition.handler.handle(serde_json::Value::Null, context()).await.is_ok());
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let registry = JobRegistry::new().with_default_policy(RetryPolicy::fixed(4, 10));
        assert!(registry.get("mystery").is_none());
        assert_eq!(registry.max_attempts_for("mystery"), 4);
    }

    #[test]
    fn test_config_overrides_apply() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "greet".to_string(),
            JobTypeConfig {
                max_attempts: Some(2),
                timeout_secs: Some(1),
                ..Default::default()
            },
        );
        let registry = JobRegistry::new().with_overrides(overrides);
        registry.register_job::<Greet>().unwrap();

        assert_eq!(registry.max_attempts_for("greet"), 2);
        assert_eq!(registry.timeout_for("greet"), Duration::from_secs(1));
    }

    #[test]
    fn test_recurring_spec_validated() {
        let registry = JobRegistry::new();
        let bad = JobDefinition::from_fn("tick", noop)
            .with_recurring("tick", "every minute", serde_json::Value::Null);
        assert!(matches!(registry.register(bad), Err(JobError::InvalidCron { .. })));

        let good = JobDefinition::from_fn("tick", noop)
            .with_recurring("tick-recurring", "*/1 * * * *", serde_json::Value::Null);
        registry.register(good).unwrap();
        let specs = registry.recurring_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].1.id, "tick-recurring");
    }

    #[test]
    fn test_names_sorted() {
        let registry = JobRegistry::new();
        registry.register_fn("b", noop).unwrap();
        registry.register_fn("a", noop).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct NightlyExport {}

    #[async_trait]
    impl Job for NightlyExport {
        const NAME: &'static str = "nightly-export";
        const TIMEOUT_SECS: u64 = 1800;

        async fn execute(&self, _ctx: JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_timeout_longer_than_claim_rejected() {
        let registry = JobRegistry::new().with_claim_timeout(Duration::from_secs(900));
        assert!(matches!(
            registry.register_job::<NightlyExport>(),
            Err(JobError::Configuration(_))
        ));
        assert!(!registry.contains("nightly-export"));

        registry.register_job::<Greet>().unwrap();
        assert!(registry.contains("greet"));
    }

    #[test]
    fn test_claim_timeout_override_shortens_timeout() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "nightly-export".to_string(),
            JobTypeConfig {
                timeout_secs: Some(600),
                ..Default::default()
            },
        );
        let registry = JobRegistry::new()
            .with_overrides(overrides)
            .with_claim_timeout(Duration::from_secs(900));

        registry.register_job::<NightlyExport>().unwrap();
        assert_eq!(registry.timeout_for("nightly-export"), Duration::from_secs(600));
    }

    #[test]
    fn test_check_claim_timeout() {
        let registry = JobRegistry::new();
        registry.register_job::<Greet>().unwrap();
        assert!(registry.check_claim_timeout(Duration::from_secs(900)).is_ok());

        registry.register_job::<NightlyExport>().unwrap();
        let err = registry.check_claim_timeout(Duration::from_secs(900)).unwrap_err();
        assert!(err.to_string().contains("nightly-export"));
    }
}
