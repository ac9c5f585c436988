//! Configuration loader with layered sources.

use crate::{format_validation_errors, AppConfig, ConfigValidator};
use config::{Config, ConfigError, Environment, File};
use kairos_core::KairosError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable selecting the `{env}.toml` layer.
pub const ENVIRONMENT_VAR: &str = "KAIROS_ENVIRONMENT";

/// Configuration loader with runtime refresh support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Sources are layered in order, later ones winning:
    /// 1. `{dir}/default.toml`
    /// 2. `{dir}/{KAIROS_ENVIRONMENT}.toml` (defaults to `development`)
    /// 3. `{dir}/local.toml`
    /// 4. Environment variables, e.g. `KAIROS__WORKER__CONCURRENCY=8`
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self, KairosError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, KairosError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk.
    ///
    /// The previous configuration stays in place if the new one is invalid.
    pub async fn reload(&self) -> Result<(), KairosError> {
        let new_config = Self::load_config(&self.config_dir)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded");
        Ok(())
    }

    /// Gets a specific configuration value by dotted key path.
    pub async fn get_value<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let config = self.config.read().await;
        let json = serde_json::to_value(&*config).ok()?;

        let mut current = &json;
        for part in key.split('.') {
            current = current.get(part)?;
        }

        serde_json::from_value(current.clone()).ok()
    }

    /// Builds and validates an [`AppConfig`] from `config_dir`.
    pub fn load_config(config_dir: &Path) -> Result<AppConfig, KairosError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, dir = %config_dir.display(), "Loading configuration");

        let mut builder = Config::builder();

        for layer in ["default", environment.as_str(), "local"] {
            let path = config_dir.join(format!("{}.toml", layer));
            if path.exists() {
                debug!("Loading config layer: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("KAIROS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut app_config: AppConfig = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(config_error_to_kairos_error)?;

        if std::env::var(ENVIRONMENT_VAR).is_ok() {
            app_config.app.environment = environment;
        }

        ConfigValidator::validate(&app_config)
            .map_err(|errors| KairosError::Configuration(format_validation_errors(&errors)))?;

        Ok(app_config)
    }
}

fn config_error_to_kairos_error(err: ConfigError) -> KairosError {
    KairosError::Configuration(err.to_string())
}
