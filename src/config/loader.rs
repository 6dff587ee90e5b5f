//! Configuration Loader
//!
//! Environment-aware loading: base file, per-environment override, then
//! environment variables, merged by the `config` crate.

use super::error::{ConfigResult, ConfigurationError};
use super::{sanitize_url, EngineConfig};
use crate::constants::{CONFIG_ENV_PREFIX, ENVIRONMENT_VAR};
use ::config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "stepwise";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for tests that must not touch global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        if !config_directory.is_dir() {
            return Err(ConfigurationError::DirectoryNotFound {
                path: config_directory,
            });
        }

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            database_url = %sanitize_url(&config.database.url),
            convergence_policy = ?config.orchestrator.convergence_policy,
            max_transient_requeues = config.orchestrator.max_transient_requeues,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, e.g. in tests
    pub fn from_config(config: EngineConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with secrets masked
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null);
        if let Some(url) = value.pointer_mut("/database/url") {
            *url = serde_json::Value::String(sanitize_url(&self.config.database.url));
        }
        value
    }

    /// Current environment from `STEPWISE_ENV`, defaulting to development
    pub fn detect_environment() -> String {
        std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        std::env::var("STEPWISE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(directory: &Path, environment: &str) -> ConfigResult<EngineConfig> {
        let base = directory.join(format!("{BASE_FILE_STEM}.toml"));
        let overlay = directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        debug!(
            base = %base.display(),
            base_exists = base.exists(),
            overlay = %overlay.display(),
            overlay_exists = overlay.exists(),
            "Resolving configuration sources"
        );

        Config::builder()
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overlay).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|merged| merged.try_deserialize::<EngineConfig>())
            .map_err(|err| ConfigurationError::load_error(environment, err))
    }
}
