//! # Engine Configuration
//!
//! Typed configuration for the engine, loaded from TOML with environment overrides.
//!
//! ## Layout
//!
//! - `config/stepwise.toml`: base values
//! - `config/stepwise.<env>.toml`: per-environment overrides (`STEPWISE_ENV`, default `development`)
//! - `STEPWISE__<SECTION>__<KEY>` environment variables: final overrides
//!
//! Every section has defaults, so a missing file or key falls back to them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stepwise_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let leaf_timeout = manager.config().timeouts.leaf();
//! let requeues = manager.config().orchestrator.max_transient_requeues;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::timeouts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// How a container state combines its children's terminal statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// First non-SUCCESS status in delivery order
    #[default]
    FirstFailure,
    /// Most severe status, independent of arrival order
    WorstOf,
}

/// Default timeouts per state family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub leaf_ms: u64,
    pub steady_state_ms: u64,
    pub containment_ms: u64,
    pub abort_handler_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            leaf_ms: timeouts::DEFAULT_LEAF_TIMEOUT_MS,
            steady_state_ms: timeouts::DEFAULT_STEADY_STATE_TIMEOUT_MS,
            containment_ms: timeouts::DEFAULT_CONTAINMENT_TIMEOUT_MS,
            abort_handler_ms: timeouts::DEFAULT_ABORT_HANDLER_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn leaf(&self) -> Duration {
        Duration::from_millis(self.leaf_ms)
    }

    pub fn steady_state(&self) -> Duration {
        Duration::from_millis(self.steady_state_ms)
    }

    pub fn containment(&self) -> Duration {
        Duration::from_millis(self.containment_ms)
    }

    pub fn abort_handler(&self) -> Duration {
        Duration::from_millis(self.abort_handler_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub convergence_policy: ConvergencePolicy,
    /// Times a state may re-queue a request that failed transiently
    pub max_transient_requeues: u32,
    pub event_channel_capacity: usize,
    /// How long consumed tokens are remembered for duplicate detection
    pub consumed_token_retention_secs: u64,
    /// How often retired tokens past their retention are swept
    pub token_sweep_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            convergence_policy: ConvergencePolicy::FirstFailure,
            max_transient_requeues: 2,
            event_channel_capacity: 1000,
            consumed_token_retention_secs: 24 * 60 * 60,
            token_sweep_interval_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub channel_capacity: usize,
    pub enqueue_timeout_ms: u64,
    /// Queued tasks kept for inspection; 0 disables the history
    pub history_limit: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            enqueue_timeout_ms: 5_000,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; falls back to `RUST_LOG`, then the environment default
    pub level: Option<String>,
    pub format: LogFormat,
}

/// Postgres connection used by the persistent stores
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/stepwise_development".to_string(),
            max_connections: 10,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &sanitize_url(&self.url))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Mask the password component of a connection URL
pub fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &credentials[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// Root configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub orchestrator: OrchestratorConfig,
    pub dispatcher: DispatcherConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let timeouts = [
            ("timeouts.leaf_ms", self.timeouts.leaf_ms),
            ("timeouts.steady_state_ms", self.timeouts.steady_state_ms),
            ("timeouts.containment_ms", self.timeouts.containment_ms),
            ("timeouts.abort_handler_ms", self.timeouts.abort_handler_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "timeout must be greater than 0",
                ));
            }
        }

        if self.dispatcher.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.channel_capacity",
                0,
                "channel capacity must be greater than 0",
            ));
        }

        if self.dispatcher.enqueue_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.enqueue_timeout_ms",
                0,
                "enqueue timeout must be greater than 0",
            ));
        }

        if self.orchestrator.event_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestrator.event_channel_capacity",
                0,
                "event channel capacity must be greater than 0",
            ));
        }

        if self.orchestrator.token_sweep_interval_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestrator.token_sweep_interval_secs",
                0,
                "sweep interval must be greater than 0",
            ));
        }

        if self.database.url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "database.url",
                "database configuration",
            ));
        }

        Ok(())
    }
}
