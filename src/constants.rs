//! # System Constants
//!
//! Event names, default timeouts and fixed values that bound the engine's behavior.
//! Every default here can be overridden through [`crate::config::EngineConfig`].

/// Lifecycle event names published through [`crate::events::EventPublisher`]
pub mod events {
    pub const INSTANCE_TRANSITIONED: &str = "instance.transitioned";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
}

/// Default state timeouts, in milliseconds
pub mod timeouts {
    /// Leaf cloud operations: resize, listener update, host commands
    pub const DEFAULT_LEAF_TIMEOUT_MS: u64 = 10 * 60 * 1000;
    /// Poll-until-steady checks
    pub const DEFAULT_STEADY_STATE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
    /// Sub-workflow and fork containment
    pub const DEFAULT_CONTAINMENT_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;
    /// Upper bound on a state's abort handler
    pub const DEFAULT_ABORT_HANDLER_TIMEOUT_MS: u64 = 30 * 1000;
}

/// Traffic weight bounds for listener updates
pub mod traffic {
    pub const MIN_WEIGHT: u32 = 0;
    pub const MAX_WEIGHT: u32 = 100;
}

/// Sweeping output name of the rollback-all-phases marker
pub const ROLLBACK_COMPLETED_MARKER: &str = "rollback_all_phases_completed";

/// Separator between a fork parent id and the child index in correlation tokens
pub const FORK_TOKEN_SEPARATOR: char = ':';

/// Environment variable selecting the configuration environment
pub const ENVIRONMENT_VAR: &str = "STEPWISE_ENV";

/// Prefix for configuration overrides from the environment, e.g. `STEPWISE__ORCHESTRATOR__MAX_TRANSIENT_REQUEUES`
pub const CONFIG_ENV_PREFIX: &str = "STEPWISE";

/// Render a duration the way execution logs show it: `7d`, `10m`, `1h 30m`, `45s`
pub fn humanize_duration(duration: std::time::Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let parts: Vec<String> = [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    parts.join(" ")
}
