//! # Structured Logging Module
//!
//! Environment-aware structured logging for the engine. Console output by default,
//! JSON lines when `STEPWISE_LOG_FORMAT=json` or the logging config asks for it.

use crate::config::{LogFormat, LoggingConfig};
use crate::constants::ENVIRONMENT_VAR;
use crate::state_machine::ExecutionStatus;
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging from the environment alone
pub fn init_structured_logging() {
    init_with_config(&LoggingConfig::default());
}

/// Initialize structured logging; later calls are no-ops
pub fn init_with_config(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = build_filter(config, &environment);
        let format = resolve_format(config);

        let layer = match format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(environment != "production")
                .boxed(),
        };

        // try_init: an embedding application may already own the global subscriber
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?format,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var(ENVIRONMENT_VAR)
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn build_filter(config: &LoggingConfig, environment: &str) -> EnvFilter {
    if let Some(level) = &config.level {
        if let Ok(filter) = EnvFilter::try_new(level) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(get_log_level(environment)))
}

fn resolve_format(config: &LoggingConfig) -> LogFormat {
    match std::env::var("STEPWISE_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("pretty") => LogFormat::Pretty,
        _ => config.format,
    }
}

/// Log structured data for instance lifecycle operations
pub fn log_instance_operation(
    operation: &str,
    instance_id: Uuid,
    state_name: &str,
    status: ExecutionStatus,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        instance_id = %instance_id,
        state = %state_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "INSTANCE_OPERATION"
    );
}

/// Log structured data for correlation token traffic
pub fn log_correlation_operation(
    operation: &str,
    token: &str,
    instance_id: Option<Uuid>,
    outcome: &str,
) {
    tracing::debug!(
        operation = %operation,
        token = %token,
        instance_id = instance_id.map(|id| id.to_string()),
        outcome = %outcome,
        timestamp = %Utc::now().to_rfc3339(),
        "CORRELATION_OPERATION"
    );
}

/// Log errors with structured context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
