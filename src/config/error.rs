//! Configuration Error Types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors with enough context to fix the offending file
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Configuration directory does not exist
    #[error("Configuration directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    /// The `config` crate failed to read or merge a source
    #[error("Failed to load configuration for environment '{environment}': {error}")]
    LoadError { environment: String, error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Workflow definition problems detected at registration
    #[error("Invalid workflow definition '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },
}

impl ConfigurationError {
    pub fn load_error<E: std::fmt::Display>(environment: &str, error: E) -> Self {
        Self::LoadError {
            environment: environment.to_string(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field(field: &str, context: &str) -> Self {
        Self::MissingRequiredField {
            field: field.to_string(),
            context: context.to_string(),
        }
    }

    pub fn invalid_value(field: &str, value: impl ToString, context: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            context: context.to_string(),
        }
    }

    pub fn invalid_workflow(workflow: &str, reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            workflow: workflow.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
