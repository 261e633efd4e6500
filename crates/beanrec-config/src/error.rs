//! Error types for beanrec-config

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigErrorCode {
    /// Configuration file could not be read
    IoError,
    /// Configuration file is not valid YAML
    InvalidYaml,
    /// A field has an invalid value
    InvalidValue,
    /// A field holds an invalid regular expression
    InvalidPattern,
}

impl std::fmt::Display for ConfigErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigErrorCode::IoError => write!(f, "IO_ERROR"),
            ConfigErrorCode::InvalidYaml => write!(f, "INVALID_YAML"),
            ConfigErrorCode::InvalidValue => write!(f, "INVALID_VALUE"),
            ConfigErrorCode::InvalidPattern => write!(f, "INVALID_PATTERN"),
        }
    }
}

/// Main error type for beanrec-config
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    IoError { path: String },

    #[error("Invalid YAML: {message}")]
    InvalidYaml { message: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid pattern for {field}: {pattern}")]
    InvalidPattern { field: String, pattern: String },
}

impl ConfigError {
    /// Get the error code
    pub fn code(&self) -> ConfigErrorCode {
        match self {
            ConfigError::IoError { .. } => ConfigErrorCode::IoError,
            ConfigError::InvalidYaml { .. } => ConfigErrorCode::InvalidYaml,
            ConfigError::InvalidValue { .. } => ConfigErrorCode::InvalidValue,
            ConfigError::InvalidPattern { .. } => ConfigErrorCode::InvalidPattern,
        }
    }
}
