//! Error types for beanrec-core
//!
//! Fatal engine errors are `CoreError` values with programmatic codes;
//! structural problems in the journal or source data are non-fatal
//! `JournalError` diagnostics carried alongside results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Engine not loaded yet
    NotLoaded,
    /// Command referenced a stale generation
    StaleGeneration,
    /// Candidate index out of range
    CandidateNotFound,
    /// Pending entry index out of range
    PendingNotFound,
    /// Command arguments were invalid
    InvalidCommand,
    /// Ledger store failure
    StoreError,
    /// Change set no longer matches the ledger text
    StoreConflict,
    /// Source failure
    SourceError,
    /// Configuration error
    ConfigError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NotLoaded => write!(f, "NOT_LOADED"),
            ErrorCode::StaleGeneration => write!(f, "STALE_GENERATION"),
            ErrorCode::CandidateNotFound => write!(f, "CANDIDATE_NOT_FOUND"),
            ErrorCode::PendingNotFound => write!(f, "PENDING_NOT_FOUND"),
            ErrorCode::InvalidCommand => write!(f, "INVALID_COMMAND"),
            ErrorCode::StoreError => write!(f, "STORE_ERROR"),
            ErrorCode::StoreConflict => write!(f, "STORE_CONFLICT"),
            ErrorCode::SourceError => write!(f, "SOURCE_ERROR"),
            ErrorCode::ConfigError => write!(f, "CONFIG_ERROR"),
        }
    }
}

/// Main error type for beanrec-core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Engine not loaded")]
    NotLoaded,

    #[error("Stale generation {actual}, current is {expected}")]
    StaleGeneration { expected: u64, actual: u64 },

    #[error("Candidate not found: {index}")]
    CandidateNotFound { index: usize },

    #[error("Pending entry not found: {index}")]
    PendingNotFound { index: usize },

    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    #[error("Ledger store error: {message}")]
    StoreError { message: String },

    #[error("Change conflicts with ledger text at {file}:{line}")]
    StoreConflict { file: String, line: usize },

    #[error("Source {source_name} failed: {message}")]
    SourceError { source_name: String, message: String },

    #[error(transparent)]
    ConfigError(#[from] beanrec_config::ConfigError),
}

impl CoreError {
    /// Get the error code
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotLoaded => ErrorCode::NotLoaded,
            CoreError::StaleGeneration { .. } => ErrorCode::StaleGeneration,
            CoreError::CandidateNotFound { .. } => ErrorCode::CandidateNotFound,
            CoreError::PendingNotFound { .. } => ErrorCode::PendingNotFound,
            CoreError::InvalidCommand { .. } => ErrorCode::InvalidCommand,
            CoreError::StoreError { .. } => ErrorCode::StoreError,
            CoreError::StoreConflict { .. } => ErrorCode::StoreConflict,
            CoreError::SourceError { .. } => ErrorCode::SourceError,
            CoreError::ConfigError(_) => ErrorCode::ConfigError,
        }
    }

    /// Whether the caller should refetch state and retry the command
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::StaleGeneration { .. })
    }
}

/// Result type with CoreError
pub type CoreResult<T> = Result<T, CoreError>;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Operation failed for the affected entry
    Error,
    /// Operation may be affected
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Non-fatal diagnostic attached to a journal or source location.
///
/// These never block candidate computation for unaffected entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalError {
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
}

impl JournalError {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => {
                write!(f, "{}:{}: {}: {}", file, line, self.severity, self.message)
            }
            (Some(file), None) => write!(f, "{}: {}: {}", file, self.severity, self.message),
            _ => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let err = CoreError::StaleGeneration {
            expected: 4,
            actual: 2,
        };
        assert_eq!(err.code(), ErrorCode::StaleGeneration);
        assert!(err.is_retriable());

        let err = CoreError::NotLoaded;
        assert_eq!(err.code(), ErrorCode::NotLoaded);
        assert!(!err.is_retriable());
    }

    #[test]
    fn journal_error_display() {
        let err = JournalError::error("expected cleared_before value to be a date")
            .with_location("accounts.bean", 12);
        assert_eq!(
            err.to_string(),
            "accounts.bean:12: error: expected cleared_before value to be a date"
        );
    }

    #[test]
    fn severity_orders_errors_first() {
        assert!(Severity::Error < Severity::Warning);
    }
}
