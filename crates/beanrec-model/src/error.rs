//! Error types for beanrec-model

use thiserror::Error;

/// Errors produced while constructing model values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid account type: {value}")]
    InvalidAccountType { value: String },

    #[error("Invalid date value: {value}")]
    InvalidDate { value: String },
}
