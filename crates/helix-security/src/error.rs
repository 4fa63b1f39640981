//! Error types for the security crate

use thiserror::Error;

/// Errors raised while compiling patterns or mutating the policy document.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid policy document: {0}")]
    Validation(String),

    #[error("Policy IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Policy JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the approval coordinator.
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Approval request has an empty command")]
    EmptyCommand,

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Result type alias for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;
