//! Error types for the Ratewarden service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewarden operations.
///
/// Exceeding a quota is not an error; it is the deny branch of a
/// [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy with a non-positive window or quota, or a malformed name
    #[error("Invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// A policy name that is not registered
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// The shared counter store could not serve the request
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    pub(crate) fn invalid_policy(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        WardenError::InvalidPolicy {
            policy: policy.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
