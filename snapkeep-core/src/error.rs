/*!
Error types for the Snapkeep core engine.
*/

use crate::provider::ProviderError;
use snapkeep_retry::RetryError;
use thiserror::Error;

/// Result type used throughout the Snapkeep core.
pub type Result<T> = std::result::Result<T, SnapkeepError>;

/// Errors that can occur during backup, retention and reconciliation.
#[derive(Error, Debug)]
pub enum SnapkeepError {
    /// I/O errors during catalog file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catalog document could not be interpreted
    #[error("Invalid catalog format: {0}")]
    InvalidFormat(String),

    /// Catalog persistence backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Permanent provider rejection (invalid instance, permission denied, ...)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Transient provider errors persisted past the attempt budget
    #[error("Provider operation '{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: ProviderError,
    },

    /// Every attempt of a provider operation hit the per-attempt timeout
    #[error("Provider operation '{operation}' timed out after {attempts} attempts")]
    TimedOut {
        operation: &'static str,
        attempts: usize,
    },

    /// The provider created an image that the catalog failed to record
    #[error("Image {image_id} of instance {instance_id} was created but not recorded: {reason}")]
    RecordedInconsistent {
        instance_id: String,
        image_id: String,
        reason: String,
    },

    /// Invalid retention policy or engine limits
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
}

impl SnapkeepError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new policy violation error
    pub fn policy_violation<S: Into<String>>(msg: S) -> Self {
        Self::PolicyViolation(msg.into())
    }

    /// True for failures that a later run may resolve on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::TimedOut { .. })
    }

    /// True when the operator needs a reconcile pass to restore consistency
    pub fn needs_reconcile(&self) -> bool {
        matches!(self, Self::RecordedInconsistent { .. })
    }
}

impl From<RetryError<ProviderError>> for SnapkeepError {
    fn from(err: RetryError<ProviderError>) -> Self {
        match err {
            RetryError::Permanent { source, .. } => Self::Provider(source),
            RetryError::MaxRetriesExceeded {
                operation,
                attempts,
                source,
            } => Self::RetriesExhausted {
                operation,
                attempts,
                source,
            },
            RetryError::TimedOut {
                operation,
                attempts,
            } => Self::TimedOut {
                operation,
                attempts,
            },
        }
    }
}
