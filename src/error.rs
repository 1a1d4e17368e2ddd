//! Error types for claimfold.
//!
//! All errors are strongly typed using thiserror. Ownership conflicts are
//! deliberately absent: a rejected claim is a business verdict
//! ([`crate::engine::Verdict::Rejected`]), not a failure.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised synchronously for malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field '{field}' cannot be empty")]
    EmptyKey {
        field: &'static str,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    KeyTooLong {
        field: &'static str,
        max_length: usize,
    },

    #[error("Field '{field}' contains control characters")]
    ControlCharacters {
        field: &'static str,
    },

    #[error("Field '{field}' is outside the representable range (1677-09-21 to 2262-04-11)")]
    TimestampOutOfRange {
        field: &'static str,
    },

    #[error("Payload must be a JSON object, got {kind}")]
    PayloadNotObject {
        kind: &'static str,
    },

    #[error("Payload is {actual} bytes, maximum is {max_bytes}")]
    PayloadTooLarge {
        actual: usize,
        max_bytes: usize,
    },
}

/// Top-level error type for claimfold.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Empty or malformed key or payload. Never retried.
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// The storage abstraction failed; propagated unchanged.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EngineError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the storage layer failed.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Returns true if a caller-side retry could succeed.
    ///
    /// The engine itself never retries; this only classifies transient
    /// infrastructure failures for the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::StorageUnavailable(e) => matches!(
                e,
                StorageError::ConnectionError(_) | StorageError::Io(_)
            ),
            Self::Validation(_) | Self::Config { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for claimfold operations.
pub type EngineResult<T> = Result<T, EngineError>;
