//! Error types for polystore.
//!
//! All errors are strongly typed using thiserror. Every adapter operation
//! returns [`StorageResult`], so expected failures (missing records, malformed
//! filters, an unreachable remote engine) are values the caller matches on,
//! never panics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors raised while checking queries, filters, configuration
/// and record shapes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Collection name cannot be empty")]
    EmptyCollection,

    #[error("Record id cannot be empty")]
    EmptyRecordId,

    #[error("Invalid field path '{path}'")]
    InvalidFieldPath {
        path: String,
    },

    #[error("Unknown operator '{operator}' on field '{field}'")]
    UnknownOperator {
        field: String,
        operator: String,
    },

    #[error("Invalid operand for '{operator}' on field '{field}': {reason}")]
    InvalidOperand {
        field: String,
        operator: String,
        reason: String,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Invalid query: {reason}")]
    InvalidQuery {
        reason: String,
    },

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
    },

    #[error("Unique index '{index}' on collection '{collection}' rejects a duplicate value")]
    UniqueViolation {
        collection: String,
        index: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Rejected by remote engine: {reason}")]
    Rejected {
        reason: String,
    },
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record with this id exists in the collection.
    #[error("Record not found: {collection}/{id}")]
    NotFound {
        collection: String,
        id: String,
    },

    /// A record with this id already exists in the collection.
    #[error("Record already exists: {collection}/{id}")]
    AlreadyExists {
        collection: String,
        id: String,
    },

    /// The request was malformed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The backend cannot be reached (closed adapter, dropped connection).
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable {
        backend: String,
        reason: String,
    },

    /// A remote call did not answer in time.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    /// A step of a multi-statement mutation failed; every prior step was
    /// rolled back.
    #[error("Transaction '{operation}' rolled back: {cause}")]
    TransactionFailure {
        operation: String,
        cause: String,
    },

    /// The persisted sync queue could not be read.
    #[error("Sync queue corrupted: {reason}")]
    QueueCorruption {
        reason: String,
    },

    /// Some items of a batch failed; the rest were still processed.
    #[error("Batch partially failed: {failed} of {total} items failed")]
    PartialBatchFailure {
        total: usize,
        failed: usize,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`StorageError`], carried on the wire and in
/// [`crate::result::StorageResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ValidationFailure,
    BackendUnavailable,
    TransactionFailure,
    QueueCorruption,
    PartialBatchFailure,
    Internal,
}

/// Serializable form of a [`StorageError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StorageError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates a backend-unavailable error.
    #[must_use]
    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Returns the taxonomy bucket for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Validation(_) => ErrorKind::ValidationFailure,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } => ErrorKind::BackendUnavailable,
            Self::TransactionFailure { .. } => ErrorKind::TransactionFailure,
            Self::QueueCorruption { .. } => ErrorKind::QueueCorruption,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Self::Backend(_) | Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }

    /// Converts into the wire/envelope representation.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let (collection, id) = match self {
            Self::NotFound { collection, id } | Self::AlreadyExists { collection, id } => {
                (Some(collection.clone()), Some(id.clone()))
            }
            _ => (None, None),
        };
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            collection,
            id,
        }
    }

    /// Rebuilds an error from its wire representation.
    ///
    /// Kinds that carry structured detail (`NotFound`, `AlreadyExists`) are
    /// reconstructed exactly; the rest keep the remote message.
    #[must_use]
    pub fn from_payload(payload: ErrorPayload, backend: &str) -> Self {
        let ErrorPayload {
            kind,
            message,
            collection,
            id,
        } = payload;
        match kind {
            ErrorKind::NotFound => Self::NotFound {
                collection: collection.unwrap_or_default(),
                id: id.unwrap_or_default(),
            },
            ErrorKind::AlreadyExists => Self::AlreadyExists {
                collection: collection.unwrap_or_default(),
                id: id.unwrap_or_default(),
            },
            ErrorKind::ValidationFailure => {
                Self::Validation(ValidationError::Rejected { reason: message })
            }
            ErrorKind::BackendUnavailable => Self::BackendUnavailable {
                backend: backend.to_string(),
                reason: message,
            },
            ErrorKind::TransactionFailure => Self::TransactionFailure {
                operation: "remote".to_string(),
                cause: message,
            },
            ErrorKind::QueueCorruption => Self::QueueCorruption { reason: message },
            ErrorKind::PartialBatchFailure | ErrorKind::Internal => Self::Backend(message),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_unknown_operator() {
        let err = ValidationError::UnknownOperator {
            field: "age".to_string(),
            operator: "$between".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("$between"));
        assert!(msg.contains("age"));
    }

    #[test]
    fn test_storage_error_not_found() {
        let err = StorageError::not_found("users", "r1");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("users/r1"));
    }

    #[test]
    fn test_storage_error_from_validation() {
        let err: StorageError = ValidationError::EmptyCollection.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
    }

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::Timeout { duration_ms: 100 }.is_retryable());
        assert!(StorageError::unavailable("remote", "refused").is_retryable());
        assert!(!StorageError::not_found("a", "b").is_retryable());
        assert!(!StorageError::Backend("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_is_backend_unavailable() {
        let err = StorageError::Timeout { duration_ms: 5000 };
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(err.to_string().contains("5000ms"));
    }

    #[test]
    fn test_payload_roundtrip_keeps_identity() {
        let err = StorageError::AlreadyExists {
            collection: "notes".to_string(),
            id: "n1".to_string(),
        };
        let rebuilt = StorageError::from_payload(err.to_payload(), "remote");
        match rebuilt {
            StorageError::AlreadyExists { collection, id } => {
                assert_eq!(collection, "notes");
                assert_eq!(id, "n1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_payload_validation_keeps_message() {
        let err: StorageError = ValidationError::InvalidQuery {
            reason: "limit must be positive".to_string(),
        }
        .into();
        let rebuilt = StorageError::from_payload(err.to_payload(), "remote");
        assert!(rebuilt.is_validation());
        assert!(rebuilt.to_string().contains("limit must be positive"));
    }
}
