//! The uniform operation envelope.
//!
//! Inside the crate every operation returns a `StorageResult<T>`. At the
//! outward seam (and on the wire) the same outcome is carried as a
//! [`StorageResponse`], `{success, data?, error?, metadata?}`.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorPayload, StorageError, StorageResult};

/// Query bookkeeping attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// Milliseconds spent executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_time: Option<u64>,
}

/// Tagged outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

impl<T> StorageResponse<T> {
    /// A successful response carrying `data`.
    #[must_use]
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn err(error: &StorageError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_payload()),
            metadata: None,
        }
    }

    /// Attaches query bookkeeping.
    #[must_use]
    pub const fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Wraps a `StorageResult`.
    #[must_use]
    pub fn from_result(result: StorageResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }

    /// Unwraps into a `StorageResult`, rebuilding the error on failure.
    ///
    /// # Errors
    ///
    /// Returns the carried error, or `StorageError::Backend` when a success
    /// response has no data.
    pub fn into_result(self, backend: &str) -> StorageResult<T> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (false, _, Some(payload)) => Err(StorageError::from_payload(payload, backend)),
            (true, None, _) => Err(StorageError::Backend(
                "successful response carried no data".to_string(),
            )),
            (false, _, None) => Err(StorageError::Backend(
                "failed response carried no error".to_string(),
            )),
        }
    }
}
