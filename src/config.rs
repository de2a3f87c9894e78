//! Configuration surface.
//!
//! A [`StorageConfig`] is `{backendType, namespace, options}`. The options map
//! is backend-specific and passed through untouched; each backend parses the
//! typed view it needs ([`FileOptions`], [`SqliteOptions`], [`RemoteOptions`])
//! when it is opened.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Which adapter variant a [`StorageConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Memory,
    File,
    Sqlite,
    Remote,
}

impl BackendType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Remote => "remote",
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            "remote" => Ok(Self::Remote),
            other => Err(ValidationError::InvalidConfig {
                reason: format!("unknown backend type '{other}'"),
            }),
        }
    }
}

/// Top-level storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub backend_type: BackendType,
    pub namespace: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl StorageConfig {
    #[must_use]
    pub fn new(backend_type: BackendType, namespace: impl Into<String>) -> Self {
        Self {
            backend_type,
            namespace: namespace.into(),
            options: Map::new(),
        }
    }

    /// In-memory storage, mostly for tests.
    #[must_use]
    pub fn memory(namespace: impl Into<String>) -> Self {
        Self::new(BackendType::Memory, namespace)
    }

    /// Sets one backend option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parses the options map into a backend's typed view.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` when the options do not fit.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: format!("{} options: {e}", self.backend_type.as_str()),
            }
        })
    }

    /// Checks the fields every backend relies on.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for an empty or path-like
    /// namespace.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.namespace.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "namespace cannot be empty".to_string(),
            });
        }
        if self.namespace.contains(['/', '\\']) || self.namespace == ".." {
            return Err(ValidationError::InvalidConfig {
                reason: format!("namespace '{}' must not contain path separators", self.namespace),
            });
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

/// Options for the file-backed in-process adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOptions {
    /// Root directory; the namespace becomes a subdirectory.
    pub path: PathBuf,
    /// fsync every collection file after writing it.
    #[serde(default = "default_true")]
    pub sync_on_write: bool,
}

/// Options for the relational adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqliteOptions {
    /// Database file; an in-memory database when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

const fn default_timeout_ms() -> u64 {
    5_000
}

/// Options for the remote adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOptions {
    pub socket_path: PathBuf,
    /// Per-call deadline.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RemoteOptions {
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for a zero timeout.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "timeoutMs must be positive".to_string(),
            });
        }
        Ok(self)
    }
}

/// Offline sync tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Key the queue is persisted under.
    pub queue_key: String,
    /// Collections whose remote change notifications update the local cache.
    pub cacheable_collections: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Periodic retry while backing off; disabled when absent.
    pub retry_interval_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_key: "sync_queue".to_string(),
            cacheable_collections: Vec::new(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            retry_interval_ms: None,
        }
    }
}

impl SyncConfig {
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for an empty queue key or
    /// inverted backoff bounds.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.queue_key.is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "queueKey cannot be empty".to_string(),
            });
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "backoff base ({}ms) must be positive and at most the max ({}ms)",
                    self.backoff_base_ms, self.backoff_max_ms
                ),
            });
        }
        if self.retry_interval_ms == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: "retryIntervalMs must be positive".to_string(),
            });
        }
        Ok(self)
    }

    /// Whether remote change notifications for `collection` are applied.
    #[must_use]
    pub fn is_cacheable(&self, collection: &str) -> bool {
        self.cacheable_collections.iter().any(|c| c == collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_from_json() {
        let cfg: StorageConfig = serde_json::from_value(json!({
            "backendType": "file",
            "namespace": "app",
            "options": {"path": "/tmp/data", "syncOnWrite": false}
        }))
        .unwrap();
        assert_eq!(cfg.backend_type, BackendType::File);
        let opts: FileOptions = cfg.options_as().unwrap();
        assert_eq!(opts.path, PathBuf::from("/tmp/data"));
        assert!(!opts.sync_on_write);
    }

    #[test]
    fn test_missing_required_option() {
        let cfg = StorageConfig::new(BackendType::Remote, "app");
        assert!(matches!(
            cfg.options_as::<RemoteOptions>(),
            Err(ValidationError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_remote_defaults() {
        let cfg = StorageConfig::new(BackendType::Remote, "app").option("socketPath", "/tmp/s.sock");
        let opts: RemoteOptions = cfg.options_as().unwrap();
        assert_eq!(opts.timeout_ms, 5_000);
    }

    #[test]
    fn test_namespace_validation() {
        assert!(StorageConfig::memory("").validate().is_err());
        assert!(StorageConfig::memory("a/b").validate().is_err());
        assert!(StorageConfig::memory("app").validate().is_ok());
    }

    #[test]
    fn test_backend_type_parse() {
        assert_eq!("sqlite".parse::<BackendType>().unwrap(), BackendType::Sqlite);
        assert!("mongo".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_sync_config_validate() {
        assert!(SyncConfig::default().validate().is_ok());
        let bad = SyncConfig {
            backoff_base_ms: 10_000,
            backoff_max_ms: 1_000,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
