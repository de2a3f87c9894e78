//! Storage backends.
//!
//! ```text
//! StorageBackend (StorageAdapter + VectorPrimitives)
//! ├── LocalAdapter<MemoryPersistence>  "memory"  in-process, reference semantics
//! ├── LocalAdapter<FilePersistence>    "file"    in-process, snapshot files (feature: file-store)
//! ├── SqliteAdapter                    "sqlite"  relational (feature: sqlite)
//! └── RemoteAdapter                    "remote"  Unix-socket IPC (unix only)
//! ```
//!
//! The backend is chosen once, from [`StorageConfig::backend_type`], by
//! [`open_backend`].

pub mod local;
#[cfg(unix)]
pub mod remote;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use traits::{
    BatchItem, BatchOperation, BatchOutcome, CleanupReport, CollectionSchema, CollectionStats,
    IndexDefinition, QueryExplanation, StorageAdapter, StorageBackend, StoredVector,
    VectorPrimitives,
};

use std::sync::Arc;

use tracing::info;

use crate::config::{BackendType, StorageConfig};
use crate::error::{StorageError, StorageResult};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[cfg(any(not(feature = "file-store"), not(feature = "sqlite"), not(unix)))]
fn unsupported(backend: BackendType, feature: &str) -> StorageError {
    crate::error::ValidationError::InvalidConfig {
        reason: format!(
            "backend '{}' requires the '{feature}' feature or platform support",
            backend.as_str()
        ),
    }
    .into()
}

/// Builds and initializes the backend selected by `config`.
///
/// # Errors
///
/// Returns `InvalidConfig` for malformed options or a backend compiled out,
/// or the backend's own error if initialization fails.
pub async fn open_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    config.validate()?;
    let backend: Arc<dyn StorageBackend> = match config.backend_type {
        BackendType::Memory => Arc::new(local::MemoryAdapter::new()),
        #[cfg(feature = "file-store")]
        BackendType::File => {
            let options: crate::config::FileOptions = config.options_as()?;
            Arc::new(local::FileAdapter::open(&config.namespace, &options)?)
        }
        #[cfg(not(feature = "file-store"))]
        BackendType::File => return Err(unsupported(config.backend_type, "file-store")),
        #[cfg(feature = "sqlite")]
        BackendType::Sqlite => {
            let options: crate::config::SqliteOptions = config.options_as()?;
            Arc::new(sqlite::SqliteAdapter::open(&options)?)
        }
        #[cfg(not(feature = "sqlite"))]
        BackendType::Sqlite => return Err(unsupported(config.backend_type, "sqlite")),
        #[cfg(unix)]
        BackendType::Remote => {
            let options: crate::config::RemoteOptions = config.options_as()?;
            Arc::new(remote::RemoteAdapter::new(&config.namespace, options.validate()?))
        }
        #[cfg(not(unix))]
        BackendType::Remote => return Err(unsupported(config.backend_type, "unix")),
    };
    backend.initialize().await?;
    info!(
        target: "polystore::storage",
        backend = backend.backend_name(),
        namespace = %config.namespace,
        "storage backend ready"
    );
    Ok(backend)
}
