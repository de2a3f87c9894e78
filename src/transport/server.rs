//! Server side of the remote transport: exposes any [`StorageBackend`] over
//! a Unix socket.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{encode_frame, read_frame, Call, Frame, WireRequest, WireResponse, MAX_FRAME_BYTES};
use crate::config::{BackendType, SqliteOptions, StorageConfig};
use crate::error::{StorageError, StorageResult, ValidationError};
use crate::storage::{open_backend, StorageBackend};

/// Open sessions the server keeps at most.
const MAX_SESSIONS: usize = 4096;

/// Outgoing frames buffered per connection.
const WRITE_QUEUE: usize = 256;

/// Resolves the backend serving a namespace.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn backend(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>>;
}

/// Every namespace shares one backend.
#[async_trait]
impl BackendProvider for Arc<dyn StorageBackend> {
    async fn backend(&self, _namespace: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        Ok(Arc::clone(self))
    }
}

/// Opens one backend per namespace from a config template, on first use.
pub struct ConfigProvider {
    template: StorageConfig,
    opened: Mutex<HashMap<String, Arc<dyn StorageBackend>>>,
}

impl ConfigProvider {
    #[must_use]
    pub fn new(template: StorageConfig) -> Self {
        Self {
            template,
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// The template with `namespace` filled in. A SQLite template whose
    /// `path` is a directory gets one database file per namespace in it.
    fn config_for(&self, namespace: &str) -> StorageResult<StorageConfig> {
        let config = StorageConfig {
            namespace: namespace.to_string(),
            ..self.template.clone()
        };
        config.validate()?;
        if config.backend_type != BackendType::Sqlite {
            return Ok(config);
        }
        let options: SqliteOptions = config.options_as()?;
        match options.path.filter(|p| p.is_dir()) {
            Some(dir) => {
                let file = dir.join(format!("{namespace}.sqlite"));
                Ok(config.option("path", file.to_string_lossy().into_owned()))
            }
            None => Ok(config),
        }
    }

    /// Closes every backend opened so far.
    pub async fn close_all(&self) {
        let opened: Vec<_> = self.opened.lock().await.drain().collect();
        for (namespace, backend) in opened {
            if let Err(e) = backend.close().await {
                warn!(target: "polystore::remote", namespace = %namespace, error = %e, "backend close failed");
            }
        }
    }
}

#[async_trait]
impl BackendProvider for ConfigProvider {
    async fn backend(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        let mut opened = self.opened.lock().await;
        if let Some(backend) = opened.get(namespace) {
            return Ok(Arc::clone(backend));
        }
        let backend = open_backend(&self.config_for(namespace)?).await?;
        opened.insert(namespace.to_string(), Arc::clone(&backend));
        Ok(backend)
    }
}

fn to_json<T: serde::Serialize>(value: T) -> StorageResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Runs one non-session call against `backend`.
///
/// # Errors
///
/// Returns the backend's error, or `InvalidQuery` for session commands.
pub async fn dispatch(backend: &dyn StorageBackend, call: Call) -> StorageResult<Value> {
    match call {
        Call::OpenSession { .. } | Call::CloseSession {} => Err(ValidationError::InvalidQuery {
            reason: "session commands are handled per connection".to_string(),
        }
        .into()),
        Call::Create { record } => to_json(backend.create(record).await?),
        Call::Read { collection, id } => to_json(backend.read(&collection, &id).await?),
        Call::Query { query } => to_json(backend.query(&query).await?),
        Call::Update { collection, id, patch } => to_json(backend.update(&collection, &id, patch).await?),
        Call::Delete { collection, id } => to_json(backend.delete(&collection, &id).await?),
        Call::ListCollections {} => to_json(backend.list_collections().await?),
        Call::CollectionStats { collection } => to_json(backend.collection_stats(&collection).await?),
        Call::Batch { operations } => to_json(backend.batch(operations).await?),
        Call::Clear { collection } => to_json(backend.clear(&collection).await?),
        Call::ClearAll {} => to_json(backend.clear_all().await?),
        Call::Truncate { collection } => to_json(backend.truncate(&collection).await?),
        Call::EnsureSchema { collection, schema } => {
            to_json(backend.ensure_schema(&collection, &schema).await?)
        }
        Call::Cleanup {} => to_json(backend.cleanup().await?),
        Call::ExplainQuery { query } => to_json(backend.explain_query(&query).await?),
        Call::EnsureVectorStorage { collection, dimensions } => {
            to_json(backend.ensure_vector_storage(&collection, dimensions).await?)
        }
        Call::StoreVector { collection, vector } => to_json(backend.store_vector(&collection, vector).await?),
        Call::GetAllVectors { collection } => to_json(backend.get_all_vectors(&collection).await?),
        Call::GetVectorCount { collection } => to_json(backend.get_vector_count(&collection).await?),
    }
}

async fn respond(tx: &mpsc::Sender<Vec<u8>>, response: WireResponse) {
    let id = response.id;
    let frame = encode_frame(&response).or_else(|e| encode_frame(&WireResponse::from_result(id, Err(e))));
    match frame {
        Ok(frame) => {
            if tx.send(frame).await.is_err() {
                debug!(target: "polystore::remote", id, "connection gone before response");
            }
        }
        Err(e) => warn!(target: "polystore::remote", id, error = %e, "response dropped"),
    }
}

/// Serves storage calls on a Unix socket.
pub struct RemoteServer {
    provider: Arc<dyn BackendProvider>,
    sessions: RwLock<HashMap<String, Arc<dyn StorageBackend>>>,
}

impl RemoteServer {
    #[must_use]
    pub fn new(provider: Arc<dyn BackendProvider>) -> Self {
        Self {
            provider,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Binds `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be bound.
    pub fn bind(path: impl AsRef<Path>) -> StorageResult<UnixListener> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => debug!(target: "polystore::remote", path = %path.display(), "stale socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(UnixListener::bind(path)?)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: impl Future<Output = ()> + Send) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream).await });
                    }
                    Err(e) => warn!(target: "polystore::remote", error = %e, "accept failed"),
                },
            }
        }
        info!(target: "polystore::remote", "server stopped accepting");
    }

    async fn open_session(&self, namespace: &str) -> StorageResult<(String, Arc<dyn StorageBackend>)> {
        StorageConfig::memory(namespace).validate()?;
        let backend = self.provider.backend(namespace).await?;
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            return Err(StorageError::unavailable("remote", "session limit reached"));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        sessions.insert(session_id.clone(), Arc::clone(&backend));
        info!(target: "polystore::remote", namespace, session = %session_id, "session opened");
        Ok((session_id, backend))
    }

    async fn end_session(&self, session_id: &str) {
        if self.sessions.write().await.remove(session_id).is_some() {
            debug!(target: "polystore::remote", session = %session_id, "session closed");
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(target: "polystore::remote", error = %e, "write failed");
                    break;
                }
            }
        });

        let mut session: Option<(String, Arc<dyn StorageBackend>)> = None;
        let mut reader = BufReader::new(read_half);
        let mut frame = Vec::new();
        loop {
            match read_frame(&mut reader, &mut frame, MAX_FRAME_BYTES).await {
                Ok(Frame::Eof) => break,
                Ok(Frame::Complete) => {}
                Ok(Frame::Oversized(bytes)) => {
                    warn!(target: "polystore::remote", bytes, "oversized frame skipped");
                    continue;
                }
                Err(e) => {
                    debug!(target: "polystore::remote", error = %e, "read failed");
                    break;
                }
            }
            let request: WireRequest = match serde_json::from_slice(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(target: "polystore::remote", error = %e, "unparseable frame skipped");
                    continue;
                }
            };
            let id = request.id;
            let call = match Call::from_wire(&request.command, request.params) {
                Ok(call) => call,
                Err(e) => {
                    respond(&tx, WireResponse::from_result(id, Err(e.into()))).await;
                    continue;
                }
            };

            match call {
                Call::OpenSession { namespace } => {
                    if let Some((old, _)) = session.take() {
                        self.end_session(&old).await;
                    }
                    let result = self.open_session(&namespace).await.map(|(sid, backend)| {
                        let data = json!({ "sessionId": sid.clone() });
                        session = Some((sid, backend));
                        data
                    });
                    respond(&tx, WireResponse::from_result(id, result)).await;
                }
                Call::CloseSession {} => {
                    if let Some((old, _)) = session.take() {
                        self.end_session(&old).await;
                    }
                    respond(&tx, WireResponse::from_result(id, Ok(Value::Null))).await;
                }
                call => {
                    let backend = match &session {
                        Some((sid, backend)) if request.session_id.as_deref() == Some(sid.as_str()) => {
                            Arc::clone(backend)
                        }
                        _ => {
                            let err = ValidationError::Rejected {
                                reason: "no open session for this request".to_string(),
                            };
                            respond(&tx, WireResponse::from_result(id, Err(err.into()))).await;
                            continue;
                        }
                    };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = dispatch(backend.as_ref(), call).await;
                        respond(&tx, WireResponse::from_result(id, result)).await;
                    });
                }
            }
        }

        if let Some((old, _)) = session.take() {
            self.end_session(&old).await;
        }
        drop(tx);
        let _ = writer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{data_from, NewRecord, Record};
    use crate::storage::local::MemoryAdapter;

    #[tokio::test]
    async fn test_dispatch_roundtrips_typed_results() {
        let backend = MemoryAdapter::new();
        let created = dispatch(
            &backend,
            Call::Create {
                record: NewRecord::new("users", data_from(json!({"a": 1}))).with_id("u1"),
            },
        )
        .await
        .unwrap();
        let record: Record = serde_json::from_value(created).unwrap();
        assert_eq!(record.id, "u1");

        let missing = dispatch(
            &backend,
            Call::Read {
                collection: "users".to_string(),
                id: "nope".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_session_commands() {
        let backend = MemoryAdapter::new();
        let err = dispatch(&backend, Call::CloseSession {}).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_config_provider_reuses_backends() {
        let provider = ConfigProvider::new(StorageConfig::memory("template"));
        let a = provider.backend("a").await.unwrap();
        let again = provider.backend("a").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        provider.close_all().await;
    }

    #[test]
    fn test_sqlite_template_dir_gets_file_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ConfigProvider::new(
            StorageConfig::new(BackendType::Sqlite, "template")
                .option("path", dir.path().to_string_lossy().into_owned()),
        );
        let options: SqliteOptions = provider.config_for("alpha").unwrap().options_as().unwrap();
        assert_eq!(options.path, Some(dir.path().join("alpha.sqlite")));
        assert!(provider.config_for("../x").is_err());
    }
}
