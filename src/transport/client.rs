//! Client side of the remote transport.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{encode_frame, read_frame, Call, Frame, WireRequest, WireResponse, MAX_FRAME_BYTES, REMOTE_BACKEND};
use crate::error::{StorageError, StorageResult};
use crate::storage::lock_err;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<WireResponse>>>>;

/// One live socket plus its session.
struct Connection {
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    session_id: Mutex<Option<String>>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn session_id(&self) -> StorageResult<Option<String>> {
        Ok(self.session_id.lock().map_err(|_| lock_err("remote session"))?.clone())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Routes response frames to their waiting callers until the socket closes.
async fn read_loop(reader: OwnedReadHalf, pending: Pending, alive: Arc<AtomicBool>) {
    let mut reader = BufReader::new(reader);
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
                warn!(target: "polystore::remote", error = %e, "read failed");
                break;
            }
        }
        let response: WireResponse = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(target: "polystore::remote", error = %e, "unparseable frame skipped");
                continue;
            }
        };
        let waiter = match pending.lock() {
            Ok(mut map) => map.remove(&response.id),
            Err(_) => break,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(target: "polystore::remote", id = response.id, "response without waiter"),
        }
    }
    alive.store(false, Ordering::Release);
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
    info!(target: "polystore::remote", "connection closed");
}

/// Multiplexing client for one remote namespace.
///
/// The socket is opened lazily on first use and re-opened (with a fresh
/// session) on the first call after it drops. Calls are never retried: a
/// call in flight when the connection drops fails with `BackendUnavailable`.
pub struct RemoteClient {
    socket_path: PathBuf,
    namespace: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: AsyncMutex<Option<Arc<Connection>>>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("socket_path", &self.socket_path)
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    #[must_use]
    pub fn new(socket_path: impl AsRef<Path>, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            namespace: namespace.into(),
            timeout,
            next_id: AtomicU64::new(1),
            conn: AsyncMutex::new(None),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether a live connection with a session currently exists.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.as_ref().is_some_and(|c| c.is_alive())
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> StorageError {
        StorageError::unavailable(
            REMOTE_BACKEND,
            format!("{}: {reason}", self.socket_path.display()),
        )
    }

    /// Returns the live connection, dialing and opening a session if needed.
    async fn connection(&self) -> StorageResult<Arc<Connection>> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref().filter(|c| c.is_alive()) {
            return Ok(Arc::clone(conn));
        }
        *slot = None;

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.unavailable(e))?;
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&pending), Arc::clone(&alive)));
        let conn = Arc::new(Connection {
            writer: AsyncMutex::new(write_half),
            pending,
            alive,
            session_id: Mutex::new(None),
            reader,
        });

        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Opened {
            session_id: String,
        }
        let opened: Opened = self
            .send(
                &conn,
                &Call::OpenSession {
                    namespace: self.namespace.clone(),
                },
            )
            .await?
            .into_result()?;
        *conn.session_id.lock().map_err(|_| lock_err("remote session"))? = Some(opened.session_id.clone());
        info!(
            target: "polystore::remote",
            namespace = %self.namespace,
            session = %opened.session_id,
            "remote session opened"
        );
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn send(&self, conn: &Connection, call: &Call) -> StorageResult<WireResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (command, params) = call.to_wire()?;
        let frame = encode_frame(&WireRequest {
            id,
            session_id: conn.session_id()?,
            command,
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        conn.pending
            .lock()
            .map_err(|_| lock_err("remote pending"))?
            .insert(id, tx);
        let forget = || {
            if let Ok(mut map) = conn.pending.lock() {
                map.remove(&id);
            }
        };

        let written = {
            let mut writer = conn.writer.lock().await;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            forget();
            conn.alive.store(false, Ordering::Release);
            return Err(self.unavailable(e));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.unavailable("connection dropped before the response")),
            Err(_) => {
                forget();
                warn!(target: "polystore::remote", command = call.name(), id, "remote call timed out");
                Err(StorageError::Timeout {
                    duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Sends `call` and decodes its result.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` when the socket cannot be reached or drops,
    /// `Timeout` past the deadline, otherwise the remote's own error.
    pub async fn call<T: DeserializeOwned>(&self, call: Call) -> StorageResult<T> {
        let conn = self.connection().await?;
        self.send(&conn, &call).await?.into_result()
    }

    /// Like [`RemoteClient::call`] but returns the raw decoded data.
    ///
    /// # Errors
    ///
    /// As [`RemoteClient::call`].
    pub async fn call_value(&self, call: Call) -> StorageResult<Value> {
        self.call(call).await
    }

    /// Ensures a connection and session exist.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if the server cannot be reached.
    pub async fn connect(&self) -> StorageResult<()> {
        self.connection().await.map(|_| ())
    }

    /// Ends the session and drops the socket. The next call reconnects.
    ///
    /// # Errors
    ///
    /// Never fails on an already closed client.
    pub async fn close(&self) -> StorageResult<()> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if conn.is_alive() {
                if let Err(e) = self.send(&conn, &Call::CloseSession {}).await {
                    debug!(target: "polystore::remote", error = %e, "close_session not acknowledged");
                }
            }
            let _ = conn.writer.lock().await.shutdown().await;
        }
        Ok(())
    }
}
