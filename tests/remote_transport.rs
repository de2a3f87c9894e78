//! Remote adapter against a live socket server.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::oneshot;

use polystore::config::RemoteOptions;
use polystore::storage::local::MemoryAdapter;
use polystore::storage::remote::RemoteAdapter;
use polystore::transport::{encode_frame, ConfigProvider, RemoteServer, WireRequest, WireResponse};
use polystore::{
    data_from, NewRecord, RecordPatch, StorageAdapter, StorageBackend, StorageConfig, StorageError, StorageQuery,
};

fn options(socket: &Path, timeout_ms: u64) -> RemoteOptions {
    RemoteOptions {
        socket_path: socket.to_path_buf(),
        timeout_ms,
    }
}

/// Serves `provider` until the returned sender fires or is dropped.
fn spawn_server(socket: &Path, server: Arc<RemoteServer>) -> oneshot::Sender<()> {
    let listener = RemoteServer::bind(socket).unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async {
        let _ = stopped.await;
    }));
    stop
}

fn memory_server() -> (Arc<RemoteServer>, Arc<dyn StorageBackend>) {
    let backend: Arc<dyn StorageBackend> = Arc::new(MemoryAdapter::new());
    (Arc::new(RemoteServer::new(Arc::new(Arc::clone(&backend)))), backend)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("s.sock");
    let (server, served) = memory_server();
    let _stop = spawn_server(&socket, Arc::clone(&server));

    let remote = Arc::new(RemoteAdapter::new("app", options(&socket, 5_000)));
    let creates = (0..64).map(|i| {
        let remote = Arc::clone(&remote);
        async move {
            remote
                .create(NewRecord::new("items", data_from(json!({"n": i}))).with_id(format!("i{i:02}")))
                .await
        }
    });
    let results = join_all(creates).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(server.session_count().await, 1);

    let reads = join_all((0..64).map(|i| {
        let remote = Arc::clone(&remote);
        async move { remote.read("items", &format!("i{i:02}")).await }
    }))
    .await;
    for (i, read) in reads.into_iter().enumerate() {
        assert_eq!(read.unwrap().unwrap().data["n"], json!(i));
    }
    assert_eq!(served.collection_stats("items").await.unwrap().record_count, 64);

    remote.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_errors_keep_their_kind() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("s.sock");
    let (server, _) = memory_server();
    let _stop = spawn_server(&socket, server);
    let remote = RemoteAdapter::new("app", options(&socket, 5_000));

    remote
        .create(NewRecord::new("users", data_from(json!({"name": "Ada"}))).with_id("u1"))
        .await
        .unwrap();
    let err = remote
        .create(NewRecord::new("users", data_from(json!({}))).with_id("u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }), "{err}");

    let err = remote.update("users", "ghost", RecordPatch::default()).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let err = remote
        .query(&StorageQuery::new("users").filter(json!({"name": {"$near": 1}})))
        .await
        .unwrap_err();
    assert!(err.is_validation(), "{err}");

    let snake = remote
        .create(
            NewRecord::new("users", data_from(json!({"firstName": "Grace", "home_town": "NYC"}))).with_id("u2"),
        )
        .await
        .unwrap();
    assert_eq!(snake.data["firstName"], json!("Grace"));
    assert_eq!(snake.data["home_town"], json!("NYC"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("s.sock");
    let provider = Arc::new(ConfigProvider::new(StorageConfig::memory("template")));
    let server = Arc::new(RemoteServer::new(provider));
    let _stop = spawn_server(&socket, server);

    let alpha = RemoteAdapter::new("alpha", options(&socket, 5_000));
    let beta = RemoteAdapter::new("beta", options(&socket, 5_000));
    alpha
        .create(NewRecord::new("notes", data_from(json!({"x": 1}))).with_id("n1"))
        .await
        .unwrap();
    assert!(alpha.read("notes", "n1").await.unwrap().is_some());
    assert!(beta.read("notes", "n1").await.unwrap().is_none());
    assert!(beta.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_socket_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let remote = RemoteAdapter::new("app", options(&dir.path().join("missing.sock"), 1_000));
    let err = remote.read("users", "u1").await.unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable { .. }), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_server_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("silent.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let remote = RemoteAdapter::new("app", options(&socket, 100));
    let err = remote.read("users", "u1").await.unwrap_err();
    assert!(matches!(err, StorageError::Timeout { duration_ms: 100 }), "{err}");
}

/// Answers `open_session` once, then hangs up.
async fn one_shot_session(listener: UnixListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read).read_line(&mut line).await.unwrap();
    let request: WireRequest = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(request.command, "open_session");
    let frame = encode_frame(&WireResponse::from_result(request.id, Ok(json!({"sessionId": "s-1"})))).unwrap();
    write.write_all(&frame).await.unwrap();
    write.flush().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnects_after_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("restart.sock");
    let listener = RemoteServer::bind(&socket).unwrap();
    let first = tokio::spawn(one_shot_session(listener));

    let remote = RemoteAdapter::new("app", options(&socket, 2_000));
    remote.client().connect().await.unwrap();
    first.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = remote.read("users", "u1").await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    let (server, served) = memory_server();
    let _stop = spawn_server(&socket, server);
    served
        .create(NewRecord::new("users", data_from(json!({"v": 1}))).with_id("u1"))
        .await
        .unwrap();
    let record = remote.read("users", "u1").await.unwrap().unwrap();
    assert_eq!(record.data["v"], json!(1));
    assert!(remote.client().is_connected().await);
}
