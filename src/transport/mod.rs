//! Remote transport: newline-framed JSON over a Unix socket.
//!
//! ```text
//! request   {"id": 7, "session_id": "…", "command": "read", "params": {...}}
//! response  {"id": 7, "success": true, "data": {...}}
//!           {"id": 7, "success": false, "error": {"kind": "not_found", ...}}
//! ```
//!
//! Correlation ids let one connection carry many concurrent requests. The
//! first request on a connection is `open_session {namespace}`, answered with
//! `{session_id}`; every later request carries that id. Keys inside `params`
//! and `data` are translated with [`naming`] so the remote side sees
//! snake_case.

#[cfg(unix)]
pub mod client;
pub mod naming;
#[cfg(unix)]
pub mod server;

#[cfg(unix)]
pub use client::RemoteClient;
#[cfg(unix)]
pub use server::{dispatch, BackendProvider, ConfigProvider, RemoteServer};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorPayload, StorageError, StorageResult, ValidationError};
use crate::query::StorageQuery;
use crate::record::{NewRecord, RecordPatch};
use crate::storage::{BatchOperation, CollectionSchema, StoredVector};

/// Maximum size of one frame, newline excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Backend name used in errors raised by the remote path.
pub const REMOTE_BACKEND: &str = "remote";

/// One remote operation with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Call {
    OpenSession { namespace: String },
    CloseSession {},
    Create { record: NewRecord },
    Read { collection: String, id: String },
    Query { query: StorageQuery },
    Update { collection: String, id: String, patch: RecordPatch },
    Delete { collection: String, id: String },
    ListCollections {},
    CollectionStats { collection: String },
    Batch { operations: Vec<BatchOperation> },
    Clear { collection: String },
    ClearAll {},
    Truncate { collection: String },
    EnsureSchema { collection: String, schema: CollectionSchema },
    Cleanup {},
    ExplainQuery { query: StorageQuery },
    EnsureVectorStorage { collection: String, dimensions: usize },
    StoreVector { collection: String, vector: StoredVector },
    GetAllVectors { collection: String },
    GetVectorCount { collection: String },
}

impl Call {
    /// Splits into the wire `command` and encoded `params`.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the parameters cannot be encoded.
    pub fn to_wire(&self) -> StorageResult<(String, Value)> {
        let mut tagged = serde_json::to_value(self)?;
        let command = tagged
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StorageError::Serialization("call has no command tag".to_string()))?;
        let params = tagged
            .get_mut("params")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        Ok((command, naming::encode_value(params)))
    }

    /// Rebuilds a call from the wire `command` and `params`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` for an unknown command or malformed params.
    pub fn from_wire(command: &str, params: Value) -> Result<Self, ValidationError> {
        let params = match params {
            Value::Null => json!({}),
            other => naming::decode_value(other),
        };
        serde_json::from_value(json!({ "command": command, "params": params })).map_err(|e| {
            ValidationError::InvalidQuery {
                reason: format!("bad '{command}' request: {e}"),
            }
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenSession { .. } => "open_session",
            Self::CloseSession {} => "close_session",
            Self::Create { .. } => "create",
            Self::Read { .. } => "read",
            Self::Query { .. } => "query",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::ListCollections {} => "list_collections",
            Self::CollectionStats { .. } => "collection_stats",
            Self::Batch { .. } => "batch",
            Self::Clear { .. } => "clear",
            Self::ClearAll {} => "clear_all",
            Self::Truncate { .. } => "truncate",
            Self::EnsureSchema { .. } => "ensure_schema",
            Self::Cleanup {} => "cleanup",
            Self::ExplainQuery { .. } => "explain_query",
            Self::EnsureVectorStorage { .. } => "ensure_vector_storage",
            Self::StoreVector { .. } => "store_vector",
            Self::GetAllVectors { .. } => "get_all_vectors",
            Self::GetVectorCount { .. } => "get_vector_count",
        }
    }
}

/// Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// Response frame. `data` is `null` for operations without a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl WireResponse {
    /// Builds a response from an operation result, encoding its keys.
    #[must_use]
    pub fn from_result(id: u64, result: StorageResult<Value>) -> Self {
        match result {
            Ok(data) => Self {
                id,
                success: true,
                data: naming::encode_value(data),
                error: None,
            },
            Err(e) => Self {
                id,
                success: false,
                data: Value::Null,
                error: Some(e.to_payload()),
            },
        }
    }

    /// Decodes the carried data, or rebuilds the carried error.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or `Serialization` if the data does not
    /// have the expected shape.
    pub fn into_result<T: DeserializeOwned>(self) -> StorageResult<T> {
        if !self.success {
            let payload = self.error.ok_or_else(|| {
                StorageError::Backend("failed response carried no error".to_string())
            })?;
            return Err(StorageError::from_payload(payload, REMOTE_BACKEND));
        }
        serde_json::from_value(naming::decode_value(self.data))
            .map_err(|e| StorageError::Serialization(format!("unexpected response shape: {e}")))
    }
}

/// Serializes one frame, newline included.
///
/// # Errors
///
/// Fails if serialization fails or the frame exceeds [`MAX_FRAME_BYTES`].
pub fn encode_frame<T: Serialize>(frame: &T) -> StorageResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(StorageError::Serialization(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
            bytes.len()
        )));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// What [`read_frame`] found on the stream.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A frame is in the buffer, newline included when one was read.
    Complete,
    /// A frame longer than the limit was read past and discarded.
    Oversized(usize),
    Eof,
}

/// Reads the next newline-terminated frame into `buf`.
///
/// At most `limit + 1` bytes are ever buffered; the rest of an oversized
/// frame is consumed and dropped so the stream stays in sync.
#[cfg(unix)]
pub(crate) async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Frame>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    buf.clear();
    let mut content = 0usize;
    loop {
        let (used, done) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(match content {
                    0 => Frame::Eof,
                    n if n > limit => Frame::Oversized(n),
                    _ => Frame::Complete,
                });
            }
            let (used, done) = match chunk.iter().position(|b| *b == b'\n') {
                Some(at) => (at + 1, true),
                None => (chunk.len(), false),
            };
            content += if done { used - 1 } else { used };
            if content <= limit {
                buf.extend_from_slice(&chunk[..used]);
            } else {
                buf.clear();
            }
            (used, done)
        };
        reader.consume(used);
        if done {
            return Ok(if content > limit {
                Frame::Oversized(content)
            } else {
                Frame::Complete
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::data_from;

    #[test]
    fn test_call_wire_roundtrip() {
        let call = Call::Create {
            record: NewRecord::new("users", data_from(json!({"firstName": "Ada", "user_id": 1})))
                .with_id("u1"),
        };
        let (command, params) = call.to_wire().unwrap();
        assert_eq!(command, "create");
        assert_eq!(params["record"]["data"]["first_name"], json!("Ada"));
        assert_eq!(params["record"]["data"]["user__id"], json!(1));
        assert_eq!(Call::from_wire(&command, params).unwrap(), call);
    }

    #[test]
    fn test_empty_params_calls() {
        let (command, params) = Call::ListCollections {}.to_wire().unwrap();
        assert_eq!(command, "list_collections");
        assert_eq!(Call::from_wire(&command, params).unwrap().name(), "list_collections");
        assert_eq!(Call::from_wire("cleanup", Value::Null).unwrap(), Call::Cleanup {});
    }

    #[test]
    fn test_unknown_command_is_validation_error() {
        assert!(matches!(
            Call::from_wire("drop_everything", json!({})),
            Err(ValidationError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_response_roundtrip() {
        let ok = WireResponse::from_result(1, Ok(json!({"totalCount": 2})));
        assert_eq!(ok.data["total_count"], json!(2));
        let back: Value = ok.into_result().unwrap();
        assert_eq!(back["totalCount"], json!(2));

        let none = WireResponse::from_result(2, Ok(Value::Null));
        let decoded: Option<crate::record::Record> = none.into_result().unwrap();
        assert!(decoded.is_none());

        let err = WireResponse::from_result(3, Err(StorageError::not_found("users", "x")));
        let frame = encode_frame(&err).unwrap();
        let parsed: WireResponse = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert!(parsed.into_result::<Value>().unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_oversized_frame_is_skipped_without_buffering() {
        let long = "x".repeat(64);
        let stream = format!("{{\"a\":1}}\n{long}\n{{\"b\":2}}\ntail");
        let mut reader = tokio::io::BufReader::with_capacity(8, stream.as_bytes());
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), Frame::Complete);
        assert_eq!(buf, b"{\"a\":1}\n");

        assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), Frame::Oversized(64));
        assert!(buf.len() <= 17);

        assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), Frame::Complete);
        let value: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["b"], json!(2));

        assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), Frame::Complete);
        assert_eq!(buf, b"tail");
        assert_eq!(read_frame(&mut reader, &mut buf, 16).await.unwrap(), Frame::Eof);
    }
}
