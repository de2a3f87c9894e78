//! Snapshot codec for collection files.
//!
//! A collection file is a header followed by exactly one framed entry:
//!
//! ```text
//! [magic: 4 bytes "PSTR"][version: 1 byte]
//! [length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying polystore collection files.
pub const MAGIC: [u8; 4] = *b"PSTR";

/// Largest snapshot accepted on read.
const MAX_ENTRY_SIZE: usize = 512 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes a value into one checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len()).map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("snapshot of {} bytes is too large to frame", data.len()),
        )
    })?;

    let mut out = Vec::with_capacity(4 + data.len() + 4);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Reads one frame, verifying its checksum.
///
/// # Errors
/// - the checksum does not match (corruption)
/// - the frame claims more than the maximum size
/// - the payload does not deserialize
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }
    Ok(())
}

/// Header plus frame, ready to write to disk.
pub fn encode_file<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out)?;
    out.extend_from_slice(&encode(value)?);
    Ok(out)
}

/// Inverse of [`encode_file`].
pub fn decode_file<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    read_header(reader)?;
    decode(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_file_roundtrip() {
        let value = serde_json::json!({"records": [{"id": "a"}]});
        let bytes = encode_file(&value).unwrap();
        let decoded: serde_json::Value = decode_file(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_detects_corruption() {
        let mut bytes = encode_file(&"test data".to_string()).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        let err = decode_file::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let mut bad = Vec::new();
        write_header(&mut bad).unwrap();
        bad.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_file::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let err = decode_file::<String>(&mut Cursor::new(b"KYRO\x01".to_vec())).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn test_truncated_file_fails() {
        let bytes = encode_file(&"hello".to_string()).unwrap();
        let err = decode_file::<String>(&mut Cursor::new(&bytes[..bytes.len() - 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
