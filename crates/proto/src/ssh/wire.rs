//! SSH wire-format primitives (RFC 4251 Section 5).
//!
//! Every SSH message is assembled from a small set of typed fields:
//! `byte`, `boolean`, `uint32`, `uint64`, `string`, `mpint` and `name-list`.
//! The codec modules in this crate share these helpers instead of repeating
//! them per message.
//!
//! Readers take a `&[u8]` plus a cursor offset and advance it; any
//! out-of-bounds access is a [`TetherError::Protocol`] failure, never a
//! panic.

use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

/// Writes an SSH `string` field (uint32 length + bytes).
pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Writes an SSH `string` field holding raw bytes.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes an SSH `boolean` field.
pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(if v { 1 } else { 0 });
}

/// Writes an SSH `name-list`: a string of comma-separated names.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, &names.join(","));
}

/// Writes an SSH `mpint` field.
///
/// Leading zero octets are stripped; if the most significant bit of the
/// first remaining octet is set, a zero octet is prepended so the value
/// stays non-negative. Zero is encoded as a zero-length string.
pub fn put_mpint(buf: &mut BytesMut, data: &[u8]) {
    let first = data.iter().position(|&b| b != 0);
    match first {
        None => buf.put_u32(0),
        Some(start) => {
            let trimmed = &data[start..];
            let pad = trimmed[0] & 0x80 != 0;
            buf.put_u32((trimmed.len() + usize::from(pad)) as u32);
            if pad {
                buf.put_u8(0);
            }
            buf.put_slice(trimmed);
        }
    }
}

/// Encodes an `mpint` as a standalone byte vector (for hashing).
pub fn encode_mpint(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_mpint(&mut buf, data);
    buf.to_vec()
}

/// Reads an SSH `uint32` at `offset`, advancing it.
pub fn read_u32(data: &[u8], offset: &mut usize) -> TetherResult<u32> {
    if *offset + 4 > data.len() {
        return Err(TetherError::Protocol(format!(
            "Cannot read u32 at offset {}",
            offset
        )));
    }
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads an SSH `uint64` at `offset`, advancing it.
pub fn read_u64(data: &[u8], offset: &mut usize) -> TetherResult<u64> {
    if *offset + 8 > data.len() {
        return Err(TetherError::Protocol(format!(
            "Cannot read u64 at offset {}",
            offset
        )));
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(be))
}

/// Reads an SSH `boolean` at `offset`, advancing it.
pub fn read_bool(data: &[u8], offset: &mut usize) -> TetherResult<bool> {
    if *offset >= data.len() {
        return Err(TetherError::Protocol(format!(
            "Cannot read boolean at offset {}",
            offset
        )));
    }
    let v = data[*offset] != 0;
    *offset += 1;
    Ok(v)
}

/// Reads an SSH `string` field as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> TetherResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;
    if *offset + length > data.len() {
        return Err(TetherError::Protocol(format!(
            "String truncated: expected {} bytes at offset {}",
            length, offset
        )));
    }
    let bytes = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(bytes)
}

/// Reads an SSH `string` field as UTF-8 text.
pub fn read_string(data: &[u8], offset: &mut usize) -> TetherResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| TetherError::Protocol("String contains invalid UTF-8".to_string()))
}

/// Reads an SSH `name-list` field.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> TetherResult<Vec<String>> {
    let s = read_string(data, offset)?;
    if s.is_empty() {
        return Ok(Vec::new());
    }
    Ok(s.split(',').map(String::from).collect())
}

/// Reads an SSH `mpint` field, returning the magnitude bytes (no sign octet).
pub fn read_mpint(data: &[u8], offset: &mut usize) -> TetherResult<Vec<u8>> {
    let bytes = read_bytes(data, offset)?;
    if bytes.first() == Some(&0) {
        Ok(bytes[1..].to_vec())
    } else {
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "ssh-ed25519");
        let data = buf.to_vec();

        let mut offset = 0;
        assert_eq!(read_string(&data, &mut offset).unwrap(), "ssh-ed25519");
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_u64_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_u64(u64::MAX);
        let mut offset = 0;
        assert_eq!(read_u64(&buf, &mut offset).unwrap(), u64::MAX);
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec!["curve25519-sha256".to_string(), "ssh-ed25519".to_string()];
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &names);

        let mut offset = 0;
        assert_eq!(read_name_list(&buf, &mut offset).unwrap(), names);
    }

    #[test]
    fn test_empty_name_list() {
        let mut buf = BytesMut::new();
        put_name_list(&mut buf, &[]);
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        // Zero encodes as length 0
        assert_eq!(encode_mpint(&[]), vec![0, 0, 0, 0]);
        assert_eq!(encode_mpint(&[0, 0]), vec![0, 0, 0, 0]);

        // No high bit: value as-is
        assert_eq!(encode_mpint(&[0x12, 0x34]), vec![0, 0, 0, 2, 0x12, 0x34]);

        // High bit set: zero octet prepended
        assert_eq!(encode_mpint(&[0x80, 0x00]), vec![0, 0, 0, 3, 0, 0x80, 0x00]);

        // Leading zeros stripped
        assert_eq!(
            encode_mpint(&[0x00, 0x00, 0x12, 0x34]),
            vec![0, 0, 0, 2, 0x12, 0x34]
        );
    }

    #[test]
    fn test_mpint_round_trip() {
        let value = [0x9a, 0x37, 0x8f, 0x9b];
        let encoded = encode_mpint(&value);
        let mut offset = 0;
        assert_eq!(read_mpint(&encoded, &mut offset).unwrap(), value);
    }

    #[test]
    fn test_truncated_reads_fail() {
        let data = [0, 0, 0, 9, b'x'];
        let mut offset = 0;
        assert!(read_bytes(&data, &mut offset).is_err());

        let mut offset = 0;
        assert!(read_u64(&data, &mut offset).is_err());
    }
}
