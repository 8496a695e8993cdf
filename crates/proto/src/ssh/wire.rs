//! SSH wire encoding primitives (RFC 4251 Section 5).
//!
//! Every SSH message is built from a small set of data types:
//!
//! - `byte`, `boolean`
//! - `uint32`, `uint64` (big-endian)
//! - `string` (uint32 length + opaque bytes)
//! - `name-list` (uint32 length + comma-separated ASCII names)
//! - `mpint` (uint32 length + two's-complement big-endian integer,
//!   shortest form, positive values zero-padded when the high bit is set)
//!
//! Readers take a `(data, &mut offset)` pair and fail with
//! [`SkiffError::MalformedPacket`] on truncation or a length field that
//! exceeds the remaining input. Writers append to a [`BytesMut`].

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SkiffResult<u8> {
    if *offset >= data.len() {
        return Err(SkiffError::MalformedPacket(format!(
            "cannot read byte at offset {}",
            offset
        )));
    }
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

/// Reads a boolean (any non-zero byte is true).
pub fn read_bool(data: &[u8], offset: &mut usize) -> SkiffResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a big-endian uint32.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SkiffResult<u32> {
    if *offset + 4 > data.len() {
        return Err(SkiffError::MalformedPacket(format!(
            "cannot read uint32 at offset {}",
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

/// Reads a big-endian uint64.
pub fn read_u64(data: &[u8], offset: &mut usize) -> SkiffResult<u64> {
    if *offset + 8 > data.len() {
        return Err(SkiffError::MalformedPacket(format!(
            "cannot read uint64 at offset {}",
            offset
        )));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

/// Reads a length-prefixed opaque byte string.
pub fn read_string(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let length = read_u32(data, offset)? as usize;
    if *offset + length > data.len() {
        return Err(SkiffError::MalformedPacket(format!(
            "string length {} exceeds remaining {} bytes",
            length,
            data.len() - *offset
        )));
    }
    let value = data[*offset..*offset + length].to_vec();
    *offset += length;
    Ok(value)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_utf8(data: &[u8], offset: &mut usize) -> SkiffResult<String> {
    let bytes = read_string(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SkiffError::MalformedPacket("string is not valid UTF-8".to_string()))
}

/// Reads a name-list: a string of comma-separated names.
///
/// An empty string yields an empty list. Empty names produced by adjacent
/// commas are preserved; selection logic never matches them.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let bytes = read_string(data, offset)?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| SkiffError::MalformedPacket("name-list is not valid ASCII".to_string()))?;
    if text.is_empty() {
        Ok(vec![])
    } else {
        Ok(text.split(',').map(String::from).collect())
    }
}

/// Reads an mpint and returns its big-endian magnitude.
///
/// The sign-padding zero byte is stripped. Negative values are rejected:
/// no SSH transport field carries one.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let bytes = read_string(data, offset)?;
    if bytes.is_empty() {
        return Ok(vec![]);
    }
    if bytes[0] & 0x80 != 0 {
        return Err(SkiffError::MalformedPacket(
            "negative mpint".to_string(),
        ));
    }
    let magnitude: Vec<u8> = bytes.iter().skip_while(|&&b| b == 0).copied().collect();
    Ok(magnitude)
}

/// Writes a single byte.
pub fn write_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

/// Writes a boolean.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a big-endian uint32.
pub fn write_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Writes a big-endian uint64.
pub fn write_u64(buf: &mut BytesMut, value: u64) {
    buf.put_u64(value);
}

/// Writes a length-prefixed opaque byte string.
pub fn write_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_utf8(buf: &mut BytesMut, value: &str) {
    write_string(buf, value.as_bytes());
}

/// Writes a name-list.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    let list = names.join(",");
    write_string(buf, list.as_bytes());
}

/// Writes an mpint from a big-endian magnitude.
///
/// Leading zeros are stripped; a zero byte is prepended when the high bit
/// of the first magnitude byte is set, keeping the value positive.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let trimmed: &[u8] = {
        let mut m = magnitude;
        while !m.is_empty() && m[0] == 0 {
            m = &m[1..];
        }
        m
    };

    if trimmed.is_empty() {
        buf.put_u32(0);
        return;
    }

    let pad = trimmed[0] & 0x80 != 0;
    buf.put_u32((trimmed.len() + usize::from(pad)) as u32);
    if pad {
        buf.put_u8(0);
    }
    buf.put_slice(trimmed);
}

/// Returns the mpint encoding of a big-endian magnitude as a standalone
/// byte vector, for exchange-hash and key-derivation input.
pub fn mpint_bytes(magnitude: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_mpint(&mut buf, magnitude);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip() {
        let mut buf = BytesMut::new();
        write_u32(&mut buf, 0xdead_beef);
        let mut offset = 0;
        assert_eq!(read_u32(&buf, &mut offset).unwrap(), 0xdead_beef);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_u64_round_trip() {
        let mut buf = BytesMut::new();
        write_u64(&mut buf, 0x0123_4567_89ab_cdef);
        let mut offset = 0;
        assert_eq!(read_u64(&buf, &mut offset).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, b"ssh-ed25519");
        let mut offset = 0;
        assert_eq!(read_string(&buf, &mut offset).unwrap(), b"ssh-ed25519");
    }

    #[test]
    fn test_string_truncated() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut offset = 0;
        let result = read_string(&data, &mut offset);
        assert!(matches!(result, Err(SkiffError::MalformedPacket(_))));
    }

    #[test]
    fn test_string_length_overflow() {
        // Length close to u32::MAX must not wrap the bounds check.
        let data = [0xff, 0xff, 0xff, 0xfe, 1, 2, 3];
        let mut offset = 0;
        assert!(read_string(&data, &mut offset).is_err());
    }

    #[test]
    fn test_name_list_round_trip() {
        let names = vec![
            "curve25519-sha256".to_string(),
            "ecdh-sha2-nistp256".to_string(),
        ];
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &names);
        let mut offset = 0;
        assert_eq!(read_name_list(&buf, &mut offset).unwrap(), names);
    }

    #[test]
    fn test_name_list_empty() {
        let mut buf = BytesMut::new();
        write_name_list(&mut buf, &[]);
        let mut offset = 0;
        assert!(read_name_list(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_name_list_trailing_comma() {
        // "a,," parses to ["a", "", ""]; the final comma is not special.
        let mut buf = BytesMut::new();
        write_string(&mut buf, b"a,,");
        let mut offset = 0;
        let names = read_name_list(&buf, &mut offset).unwrap();
        assert_eq!(names, vec!["a".to_string(), String::new(), String::new()]);
    }

    #[test]
    fn test_mpint_zero() {
        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut offset = 0;
        assert!(read_mpint(&buf, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn test_mpint_high_bit_padding() {
        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0, 0x80, 0x01]);

        let mut offset = 0;
        assert_eq!(read_mpint(&buf, &mut offset).unwrap(), vec![0x80, 0x01]);
    }

    #[test]
    fn test_mpint_strips_leading_zeros() {
        let mut buf = BytesMut::new();
        write_mpint(&mut buf, &[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x12, 0x34]);
    }

    #[test]
    fn test_mpint_negative_rejected() {
        let data = [0, 0, 0, 1, 0x80];
        let mut offset = 0;
        assert!(matches!(
            read_mpint(&data, &mut offset),
            Err(SkiffError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_bool_round_trip() {
        let mut buf = BytesMut::new();
        write_bool(&mut buf, true);
        write_bool(&mut buf, false);
        let mut offset = 0;
        assert!(read_bool(&buf, &mut offset).unwrap());
        assert!(!read_bool(&buf, &mut offset).unwrap());
    }
}
