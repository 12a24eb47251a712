//! Record framing for the data files
//!
//! Every record is `| key_len: u32 BE | value_len: u32 BE | key bytes |
//! value bytes |`. Key bytes are the UTF-8 encoding of the key string;
//! value bytes come from the host codec. A record with `value_len == 0` is
//! a tombstone marking key removal.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the two length fields preceding every record payload
pub const HEADER_LEN: u64 = 8;

/// Largest accepted serialized key
pub const MAX_KEY_LEN: u32 = 1_000_000;

/// Largest accepted serialized value
pub const MAX_VALUE_LEN: u32 = 10_000_000;

/// Lengths read from a record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub key_len: u32,
    pub value_len: u32,
}

impl RecordHeader {
    /// Combined length of the key and value bytes
    pub fn payload_len(&self) -> u64 {
        self.key_len as u64 + self.value_len as u64
    }
}

/// Frames `key` and `value` into a record; `None` produces a tombstone.
///
/// Records that would not fit into a single data file are rejected with
/// [`Error::TooBig`].
pub fn encode(key: &str, value: Option<&[u8]>, max_record_len: u64) -> Result<Bytes> {
    let key_bytes = key.as_bytes();
    if key_bytes.is_empty() {
        return Err(Error::Corrupt("empty key".to_string()));
    }
    let value_bytes = value.unwrap_or(&[]);
    let total = HEADER_LEN + key_bytes.len() as u64 + value_bytes.len() as u64;
    if total >= max_record_len {
        return Err(Error::TooBig {
            size: total,
            max: max_record_len,
        });
    }

    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_u32(key_bytes.len() as u32);
    buf.put_u32(value_bytes.len() as u32);
    buf.put_slice(key_bytes);
    buf.put_slice(value_bytes);
    Ok(buf.freeze())
}

/// Reads and validates a record header.
pub fn read_header(reader: &mut impl Read) -> Result<RecordHeader> {
    let mut raw = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut raw)?;
    let key_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let value_len = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);

    if key_len < 1 || key_len > MAX_KEY_LEN {
        return Err(Error::Corrupt(format!("illegal key size: {key_len}")));
    }
    if value_len > MAX_VALUE_LEN {
        return Err(Error::Corrupt(format!("illegal value size: {value_len}")));
    }
    Ok(RecordHeader { key_len, value_len })
}

/// Decodes key bytes back into the key string.
pub fn decode_key(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Corrupt(format!("key is not valid UTF-8: {e}")))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let record = encode("key", Some(b"value"), 1000).unwrap();
        assert_eq!(&record[0..4], &3u32.to_be_bytes());
        assert_eq!(&record[4..8], &5u32.to_be_bytes());
        assert_eq!(&record[8..11], b"key");
        assert_eq!(&record[11..], b"value");
    }

    #[test]
    fn test_header_round_trip() {
        let record = encode("key", Some(b"value"), 1000).unwrap();
        let header = read_header(&mut &record[..]).unwrap();
        assert_eq!(
            header,
            RecordHeader {
                key_len: 3,
                value_len: 5
            }
        );
        assert_eq!(header.payload_len(), 8);
        assert_eq!(decode_key(&record[8..11]).unwrap(), "key");
    }

    #[test]
    fn test_tombstone_has_zero_value_len() {
        let record = encode("gone", None, 1000).unwrap();
        let header = read_header(&mut &record[..]).unwrap();
        assert_eq!(header.value_len, 0);
        assert_eq!(record.len() as u64, HEADER_LEN + 4);
    }

    #[test]
    fn test_too_big_record_rejected() {
        let err = encode("key", Some(&[0u8; 300]), 300).unwrap_err();
        assert!(matches!(err, Error::TooBig { size: 311, max: 300 }));
        // a record exactly at the limit is rejected too
        assert!(encode("key", Some(&[0u8; 289]), 300).is_err());
        assert!(encode("key", Some(&[0u8; 288]), 300).is_ok());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(encode("", Some(b"v"), 1000), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_zero_key_len_is_corrupt() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&5u32.to_be_bytes());
        assert!(matches!(
            read_header(&mut raw.as_slice()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_lengths_are_corrupt() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(MAX_KEY_LEN + 1).to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        assert!(read_header(&mut raw.as_slice()).is_err());

        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_be_bytes());
        raw.extend_from_slice(&(MAX_VALUE_LEN + 1).to_be_bytes());
        assert!(read_header(&mut raw.as_slice()).is_err());
    }

    #[test]
    fn test_truncated_header_is_an_io_error() {
        let raw = [0u8; 4];
        assert!(matches!(
            read_header(&mut &raw[..]),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_decode_key_rejects_invalid_utf8() {
        assert!(matches!(decode_key(&[0xff, 0xfe]), Err(Error::Corrupt(_))));
    }
}
