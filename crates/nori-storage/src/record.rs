//! On-disk record framing.
//!
//! A record is the atomic unit written to a segment file:
//!
//! ```text
//! | crc (8, BE) | key_len (4, BE) | value_len (4, BE) | tombstone (1) | key | value |
//! ```
//!
//! The CRC covers everything after itself: `key_len ‖ value_len ‖ tombstone ‖
//! key ‖ value`. It is a plain IEEE CRC-32, stored zero-extended into the
//! 8-byte field so the header stays fixed-width regardless of checksum width.

use crate::error::RecordError;
use bytes::Bytes;
use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub const HEADER_LEN: usize = 8 + 4 + 4 + 1;

/// A single key/value record, or a tombstone marking a key deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    pub tombstone: bool,
}

impl Record {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            tombstone: false,
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            tombstone: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let value_len = if self.tombstone { 0 } else { self.value.len() };
        let mut payload = Vec::with_capacity(HEADER_LEN - 8 + self.key.len() + value_len);
        payload.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        payload.extend_from_slice(&(value_len as u32).to_be_bytes());
        payload.push(u8::from(self.tombstone));
        payload.extend_from_slice(&self.key);
        if !self.tombstone {
            payload.extend_from_slice(&self.value);
        }

        let crc = u64::from(CRC32.checksum(&payload));
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes a record from the front of `buf`, returning the record and
    /// the number of bytes it consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RecordError> {
        if buf.len() < HEADER_LEN {
            return Err(RecordError::ShortRead {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }

        let expected_crc = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let key_len = u32::from_be_bytes(buf[8..12].try_into().unwrap()) as usize;
        let value_len = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        let tombstone = buf[16] != 0;

        let body_len = key_len + if tombstone { 0 } else { value_len };
        let total = HEADER_LEN + body_len;
        if buf.len() < total {
            return Err(RecordError::ShortRead {
                needed: total,
                got: buf.len(),
            });
        }

        let payload = &buf[8..total];
        let actual_crc = u64::from(CRC32.checksum(payload));
        if actual_crc != expected_crc {
            return Err(RecordError::CrcMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let key = Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + key_len]);
        let value = if tombstone {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(&buf[HEADER_LEN + key_len..HEADER_LEN + key_len + value_len])
        };

        Ok((
            Record {
                key,
                value,
                tombstone,
            },
            total,
        ))
    }
}
