//! The record codec. A record is one log entry: a fixed 20-byte header
//! followed by the raw key and value bytes, with no padding or alignment:
//!
//! - Checksum as little-endian u32: CRC-32 over the rest of the record.
//! - Timestamp as little-endian u64: wall-clock seconds at write time.
//! - Key length as little-endian u32.
//! - Value length as little-endian u32, or u32::MAX for tombstones.
//! - Key as raw bytes (max 4 GB).
//! - Value as raw bytes (max 4 GB), absent for tombstones.
//!
//! Deletions are marked in the header rather than by a reserved value, so no
//! user value can collide with the tombstone marker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::errcorrupt;
use crate::error::Result;

/// The encoded size of a record header.
pub const RECORD_HEADER_SIZE: usize = 20;

/// The value length stored in tombstone headers. Tombstones carry no value
/// bytes.
const TOMBSTONE_VALUE_LEN: u32 = u32::MAX;

/// The last timestamp handed out by [`next_tstamp`].
static LAST_TSTAMP: AtomicU64 = AtomicU64::new(0);

/// Returns the current wall-clock time in seconds, nudged forward where
/// necessary so that no two calls in this process return the same value.
/// Newest-record-wins resolution depends on a set and a subsequent delete
/// never sharing a timestamp.
pub(crate) fn next_tstamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |since_epoch| since_epoch.as_secs());
    let mut last = LAST_TSTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TSTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// A single log record. A `None` value marks a deletion (tombstone).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Wall-clock seconds at write time.
    pub tstamp: u64,
    /// The key, as raw bytes.
    pub key: Vec<u8>,
    /// The value, as raw bytes, or None for tombstones.
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// Creates a record for the given key and value, stamped with the current
    /// wall-clock time. A `None` value creates a tombstone.
    pub fn new(key: &[u8], value: Option<&[u8]>) -> Self {
        Self { tstamp: next_tstamp(), key: key.to_vec(), value: value.map(|v| v.to_vec()) }
    }

    /// Returns true if this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// The encoded size of this record in bytes.
    pub fn size(&self) -> u32 {
        let value_len = self.value.as_ref().map_or(0, Vec::len);
        RECORD_HEADER_SIZE as u32 + self.key.len() as u32 + value_len as u32
    }

    /// Serializes the record. The checksum covers everything after the
    /// checksum field itself.
    pub fn encode(&self) -> Vec<u8> {
        let value_len = match &self.value {
            Some(value) => value.len() as u32,
            None => TOMBSTONE_VALUE_LEN,
        };
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&[0u8; 4]); // checksum placeholder
        buf.extend_from_slice(&self.tstamp.to_le_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        if let Some(value) = &self.value {
            buf.extend_from_slice(value);
        }
        let crc = crc32fast::hash(&buf[4..]);
        buf[..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserializes a record from a buffer holding exactly one encoded
    /// record. Fails if the buffer is shorter than a header, if the declared
    /// sizes disagree with the buffer length, or if the checksum does not
    /// match.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            errcorrupt!("record header truncated ({} of {RECORD_HEADER_SIZE} bytes)", buf.len());
        }
        let crc = u32::from_le_bytes(buf[0..4].try_into().expect("slice length mismatch"));
        let tstamp = u64::from_le_bytes(buf[4..12].try_into().expect("slice length mismatch"));
        let key_len = u32::from_le_bytes(buf[12..16].try_into().expect("slice length mismatch"));
        let value_len = u32::from_le_bytes(buf[16..20].try_into().expect("slice length mismatch"));

        let (tombstone, body_value_len) = match value_len {
            TOMBSTONE_VALUE_LEN => (true, 0),
            len => (false, len),
        };
        let expected = RECORD_HEADER_SIZE as u64 + key_len as u64 + body_value_len as u64;
        if buf.len() as u64 != expected {
            errcorrupt!("record length mismatch (expected {expected} bytes, got {})", buf.len());
        }
        if crc != crc32fast::hash(&buf[4..]) {
            errcorrupt!("record checksum mismatch");
        }

        let key_end = RECORD_HEADER_SIZE + key_len as usize;
        let key = buf[RECORD_HEADER_SIZE..key_end].to_vec();
        let value = if tombstone { None } else { Some(buf[key_end..].to_vec()) };
        Ok(Self { tstamp, key, value })
    }
}

/// Parses the key and on-disk value sizes from an encoded record header.
/// Tombstones store no value bytes regardless of the header field.
pub(crate) fn body_sizes(header: &[u8; RECORD_HEADER_SIZE]) -> (u32, u32) {
    let key_len = u32::from_le_bytes(header[12..16].try_into().expect("slice length mismatch"));
    let value_len = match u32::from_le_bytes(header[16..20].try_into().expect("slice length mismatch")) {
        TOMBSTONE_VALUE_LEN => 0,
        len => len,
    };
    (key_len, value_len)
}
