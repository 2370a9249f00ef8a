//! # Log Record Codec
//!
//! Defines the **on-disk record format** shared by every segment file and the
//! encode/decode/verify routines for it. A record is self-describing: the
//! fixed 16-byte header carries everything needed to read the rest of the
//! record and to validate its integrity.
//!
//! # On-disk layout
//!
//! ```text
//! [CRC32_LE:4][TIMESTAMP_LE:8][KIND:1][KEY_SIZE:1][VALUE_SIZE_LE:2][KEY_LE:4][VALUE:n]
//! |<-------------------- header (16 bytes) --------------------->|<-- payload ------>|
//! ```
//!
//! - **CRC32** — checksum over every byte of the record *after* the checksum
//!   field itself (header remainder + key + value).
//! - **TIMESTAMP** — microseconds since the UNIX epoch, assigned at write time.
//! - **KIND** — `0` for a write, `1` for a delete tombstone.
//! - **KEY_SIZE** — constant `4`; keys are fixed-width 32-bit signed integers.
//! - **VALUE_SIZE** — length of the value in bytes; a tombstone carries `0`.
//!
//! There is no record-length field: the total size is derivable from the
//! header, and records sit back-to-back in a segment with no padding.
//!
//! # Guarantees
//!
//! - **Integrity:** a single flipped bit anywhere outside the checksum field
//!   makes [`RecordHeader::verify`] fail.
//! - **Fixed header:** decoding touches exactly [`LOG_HEADER_SIZE`] bytes and
//!   never reads past them.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of the checksum field in bytes.
pub const CHECKSUM_SIZE: usize = size_of::<u32>();

/// Size of the fixed record header: checksum + timestamp + kind + key size + value size.
pub const LOG_HEADER_SIZE: usize =
    CHECKSUM_SIZE + size_of::<i64>() + size_of::<u8>() + size_of::<u8>() + size_of::<u16>();

/// Keys are fixed-width 32-bit signed integers.
pub const KEY_SIZE: usize = size_of::<i32>();

// ------------------------------------------------------------------------------------------------
// Key type
// ------------------------------------------------------------------------------------------------

/// The key type of the store: a fixed-width 4-byte signed integer.
pub type Key = i32;

// ------------------------------------------------------------------------------------------------
// Record kind
// ------------------------------------------------------------------------------------------------

/// Discriminates live writes from delete tombstones in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// A live key-value pair.
    Write = 0,
    /// A tombstone: the key is deleted as of this point in the log.
    Delete = 1,
}

impl RecordKind {
    /// Maps the on-disk kind byte back to a [`RecordKind`].
    ///
    /// Returns `None` for an unknown byte, which can only appear through
    /// corruption — the caller reports it as a corrupt record.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(RecordKind::Write),
            1 => Some(RecordKind::Delete),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Record header
// ------------------------------------------------------------------------------------------------

/// The decoded fixed-size prefix of a log record.
///
/// Produced by [`RecordHeader::decode`]; carries enough to size the payload
/// read and to verify the whole record afterwards.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    /// CRC32 over the header remainder, key, and value.
    pub checksum: u32,

    /// Microseconds since the UNIX epoch at write time.
    pub timestamp: i64,

    /// Write or delete.
    pub kind: RecordKind,

    /// Key width in bytes; always [`KEY_SIZE`].
    pub key_size: u8,

    /// Value length in bytes.
    pub value_size: u16,
}

impl RecordHeader {
    /// Parses the fixed 16-byte prefix. Does not touch key or value bytes.
    ///
    /// Returns `None` if the kind byte or the key-size byte is not one this
    /// codec ever writes; both indicate a corrupt header.
    pub fn decode(buf: &[u8; LOG_HEADER_SIZE]) -> Option<Self> {
        let checksum = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let timestamp = i64::from_le_bytes([
            buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
        ]);
        let kind = RecordKind::from_byte(buf[12])?;
        let key_size = buf[13];
        let value_size = u16::from_le_bytes([buf[14], buf[15]]);

        if key_size as usize != KEY_SIZE {
            return None;
        }

        Some(Self {
            checksum,
            timestamp,
            kind,
            key_size,
            value_size,
        })
    }

    /// Recomputes the checksum over the reconstructed header-minus-checksum
    /// plus key and value bytes, and compares it to the stored checksum.
    pub fn verify(&self, key: Key, value: &[u8]) -> bool {
        let mut hasher = Crc32::new();
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&[self.kind as u8, self.key_size]);
        hasher.update(&self.value_size.to_le_bytes());
        hasher.update(&key.to_le_bytes());
        hasher.update(value);
        hasher.finalize() == self.checksum
    }

    /// Total record size implied by this header: header + key + value.
    pub fn total_size(&self) -> usize {
        LOG_HEADER_SIZE + self.key_size as usize + self.value_size as usize
    }
}

// ------------------------------------------------------------------------------------------------
// Log record
// ------------------------------------------------------------------------------------------------

/// One decoded log record: a write or a tombstone for a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Microseconds since the UNIX epoch at write time.
    pub timestamp: i64,

    /// Write or delete.
    pub kind: RecordKind,

    /// The record key.
    pub key: Key,

    /// The record value; empty for a tombstone.
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Creates a record. Value size limits are the write path's concern,
    /// not the codec's; callers validate before constructing.
    pub fn new(key: Key, value: Vec<u8>, kind: RecordKind, timestamp: i64) -> Self {
        Self {
            timestamp,
            kind,
            key,
            value,
        }
    }

    /// Creates a delete tombstone for `key` (empty value).
    pub fn tombstone(key: Key, timestamp: i64) -> Self {
        Self::new(key, Vec::new(), RecordKind::Delete, timestamp)
    }

    /// Encoded size of this record: header + key + value.
    pub fn total_size(&self) -> usize {
        LOG_HEADER_SIZE + KEY_SIZE + self.value.len()
    }

    /// Serializes the record into the on-disk layout, computing the
    /// checksum over everything after the checksum field.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());

        buf.extend_from_slice(&[0u8; CHECKSUM_SIZE]);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(KEY_SIZE as u8);
        buf.extend_from_slice(&(self.value.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.key.to_le_bytes());
        buf.extend_from_slice(&self.value);

        let mut hasher = Crc32::new();
        hasher.update(&buf[CHECKSUM_SIZE..]);
        let checksum = hasher.finalize();
        buf[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());

        buf
    }
}

// ------------------------------------------------------------------------------------------------
// Clock
// ------------------------------------------------------------------------------------------------

/// Current wall-clock time in microseconds since the UNIX epoch.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_micros() as i64
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Hex-dump wrapper for trace-level logging of raw record bytes.
pub(crate) struct HexBytes<'a>(pub &'a [u8]);

impl std::fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
