//! # Segment Files
//!
//! A segment is one **append-only** data file in the store directory. Records
//! are written back-to-back with no padding or framing beyond the record
//! header itself; reads are positioned (`pread`-style) and never move a shared
//! cursor.
//!
//! ## Design Overview
//!
//! Exactly one segment per store is *active* (opened read-write) at any time;
//! all others are *sealed* (reopened read-only at rotation and never written
//! again). The file name is derived from the segment id: `"<id>.data"`.
//!
//! # On-disk layout
//!
//! ```text
//! [RECORD][RECORD][RECORD]...
//! ```
//!
//! See the [record module](crate::record) for the record layout.
//!
//! # Concurrency model
//!
//! - `append` must only be called from the orchestrator's write-exclusive
//!   section; the write cursor is advanced only there.
//! - Reads take `&self` and use positioned I/O, so any number of threads may
//!   read concurrently with an in-flight append: offsets handed out by
//!   earlier appends point at bytes that are never rewritten.
//! - Sealed segments are immutable; reading them requires no coordination at
//!   all.
//!
//! # Guarantees
//!
//! - **Integrity:** every read recomputes the record checksum; a mismatch is
//!   reported as [`SegmentError::Corrupt`], never silently ignored.
//! - **Termination:** a read past the last complete record (including a torn
//!   trailing write) reports [`SegmentError::EndOfSegment`], the normal
//!   replay terminator.
//! - **Write completeness:** appends retry partial writes until the whole
//!   record is on the file; interrupted system calls are retried
//!   transparently.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{error, info, trace};

use crate::record::{HexBytes, KEY_SIZE, Key, LOG_HEADER_SIZE, LogRecord, RecordHeader};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File extension of segment files.
pub const SEGMENT_EXT: &str = "data";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data integrity failure — record checksum did not match, or the
    /// header bytes are not a well-formed record header.
    #[error("corrupt record in segment {segment_id} at offset {offset}")]
    Corrupt {
        /// Segment holding the corrupt record.
        segment_id: u32,
        /// Byte offset of the record within the segment.
        offset: u64,
    },

    /// Read past the last complete record. Internal replay terminator,
    /// never surfaced to users.
    #[error("end of segment")]
    EndOfSegment,
}

// ------------------------------------------------------------------------------------------------
// Path helpers
// ------------------------------------------------------------------------------------------------

/// Builds the on-disk path for segment `id` inside `dir`.
pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id}.{SEGMENT_EXT}"))
}

/// Parses a segment id from a file name if it matches `<id>.data` with a
/// positive decimal id. Returns `None` for anything else.
///
/// Only the canonical spelling is accepted — no sign, no leading zeros —
/// so that every recognised file name round-trips through
/// [`segment_path`].
pub fn parse_segment_id(name: &str) -> Option<u32> {
    let stem = name
        .strip_suffix(SEGMENT_EXT)
        .and_then(|s| s.strip_suffix('.'))?;
    if stem.is_empty() || stem.starts_with('0') || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u32>().ok()
}

// ------------------------------------------------------------------------------------------------
// Segment Core
// ------------------------------------------------------------------------------------------------

/// One append-only segment file.
///
/// See the [module-level documentation](self) for layout, concurrency, and
/// guarantees.
#[derive(Debug)]
pub struct Segment {
    /// Positive id; also the file stem.
    id: u32,

    /// Full path of the backing file.
    path: PathBuf,

    /// Open file handle; positioned I/O only, the OS cursor is unused.
    file: File,

    /// Sealed segments are opened read-only.
    read_only: bool,

    /// Current append cursor; equals the file length for sealed segments.
    /// Mutated only under the orchestrator's write-exclusive lock.
    write_pos: AtomicU64,
}

impl Segment {
    /// Opens (or in read-write mode, creates) the segment file for `id`
    /// inside `dir`.
    ///
    /// In read-write mode the write cursor is initialised to the current
    /// file length so that reopening an existing segment appends after its
    /// last record. In read-only mode the file must already exist.
    pub fn open(dir: &Path, id: u32, read_only: bool) -> Result<Self, SegmentError> {
        let path = segment_path(dir, id);

        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?
        };

        let size = file.metadata()?.len();

        info!(
            path = %path.display(),
            id,
            read_only,
            size,
            "opened segment"
        );

        Ok(Self {
            id,
            path,
            file,
            read_only,
            write_pos: AtomicU64::new(size),
        })
    }

    /// Segment id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this segment was opened read-only (sealed).
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current append cursor — the offset the next record would land at.
    pub fn current_size(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Appends an encoded record at the current cursor and returns the
    /// offset the record starts at.
    ///
    /// Partial writes are retried until the whole record is written;
    /// interrupted system calls are retried transparently. Must only be
    /// called from the orchestrator's write-exclusive section — the cursor
    /// is read and advanced without further synchronization.
    pub fn append(&self, encoded: &[u8]) -> Result<u64, SegmentError> {
        let offset = self.write_pos.load(Ordering::Acquire);

        trace!(
            segment_id = self.id,
            offset,
            len = encoded.len(),
            bytes = %HexBytes(encoded),
            "appending record"
        );

        self.file.write_all_at(encoded, offset)?;
        self.write_pos
            .store(offset + encoded.len() as u64, Ordering::Release);

        Ok(offset)
    }

    /// Forces all written bytes to stable storage (fsync).
    pub fn flush(&self) -> Result<(), SegmentError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Cuts the file back to `len` bytes and rewinds the cursor, dropping
    /// a torn trailing record found during replay. Only called at open,
    /// before the segment is shared.
    pub fn truncate_to(&self, len: u64) -> Result<(), SegmentError> {
        self.file.set_len(len)?;
        self.write_pos.store(len, Ordering::Release);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Reads the record starting at `offset` using two positioned reads:
    /// header first, then key+value sized from the header.
    ///
    /// Returns [`SegmentError::EndOfSegment`] when `offset` is at or past
    /// the end of the last complete record.
    pub fn read(&self, offset: u64) -> Result<LogRecord, SegmentError> {
        let mut header_buf = [0u8; LOG_HEADER_SIZE];
        self.read_exact_at(&mut header_buf, offset)?;

        let header = RecordHeader::decode(&header_buf).ok_or_else(|| {
            error!(segment_id = self.id, offset, "malformed record header");
            SegmentError::Corrupt {
                segment_id: self.id,
                offset,
            }
        })?;

        let payload_len = header.key_size as usize + header.value_size as usize;
        let mut payload = vec![0u8; payload_len];
        self.read_exact_at(&mut payload, offset + LOG_HEADER_SIZE as u64)?;

        self.decode_payload(offset, header, payload)
    }

    /// Reads the record starting at `offset` in a single positioned read,
    /// when the caller already knows the value size (from the index).
    pub fn read_with_size(&self, offset: u64, value_size: u16) -> Result<LogRecord, SegmentError> {
        let total = LOG_HEADER_SIZE + KEY_SIZE + value_size as usize;
        let mut buf = vec![0u8; total];
        self.read_exact_at(&mut buf, offset)?;

        let mut header_buf = [0u8; LOG_HEADER_SIZE];
        header_buf.copy_from_slice(&buf[..LOG_HEADER_SIZE]);
        let header = RecordHeader::decode(&header_buf).ok_or_else(|| {
            error!(segment_id = self.id, offset, "malformed record header");
            SegmentError::Corrupt {
                segment_id: self.id,
                offset,
            }
        })?;

        // A stored size that disagrees with the caller's means the bytes
        // read do not line up with one record.
        if header.value_size != value_size {
            error!(
                segment_id = self.id,
                offset,
                stored = header.value_size,
                expected = value_size,
                "record value size mismatch"
            );
            return Err(SegmentError::Corrupt {
                segment_id: self.id,
                offset,
            });
        }

        self.decode_payload(offset, header, buf.split_off(LOG_HEADER_SIZE))
    }

    /// Returns an iterator yielding `(offset, record)` for every record
    /// from offset 0 until the end of the segment.
    pub fn replay_iter(&self) -> SegmentIter<'_> {
        SegmentIter {
            segment: self,
            offset: 0,
            done: false,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Checksum-verifies and assembles a record from its decoded header
    /// and raw key+value payload.
    fn decode_payload(
        &self,
        offset: u64,
        header: RecordHeader,
        payload: Vec<u8>,
    ) -> Result<LogRecord, SegmentError> {
        let key = Key::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let value = payload[KEY_SIZE..].to_vec();

        if !header.verify(key, &value) {
            error!(segment_id = self.id, offset, key, "record checksum mismatch");
            return Err(SegmentError::Corrupt {
                segment_id: self.id,
                offset,
            });
        }

        trace!(
            segment_id = self.id,
            offset,
            key,
            value_len = value.len(),
            "read record"
        );

        Ok(LogRecord::new(key, value, header.kind, header.timestamp))
    }

    /// Positioned `read_exact`; a read that hits end-of-file before the
    /// buffer is full — including a zero-byte read — signals
    /// [`SegmentError::EndOfSegment`]. Interrupted system calls are retried
    /// by the underlying primitive.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), SegmentError> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SegmentError::EndOfSegment
            } else {
                SegmentError::Io(e)
            }
        })
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentIter
// ------------------------------------------------------------------------------------------------

/// Sequential record iterator over one segment, used for replay and merge.
///
/// Yields `(record_offset, record)` pairs; ends cleanly at
/// [`SegmentError::EndOfSegment`], which also covers a torn trailing write.
/// Any other error is yielded once, after which the iterator is exhausted.
pub struct SegmentIter<'a> {
    segment: &'a Segment,
    offset: u64,
    done: bool,
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<(u64, LogRecord), SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.segment.read(self.offset) {
            Ok(record) => {
                let offset = self.offset;
                self.offset += record.total_size() as u64;
                Some(Ok((offset, record)))
            }
            Err(SegmentError::EndOfSegment) => {
                trace!(segment_id = self.segment.id, "end of segment reached");
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
