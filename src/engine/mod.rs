//! # Log-Structured Storage Engine
//!
//! This module implements a **synchronous**, single-writer/multi-reader,
//! log-structured key-value engine: all writes append records to the active
//! segment file, and an in-memory [index](crate::index) maps every live key
//! to its newest record on disk.
//!
//! ## Design Overview
//!
//! A store is one flat directory of segment files plus a lock sentinel:
//!
//! ```text
//! store_dir/
//! ├── LOCK        process lock sentinel (created by read-write opens)
//! ├── 1.data      sealed segment (read-only)
//! ├── 2.data      sealed segment (read-only)
//! └── 3.data      active segment (highest id, append-only)
//! ```
//!
//! Exactly one segment — the highest-numbered — is active. When the next
//! record would push it past [`EngineConfig::max_file_size`], the engine
//! seals it (flush, reopen read-only) and starts a fresh segment with the
//! next id. Sealed segments are immutable until [`Engine::merge`] rewrites
//! them.
//!
//! On [`Engine::open`] every segment is replayed in ascending id order to
//! rebuild the index; within a segment, records replay in file order, so a
//! later write or tombstone for a key always supersedes an earlier one.
//!
//! ## Concurrency Model
//!
//! - One `RwLock` guards the segment table (active handle + sealed map).
//!   Its write side is the single writer-exclusive section: rotation, the
//!   append, and the index update of a `put`/`delete` all happen under it.
//! - The index carries its own lock (see [`crate::index`]); when both are
//!   held, the segment-table lock is always taken first.
//! - `get` never enters the writer-exclusive section: it looks up the
//!   index, briefly takes the table's read side to clone a segment handle,
//!   then reads with positioned I/O. Sealed bytes are immutable and active
//!   bytes at returned offsets are never rewritten, so no further
//!   coordination is needed.
//! - There are no background threads; every operation runs to completion
//!   on the calling thread.
//!
//! ## Guarantees
//!
//! - **Integrity:** every read verifies the record checksum; corruption is
//!   reported as [`EngineError::CorruptRecord`], never returned as data.
//! - **Last writer wins:** replay order (ascending segment id, ascending
//!   offset) equals write order, across any number of rotations.
//! - **No partial writes in the index:** the index is only updated after
//!   the append succeeded; a failed append leaves the index untouched.
//! - **Single writer:** a read-write open holds an OS-level lock on the
//!   store directory; a second read-write open fails fast with
//!   [`EngineError::StoreBusy`]. Read-only opens coexist freely.

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

mod merge;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::index::{HashIndex, Index, IndexError, LogPos};
use crate::lock::{FileLock, LockError};
use crate::record::{Key, LogRecord, RecordKind, now_micros};
use crate::segment::{Segment, SegmentError, parse_segment_id};

pub use crate::lock::LOCK_FILE;

/// Name of the staging sub-directory used by an in-flight merge.
pub const MERGE_DIR: &str = "merge";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key has no live value.
    #[error("key not found: {0}")]
    KeyNotFound(Key),

    /// Data integrity failure: a stored record's checksum did not match.
    #[error("corrupt record in segment {segment_id} at offset {offset}")]
    CorruptRecord {
        /// Segment holding the corrupt record.
        segment_id: u32,
        /// Byte offset of the record within the segment.
        offset: u64,
    },

    /// Another handle already holds the store's write lock.
    #[error("store is locked by another read-write handle")]
    StoreBusy,

    /// A mutating operation was called on a read-only store.
    #[error("store is open read-only")]
    ReadOnly,

    /// The value exceeds the configured size limit.
    #[error("value of {got} bytes exceeds the {max}-byte limit")]
    ValueTooLarge {
        /// Size of the rejected value.
        got: usize,
        /// Configured limit.
        max: usize,
    },

    /// A read-only open found no segments to serve reads from.
    #[error("no segments in read-only store: {path}")]
    EmptyStore {
        /// The store directory.
        path: PathBuf,
    },

    /// The store directory contains a file that is neither the lock
    /// sentinel nor a well-formed segment.
    #[error("invalid store layout: unrecognized file {name:?}")]
    InvalidLayout {
        /// Offending file name.
        name: String,
    },

    /// The index references a segment missing from the segment table.
    /// Should be unreachable; surfaced instead of panicking.
    #[error("segment {segment_id} referenced by the index is missing")]
    SegmentNotFound {
        /// The missing segment's id.
        segment_id: u32,
    },

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SegmentError> for EngineError {
    fn from(e: SegmentError) -> Self {
        match e {
            SegmentError::Io(e) => EngineError::Io(e),
            SegmentError::Corrupt { segment_id, offset } => {
                EngineError::CorruptRecord { segment_id, offset }
            }
            // Only replay consumes the terminator; anywhere else it means
            // the index points past the end of a segment.
            SegmentError::EndOfSegment => {
                EngineError::Internal("unexpected end of segment".into())
            }
        }
    }
}

impl From<LockError> for EngineError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Io(e) => EngineError::Io(e),
            LockError::Busy { .. } => EngineError::StoreBusy,
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Internal(msg) => EngineError::Internal(msg),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
///
/// Validation happens at the public API boundary; the engine assumes
/// `max_value_size` fits in the record's 16-bit size field and that one
/// max-sized record fits in an empty segment.
pub struct EngineConfig {
    /// Open without write access: no lock is taken, no segment is created,
    /// and every mutating operation fails with [`EngineError::ReadOnly`].
    pub read_only: bool,

    /// Fsync the active segment after every successful append.
    pub sync_on_put: bool,

    /// Size budget (bytes) of the active segment; exceeding it triggers
    /// rotation before the append.
    pub max_file_size: u64,

    /// Max value size (bytes) accepted by `put`.
    pub max_value_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            sync_on_put: false,
            max_file_size: 64 * 1024 * 1024,
            max_value_size: 4096,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// Segment table: the active segment plus every sealed one, keyed by id.
///
/// Guarded by the engine's `RwLock`; the write side is the single
/// writer-exclusive section.
struct EngineInner {
    /// Highest-numbered segment; the only one appended to.
    active: Arc<Segment>,

    /// Immutable, read-only segments by id.
    sealed: HashMap<u32, Arc<Segment>>,

    /// Process lock held for the store's lifetime (read-write opens only).
    lock: Option<FileLock>,
}

/// The storage engine handle.
pub struct Engine {
    /// Store directory.
    dir: PathBuf,

    /// Configuration fixed at open.
    config: EngineConfig,

    /// Key-to-position index, rebuilt by replay at open.
    index: Box<dyn Index>,

    /// Segment table behind the writer-exclusive lock.
    inner: RwLock<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir)
            .field("read_only", &self.config.read_only)
            .finish_non_exhaustive()
    }
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires a read lock on the segment table.
    fn read_lock(&self) -> Result<RwLockReadGuard<'_, EngineInner>, EngineError> {
        self.inner
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    /// Acquires the writer-exclusive lock on the segment table.
    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, EngineInner>, EngineError> {
        self.inner
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or in read-write mode, creates) a store rooted at the given
    /// directory.
    ///
    /// Read-write opens take the process lock, clear any staging directory
    /// left by an interrupted merge, and create segment `1` when the
    /// directory holds no segments yet. Read-only opens take no lock and
    /// fail with [`EngineError::EmptyStore`] on a segment-less directory.
    ///
    /// Every segment is then replayed in ascending id order to rebuild the
    /// index.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = path.as_ref().to_path_buf();
        info!(path = %dir.display(), read_only = config.read_only, "opening store");

        // 1. Ensure the store directory exists.
        if !config.read_only {
            fs::create_dir_all(&dir)?;
        }

        // 2. Take the process lock. Read-only opens skip it and may
        //    coexist with a live read-write handle.
        let lock = if config.read_only {
            None
        } else {
            Some(FileLock::try_lock(&dir)?)
        };

        // 3. Remove any staging directory left by a merge that never
        //    reached its swap step.
        let staging = dir.join(MERGE_DIR);
        if !config.read_only && staging.is_dir() {
            warn!(path = %staging.display(), "removing stale merge staging directory");
            fs::remove_dir_all(&staging)?;
        }

        // 4. Discover segment files, validating the directory layout.
        //    Sub-directories are ignored; any regular file other than the
        //    lock sentinel must be a well-formed segment name.
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return Err(EngineError::InvalidLayout {
                    name: name.to_string_lossy().into_owned(),
                });
            };
            if name == LOCK_FILE {
                continue;
            }
            match parse_segment_id(name) {
                Some(id) => ids.push(id),
                None => {
                    return Err(EngineError::InvalidLayout {
                        name: name.to_string(),
                    });
                }
            }
        }
        ids.sort_unstable();

        // 5. Open the segments. The highest id is the active one; a fresh
        //    read-write store starts at segment 1.
        let (active, sealed) = match ids.last().copied() {
            None if config.read_only => {
                return Err(EngineError::EmptyStore { path: dir });
            }
            None => {
                let active = Arc::new(Segment::open(&dir, 1, false)?);
                (active, HashMap::new())
            }
            Some(active_id) => {
                let active = Arc::new(Segment::open(&dir, active_id, config.read_only)?);
                let mut sealed = HashMap::new();
                for &id in ids.iter().filter(|&&id| id != active_id) {
                    sealed.insert(id, Arc::new(Segment::open(&dir, id, true)?));
                }
                (active, sealed)
            }
        };

        // 6. Replay every segment in ascending id order to rebuild the
        //    index. A valid tombstone erases the key; a torn trailing
        //    record ends a segment cleanly; a checksum failure aborts the
        //    open.
        let index: Box<dyn Index> = Box::new(HashIndex::new());
        let mut replayed = 0usize;
        let mut active_end = 0u64;
        for &id in &ids {
            let segment = if id == active.id() {
                &active
            } else {
                sealed.get(&id).ok_or_else(|| {
                    EngineError::Internal(format!("segment {id} missing during replay"))
                })?
            };
            let (applied, end) = Self::replay_segment(segment, index.as_ref())?;
            replayed += applied;
            if id == active.id() {
                active_end = end;
            }
        }

        // 7. In read-write mode, drop any torn bytes past the last valid
        //    record of the active segment so new appends start on a record
        //    boundary.
        if !config.read_only && active_end < active.current_size() {
            warn!(
                segment_id = active.id(),
                valid_end = active_end,
                file_size = active.current_size(),
                "truncating torn tail of active segment"
            );
            active.truncate_to(active_end)?;
        }

        info!(
            path = %dir.display(),
            segments = ids.len().max(1),
            active_id = active.id(),
            records = replayed,
            keys = index.list_keys()?.len(),
            "store opened"
        );

        Ok(Self {
            dir,
            config,
            index,
            inner: RwLock::new(EngineInner {
                active,
                sealed,
                lock,
            }),
        })
    }

    /// Applies every record of one segment to the index. Returns the
    /// number of records applied and the offset just past the last valid
    /// record.
    fn replay_segment(
        segment: &Segment,
        index: &dyn Index,
    ) -> Result<(usize, u64), EngineError> {
        let mut applied = 0usize;
        let mut end = 0u64;
        for item in segment.replay_iter() {
            let (offset, record) = item?;
            match record.kind {
                RecordKind::Write => {
                    index.put(
                        record.key,
                        LogPos {
                            segment_id: segment.id(),
                            value_size: record.value.len() as u16,
                            offset,
                            timestamp: record.timestamp,
                        },
                    )?;
                }
                RecordKind::Delete => {
                    index.remove(record.key)?;
                }
            }
            applied += 1;
            end = offset + record.total_size() as u64;
        }

        debug!(segment_id = segment.id(), records = applied, "replayed segment");
        Ok((applied, end))
    }

    /// Flushes the active segment and releases the process lock.
    ///
    /// The public handle guards against use after close; the engine itself
    /// performs the shutdown work exactly as asked.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut inner = self.write_lock()?;

        if !self.config.read_only {
            inner.active.flush()?;
        }
        if let Some(lock) = inner.lock.as_mut() {
            lock.unlock();
        }

        info!(path = %self.dir.display(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// Rotation (when the record would not fit the active segment's
    /// budget), the append, and the index update form one atomic unit with
    /// respect to any other writer.
    pub fn put(&self, key: Key, value: Vec<u8>) -> Result<(), EngineError> {
        if self.config.read_only {
            return Err(EngineError::ReadOnly);
        }
        if value.len() > self.config.max_value_size {
            return Err(EngineError::ValueTooLarge {
                got: value.len(),
                max: self.config.max_value_size,
            });
        }

        trace!(key, value_len = value.len(), "engine put");

        let record = LogRecord::new(key, value, RecordKind::Write, now_micros());
        let encoded = record.encode();

        let mut inner = self.write_lock()?;
        self.rotate_if_needed(&mut inner, encoded.len() as u64)?;

        let offset = inner.active.append(&encoded)?;
        if self.config.sync_on_put {
            inner.active.flush()?;
        }

        self.index.put(
            key,
            LogPos {
                segment_id: inner.active.id(),
                value_size: record.value.len() as u16,
                offset,
                timestamp: record.timestamp,
            },
        )?;

        Ok(())
    }

    /// Deletes a key: verifies it exists, appends a tombstone, and removes
    /// the index entry.
    ///
    /// Returns [`EngineError::KeyNotFound`] when there is nothing to
    /// delete.
    pub fn delete(&self, key: Key) -> Result<(), EngineError> {
        if self.config.read_only {
            return Err(EngineError::ReadOnly);
        }

        trace!(key, "engine delete");

        let mut inner = self.write_lock()?;

        // Existence check under the writer-exclusive lock, so two racing
        // deletes cannot both pass it.
        if self.index.get(key)?.is_none() {
            return Err(EngineError::KeyNotFound(key));
        }

        let record = LogRecord::tombstone(key, now_micros());
        let encoded = record.encode();

        self.rotate_if_needed(&mut inner, encoded.len() as u64)?;
        inner.active.append(&encoded)?;
        if self.config.sync_on_put {
            inner.active.flush()?;
        }

        self.index.remove(key)?;

        Ok(())
    }

    /// Seals the active segment and starts a fresh one when `incoming`
    /// more bytes would exceed the size budget.
    ///
    /// Caller holds the writer-exclusive lock.
    fn rotate_if_needed(
        &self,
        inner: &mut EngineInner,
        incoming: u64,
    ) -> Result<(), EngineError> {
        if inner.active.current_size() + incoming <= self.config.max_file_size {
            return Ok(());
        }

        inner.active.flush()?;

        let sealed_id = inner.active.id();
        let sealed = Arc::new(Segment::open(&self.dir, sealed_id, true)?);
        inner.sealed.insert(sealed_id, sealed);

        let next_id = sealed_id
            .checked_add(1)
            .ok_or_else(|| EngineError::Internal("segment id space exhausted".into()))?;
        inner.active = Arc::new(Segment::open(&self.dir, next_id, false)?);

        info!(sealed_id, active_id = next_id, "rotated active segment");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value for a key.
    ///
    /// Returns [`EngineError::KeyNotFound`] if the key has no live value,
    /// [`EngineError::CorruptRecord`] if the stored record fails its
    /// checksum.
    pub fn get(&self, key: Key) -> Result<Vec<u8>, EngineError> {
        trace!(key, "engine get");

        let mut pos = self
            .index
            .get(key)?
            .ok_or(EngineError::KeyNotFound(key))?;

        // A concurrent merge can retire pos's segment between the index
        // lookup and the table lookup. The merge retargets the index
        // before removing segments, so one retry observes a consistent
        // pair.
        let segment = match self.segment_for(pos.segment_id) {
            Ok(segment) => segment,
            Err(EngineError::SegmentNotFound { .. }) => {
                pos = self
                    .index
                    .get(key)?
                    .ok_or(EngineError::KeyNotFound(key))?;
                self.segment_for(pos.segment_id)?
            }
            Err(e) => return Err(e),
        };

        let record = segment.read_with_size(pos.offset, pos.value_size)?;
        if record.key != key || record.kind != RecordKind::Write {
            return Err(EngineError::Internal(format!(
                "index entry for key {key} resolved to a record for key {} (kind {:?})",
                record.key, record.kind
            )));
        }

        Ok(record.value)
    }

    /// Snapshot of all live keys, in no particular order.
    pub fn list_keys(&self) -> Result<Vec<Key>, EngineError> {
        Ok(self.index.list_keys()?)
    }

    /// Calls `visit` with every live key and its current value, in index
    /// iteration order (unordered).
    ///
    /// The traversal holds the segment-table read lock and the index read
    /// lock for its whole lifetime: it sees a single consistent snapshot,
    /// and writers wait until it finishes.
    pub fn fold(&self, visit: &mut dyn FnMut(Key, &[u8])) -> Result<(), EngineError> {
        let inner = self.read_lock()?;

        let mut failure: Option<EngineError> = None;
        self.index.iterate(&mut |key, pos| {
            if failure.is_some() {
                return;
            }

            let segment = if inner.active.id() == pos.segment_id {
                Some(&inner.active)
            } else {
                inner.sealed.get(&pos.segment_id)
            };
            let Some(segment) = segment else {
                failure = Some(EngineError::SegmentNotFound {
                    segment_id: pos.segment_id,
                });
                return;
            };

            match segment.read_with_size(pos.offset, pos.value_size) {
                Ok(record) => visit(key, &record.value),
                Err(e) => failure = Some(e.into()),
            }
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flushes the active segment to stable storage. A no-op on a
    /// read-only store.
    pub fn sync(&self) -> Result<(), EngineError> {
        if self.config.read_only {
            return Ok(());
        }

        let inner = self.read_lock()?;
        inner.active.flush()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Looks up a segment handle by id, cloning it out from under a brief
    /// read lock so the actual read runs without any lock held.
    fn segment_for(&self, segment_id: u32) -> Result<Arc<Segment>, EngineError> {
        let inner = self.read_lock()?;
        if inner.active.id() == segment_id {
            return Ok(Arc::clone(&inner.active));
        }
        inner
            .sealed
            .get(&segment_id)
            .cloned()
            .ok_or(EngineError::SegmentNotFound { segment_id })
    }
}
