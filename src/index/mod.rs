//! # In-Memory Key Index
//!
//! The index (often called the *keydir* in log-structured stores) maps every
//! live key to the position of its newest record on disk. It is rebuilt from
//! the segment files at open and kept exact by every subsequent write.
//!
//! ## Design Overview
//!
//! [`Index`] is the capability interface the orchestrator programs against;
//! [`HashIndex`] is the hash-map-backed implementation used today. Alternative
//! strategies (sorted, sharded) would implement the same interface.
//!
//! Entries are small [`LogPos`] values copied in and out by value — they are
//! plain data, not resources, so nothing is shared or reference-counted.
//!
//! # Concurrency model
//!
//! `HashIndex` carries its own read/write lock, independent of the
//! orchestrator's write-exclusive section:
//!
//! - `get` and `list_keys` take the read lock briefly; concurrent readers do
//!   not block each other.
//! - `iterate` holds the read lock for the whole traversal, giving the
//!   visitor a snapshot-consistent, single-pass view. Writers block until it
//!   finishes.
//! - `put` and `remove` take the write lock.
//!
//! # Guarantees
//!
//! - A lookup never observes a half-applied mutation.
//! - A poisoned lock is reported as [`IndexError::Internal`], never
//!   propagated as a panic.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{error, trace};

use crate::record::Key;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Data Types
// ------------------------------------------------------------------------------------------------

/// Position of one record on disk: which segment, where in it, and enough
/// metadata to read the record back in a single positioned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPos {
    /// Id of the segment holding the record.
    pub segment_id: u32,

    /// Size of the record's value in bytes.
    pub value_size: u16,

    /// Byte offset of the record within the segment.
    pub offset: u64,

    /// Timestamp the record was written with (microseconds).
    pub timestamp: i64,
}

// ------------------------------------------------------------------------------------------------
// Capability interface
// ------------------------------------------------------------------------------------------------

/// Key-to-position index strategy.
///
/// Absence of a key is expressed as `Ok(None)` — at this layer it is a
/// normal outcome, not an error; the orchestrator decides how to surface it.
pub trait Index: Send + Sync {
    /// Inserts or overwrites the position for `key`.
    fn put(&self, key: Key, pos: LogPos) -> Result<(), IndexError>;

    /// Looks up the current position for `key`.
    fn get(&self, key: Key) -> Result<Option<LogPos>, IndexError>;

    /// Removes the entry for `key`, returning the position it held.
    fn remove(&self, key: Key) -> Result<Option<LogPos>, IndexError>;

    /// Snapshot of all live keys, in no particular order.
    fn list_keys(&self) -> Result<Vec<Key>, IndexError>;

    /// Calls `visit` for every `(key, pos)` entry under one read lock held
    /// for the entire traversal. Single-pass, unordered, and
    /// snapshot-consistent: no mutation can interleave.
    fn iterate(&self, visit: &mut dyn FnMut(Key, LogPos)) -> Result<(), IndexError>;
}

// ------------------------------------------------------------------------------------------------
// HashIndex
// ------------------------------------------------------------------------------------------------

/// Hash-map-backed [`Index`].
#[derive(Debug, Default)]
pub struct HashIndex {
    entries: RwLock<HashMap<Key, LogPos>>,
}

impl HashIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for HashIndex {
    fn put(&self, key: Key, pos: LogPos) -> Result<(), IndexError> {
        let mut guard = self.entries.write().map_err(|_| {
            error!("Read-write lock poisoned during index put");
            IndexError::Internal("Read-write lock poisoned".into())
        })?;

        let previous = guard.insert(key, pos);

        trace!(
            key,
            segment_id = pos.segment_id,
            offset = pos.offset,
            overwrote = previous.is_some(),
            "index entry updated"
        );

        Ok(())
    }

    fn get(&self, key: Key) -> Result<Option<LogPos>, IndexError> {
        let guard = self.entries.read().map_err(|_| {
            error!("Read-write lock poisoned during index get");
            IndexError::Internal("Read-write lock poisoned".into())
        })?;

        Ok(guard.get(&key).copied())
    }

    fn remove(&self, key: Key) -> Result<Option<LogPos>, IndexError> {
        let mut guard = self.entries.write().map_err(|_| {
            error!("Read-write lock poisoned during index remove");
            IndexError::Internal("Read-write lock poisoned".into())
        })?;

        let removed = guard.remove(&key);

        trace!(key, removed = removed.is_some(), "index entry removed");

        Ok(removed)
    }

    fn list_keys(&self) -> Result<Vec<Key>, IndexError> {
        let guard = self.entries.read().map_err(|_| {
            error!("Read-write lock poisoned during index list_keys");
            IndexError::Internal("Read-write lock poisoned".into())
        })?;

        Ok(guard.keys().copied().collect())
    }

    fn iterate(&self, visit: &mut dyn FnMut(Key, LogPos)) -> Result<(), IndexError> {
        let guard = self.entries.read().map_err(|_| {
            error!("Read-write lock poisoned during index iterate");
            IndexError::Internal("Read-write lock poisoned".into())
        })?;

        for (key, pos) in guard.iter() {
            visit(*key, *pos);
        }

        Ok(())
    }
}
