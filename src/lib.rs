//! # Firkin
//!
//! An embeddable, persistent key-value store in the **Bitcask** style:
//! writes append checksummed records to segment files, an in-memory index
//! maps every live key to its newest record, and reads cost at most one
//! positioned disk read.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firkin::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! // Write
//! store.put(1, b"hello").unwrap();
//!
//! // Read
//! assert_eq!(store.get(1).unwrap(), b"hello".to_vec());
//!
//! // Overwrite and delete
//! store.put(1, b"world").unwrap();
//! store.delete(1).unwrap();
//!
//! // Enumerate
//! store.put(2, b"two").unwrap();
//! store.put(3, b"three").unwrap();
//! assert_eq!(store.list_keys().unwrap().len(), 2);
//!
//! // Graceful shutdown
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Append-only segments** — data is never overwritten in place; the
//!   active segment rotates at a configurable size budget.
//! - **In-memory index** — every live key maps straight to its record's
//!   position on disk.
//! - **CRC32 integrity** — all records are checksummed and verified on read.
//! - **Crash recovery** — segments are replayed at open to rebuild the index.
//! - **Single-writer safety** — an OS-level file lock keeps a second
//!   read-write handle out; read-only handles coexist freely.
//! - **Merge** — sealed segments can be compacted down to their live
//!   records while the store stays online.

#![allow(dead_code)]

pub(crate) mod engine;
pub(crate) mod index;
pub(crate) mod lock;
pub(crate) mod record;
pub(crate) mod segment;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig};
use thiserror::Error;

pub use engine::EngineError;
pub use record::Key;

use record::{KEY_SIZE, LOG_HEADER_SIZE};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
///
/// All fields have sensible defaults via [`StoreConfig::default()`].
/// The configuration is validated when passed to [`Store::open`].
///
/// # Example
///
/// ```rust
/// use firkin::StoreConfig;
///
/// // Use defaults (64 MiB segments, 4 KiB value limit)
/// let config = StoreConfig::default();
///
/// // Or customize
/// let config = StoreConfig {
///     max_file_size: 4 * 1024 * 1024,
///     sync_on_put: true,
///     ..StoreConfig::default()
/// };
/// ```
pub struct StoreConfig {
    /// Open the store without write access.
    ///
    /// No process lock is taken and no segment is created, so a read-only
    /// handle can watch a directory another process is writing. Every
    /// mutating operation fails with
    /// [`EngineError::ReadOnly`](crate::EngineError::ReadOnly).
    ///
    /// Default: `false`.
    pub read_only: bool,

    /// Fsync the active segment after every successful `put` and
    /// `delete`, making each write durable before it is acknowledged.
    ///
    /// Off by default: writes then reach disk at rotation, on
    /// [`Store::sync`], and on close.
    pub sync_on_put: bool,

    /// Size budget of the active segment file in bytes. When the next
    /// record would exceed it, the segment is sealed and a new one
    /// started.
    ///
    /// Default: 64 MiB. Must hold at least one record of the largest
    /// permitted value.
    pub max_file_size: u64,

    /// Maximum value size in bytes accepted by `put`.
    ///
    /// Default: 4096. Must fit the record's 16-bit size field (65535).
    pub max_value_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            sync_on_put: false,
            max_file_size: 64 * 1024 * 1024,
            max_value_size: 4096,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        if self.max_value_size > u16::MAX as usize {
            return Err(StoreError::InvalidConfig(
                "max_value_size must be <= 65535".into(),
            ));
        }
        let record_budget = (LOG_HEADER_SIZE + KEY_SIZE + self.max_value_size) as u64;
        if self.max_file_size < record_budget {
            return Err(StoreError::InvalidConfig(format!(
                "max_file_size must be >= {record_budget} to fit one record of the largest permitted value"
            )));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            read_only: self.read_only,
            sync_on_put: self.sync_on_put,
            max_file_size: self.max_file_size,
            max_value_size: self.max_value_size,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An engine-level error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// Provides a thread-safe API over one store directory: keyed writes and
/// reads, key listing, full folds, and explicit durability control.
///
/// # Thread safety
///
/// `Store` is `Send + Sync` — share it across threads via `Arc<Store>`.
/// Writes are serialized internally; reads run concurrently with each
/// other and with writers.
///
/// # Shutdown
///
/// Call [`Store::close`] for a graceful shutdown. If the handle is
/// dropped without calling `close`, the destructor attempts the same
/// cleanup, but errors are silently ignored.
pub struct Store {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store at the given directory.
    ///
    /// A read-write open takes an exclusive process lock on the directory
    /// and creates the first segment if none exists; a read-only open
    /// requires at least one segment to be present. Existing segments are
    /// replayed to rebuild the in-memory index.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] if a configuration parameter is out
    ///   of range.
    /// - [`EngineError::StoreBusy`] if another read-write handle holds the
    ///   directory.
    /// - [`EngineError::EmptyStore`] on a read-only open of a directory
    ///   with no segments.
    /// - [`EngineError::InvalidLayout`] if the directory contains a file
    ///   that is neither a segment nor the lock sentinel.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let engine = Engine::open(path, config.to_engine_config())?;

        Ok(Self {
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// Gracefully shuts down the store: flushes the active segment and
    /// releases the process lock.
    ///
    /// Subsequent operations on this handle return [`StoreError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // Already closed.
        }

        self.engine.close()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// The record is appended to the active segment (rotating it first if
    /// the record would not fit) and the index is updated to point at it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ValueTooLarge`] if `value` exceeds the configured
    ///   limit.
    /// - [`EngineError::ReadOnly`] on a read-only store.
    pub fn put(&self, key: Key, value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.engine.put(key, value.to_vec())?)
    }

    /// Deletes a key by appending a tombstone record.
    ///
    /// # Errors
    ///
    /// - [`EngineError::KeyNotFound`] if the key has no live value.
    /// - [`EngineError::ReadOnly`] on a read-only store.
    pub fn delete(&self, key: Key) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.engine.delete(key)?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key.
    ///
    /// # Errors
    ///
    /// - [`EngineError::KeyNotFound`] if the key does not exist or has
    ///   been deleted.
    /// - [`EngineError::CorruptRecord`] if the stored record fails its
    ///   checksum.
    pub fn get(&self, key: Key) -> Result<Vec<u8>, StoreError> {
        self.check_open()?;
        Ok(self.engine.get(key)?)
    }

    /// Returns a snapshot of all live keys, in no particular order.
    pub fn list_keys(&self) -> Result<Vec<Key>, StoreError> {
        self.check_open()?;
        Ok(self.engine.list_keys()?)
    }

    /// Calls `visit` once for every live key with its current value, in
    /// index iteration order (unordered).
    ///
    /// The whole traversal runs under one consistent snapshot; writers
    /// wait until it finishes. Intended for full scans and exports.
    pub fn fold<F>(&self, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(Key, &[u8]),
    {
        self.check_open()?;
        Ok(self.engine.fold(&mut visit)?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Flushes the active segment to stable storage.
    ///
    /// A no-op on a read-only store.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.check_open()?;
        Ok(self.engine.sync()?)
    }

    /// Compacts all sealed segments down to their live records,
    /// reclaiming the space held by overwritten values and tombstones.
    ///
    /// This is a **blocking** call on the invoking thread, but reads and
    /// writes from other threads stay available for the whole rewrite
    /// phase; only the final swap briefly excludes writers.
    ///
    /// Returns `true` if sealed segments were rewritten, `false` if there
    /// was nothing to merge.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ReadOnly`] on a read-only store.
    pub fn merge(&self) -> Result<bool, StoreError> {
        self.check_open()?;
        Ok(self.engine.merge()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.engine.close();
        }
    }
}
