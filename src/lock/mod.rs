//! # Process File Lock
//!
//! An OS-level exclusive lock on a sentinel file (`LOCK`) inside the store
//! directory, taken once by a read-write open and held until close. It keeps
//! a second read-write handle — in this process or any other — from opening
//! the same directory, failing fast instead of blocking.
//!
//! The lock is advisory and non-reentrant; read-only opens never touch it.
//! Intra-process write coordination is the orchestrator's job, not this
//! lock's.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Name of the sentinel file inside the store directory.
pub const LOCK_FILE: &str = "LOCK";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned when acquiring the process lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The sentinel file could not be created or opened.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another handle already holds the lock.
    #[error("store directory is locked by another handle: {path}")]
    Busy {
        /// Path of the contended sentinel file.
        path: PathBuf,
    },
}

// ------------------------------------------------------------------------------------------------
// FileLock
// ------------------------------------------------------------------------------------------------

/// Held exclusive lock on a store directory.
///
/// Dropping the value releases the lock; [`FileLock::unlock`] releases it
/// early and is safe to call more than once.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileLock {
    /// Attempts to take the exclusive lock on `dir`'s sentinel file
    /// without blocking.
    ///
    /// Returns [`LockError::Busy`] immediately when another handle holds
    /// it.
    pub fn try_lock(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Busy { path: path.clone() })?;

        debug!(path = %path.display(), "acquired process lock");

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Releases the lock. Idempotent; called automatically on drop.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to release process lock");
            } else {
                debug!(path = %self.path.display(), "released process lock");
            }
        }
    }

    /// Path of the sentinel file this lock covers.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
