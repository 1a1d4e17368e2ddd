//! Persistent storage backend for claimfold.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//!
//! State lives in memory and is rebuilt by replaying the WAL on open. A resolver
//! batch is logged as one entry, so replay applies it entirely or not at all.

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::{PersistentClaimStore, PersistentRecordStore, PersistentStores};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
    /// Largest encoded WAL entry accepted on write or replay (bytes).
    pub max_entry_bytes: usize,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_entry_bytes: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

impl PersistentConfig {
    const MIN_ENTRY_BYTES: usize = 4 * 1024;

    /// Rejects limits too small to hold a realistic record.
    pub fn validate(self) -> EngineResult<Self> {
        if self.max_entry_bytes < Self::MIN_ENTRY_BYTES {
            return Err(EngineError::config(format!(
                "max_entry_bytes must be at least {} (got {})",
                Self::MIN_ENTRY_BYTES,
                self.max_entry_bytes
            )));
        }
        Ok(self)
    }
}

/// Open or create a persistent database at the given directory.
///
/// # Errors
/// - If the directory cannot be created or accessed
/// - If another process holds the lock
/// - If WAL replay hits a corrupted entry
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use claimfold::storage::open_database;
///
/// let stores = Arc::new(open_database("./ledger.clmf", None)?);
/// let engine = ClaimfoldEngine::new(stores.claims(), stores.records());
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> EngineResult<PersistentStores> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentStores::open(path.as_ref(), cfg)
}
