//! Persistent store implementations.
//!
//! Each store keeps its table in memory and logs every mutation to the shared
//! WAL before applying it. The directory lock is owned by the shared log
//! handle, so it is held for as long as any store is alive.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::error::{EngineError, EngineResult};
use crate::record::{EventRecord, NewRecord, RecordId};
use crate::storage::table::{ClaimTable, RecordTable};
use crate::storage::traits::{
    BulkOutcome, BulkUpdate, ClaimStore, PhantomReads, RecordStore, ResolveScope, StorageError,
};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "claimfold.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn wal_err(err: std::io::Error) -> StorageError {
    StorageError::Io(format!("WAL append failed: {err}"))
}

fn open_err(what: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::StorageUnavailable(StorageError::Io(format!("failed to {what}: {err}")))
}

struct SharedLog {
    wal: WriteAheadLog,
    _lock: FileLock,
}

/// Aggregate of the persistent stores over one database directory.
pub struct PersistentStores {
    dir: PathBuf,
    log: Arc<SharedLog>,
    claims: Arc<PersistentClaimStore>,
    records: Arc<PersistentRecordStore>,
}

impl PersistentStores {
    /// Open or create a database directory and replay its WAL.
    pub fn open(dir: &Path, config: PersistentConfig) -> EngineResult<Self> {
        fs::create_dir_all(dir).map_err(|e| open_err("create database directory", e))?;
        let lock = FileLock::acquire(dir).map_err(|e| open_err("acquire lock", e))?;
        let wal = WriteAheadLog::open(
            &dir.join(WAL_FILE),
            config.sync_on_write,
            config.max_entry_bytes,
        )
        .map_err(|e| open_err("open WAL", e))?;

        let log = Arc::new(SharedLog { wal, _lock: lock });
        let (claims, records) = Self::replay(&log.wal)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            claims: Arc::new(PersistentClaimStore {
                log: Arc::clone(&log),
                table: RwLock::new(claims),
            }),
            records: Arc::new(PersistentRecordStore {
                log: Arc::clone(&log),
                table: RwLock::new(records),
            }),
            log,
        })
    }

    fn replay(wal: &WriteAheadLog) -> EngineResult<(ClaimTable, RecordTable)> {
        let mut claims = ClaimTable::default();
        let mut records = RecordTable::default();

        let mut count = 0u64;
        for entry in wal.iter().map_err(|e| open_err("iterate WAL", e))? {
            let entry = entry.map_err(|e| open_err("read WAL entry", e))?;
            match entry.kind {
                WalEntryKind::ClaimInsert(claim) => {
                    claims.insert_if_absent(claim);
                }
                WalEntryKind::RecordAppend(record) => {
                    let expected = records.next_id();
                    if record.id != expected {
                        return Err(EngineError::StorageUnavailable(StorageError::BackendError(
                            format!(
                                "WAL record id out of order at sequence {}: expected {expected}, found {}",
                                entry.sequence, record.id
                            ),
                        )));
                    }
                    records.insert_stored(record);
                }
                WalEntryKind::StatusBatch { changes } => {
                    records.apply_changes(&changes)?;
                }
            }
            count += 1;
        }

        if count > 0 {
            tracing::info!(
                entries = count,
                claims = claims.len(),
                records = records.len(),
                "replayed WAL"
            );
        }
        Ok((claims, records))
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shared handle to the claim store.
    #[must_use]
    pub fn claims(&self) -> Arc<PersistentClaimStore> {
        Arc::clone(&self.claims)
    }

    /// Shared handle to the record store.
    #[must_use]
    pub fn records(&self) -> Arc<PersistentRecordStore> {
        Arc::clone(&self.records)
    }

    /// Sequence number of the last logged mutation.
    #[must_use]
    pub fn wal_sequence(&self) -> u64 {
        self.log.wal.current_sequence()
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.log.wal.size_bytes().unwrap_or(0)
    }
}

/// Durable claim store.
pub struct PersistentClaimStore {
    log: Arc<SharedLog>,
    table: RwLock<ClaimTable>,
}

impl ClaimStore for PersistentClaimStore {
    fn insert_if_absent(&self, claim: OwnershipClaim) -> Result<ClaimWrite, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("claim.insert_if_absent"))?;
        if let Some(existing) = table.get(&claim.primary_key) {
            return Ok(ClaimWrite::Existing(existing.clone()));
        }
        // The write lock is held from the lookup through the log append, so the
        // check and the insert are one critical section.
        self.log
            .wal
            .append(WalEntryKind::ClaimInsert(claim.clone()))
            .map_err(wal_err)?;
        Ok(table.insert_if_absent(claim))
    }

    fn get(&self, primary_key: &str) -> Result<Option<OwnershipClaim>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("claim.get"))?;
        Ok(table.get(primary_key).cloned())
    }
}

/// Durable record store.
pub struct PersistentRecordStore {
    log: Arc<SharedLog>,
    table: RwLock<RecordTable>,
}

impl RecordStore for PersistentRecordStore {
    fn append(&self, record: NewRecord) -> Result<EventRecord, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("record.append"))?;
        let stored = record.into_record(table.next_id(), Utc::now());
        self.log
            .wal
            .append(WalEntryKind::RecordAppend(stored.clone()))
            .map_err(wal_err)?;
        table.insert_stored(stored.clone());
        Ok(stored)
    }

    fn get(&self, id: RecordId) -> Result<Option<EventRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("record.get"))?;
        Ok(table.get(id).cloned())
    }

    fn find_by_entity(&self, entity_key: &str) -> Result<Vec<EventRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("record.find_by_entity"))?;
        Ok(table.find_by_entity(entity_key))
    }

    fn find_authoritative(&self, entity_key: &str) -> Result<Option<EventRecord>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("record.find_authoritative"))?;
        Ok(table.find_authoritative(entity_key))
    }

    fn unsettled_entities(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("record.unsettled_entities"))?;
        Ok(table.unsettled_entities(limit))
    }

    fn apply_bulk(
        &self,
        scope: &ResolveScope,
        updates: &[BulkUpdate],
    ) -> Result<BulkOutcome, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("record.apply_bulk"))?;
        let plan = table.plan(scope, updates);
        if plan.changes.is_empty() {
            return Ok(BulkOutcome {
                affected: plan.affected,
                survivors: Default::default(),
            });
        }

        self.log
            .wal
            .append(WalEntryKind::StatusBatch {
                changes: plan.changes.clone(),
            })
            .map_err(wal_err)?;
        let touched = table.apply_changes(&plan.changes)?;
        Ok(BulkOutcome {
            affected: plan.affected,
            survivors: table.survivors(&touched),
        })
    }

    fn phantom_reads(&self) -> PhantomReads {
        PhantomReads::Prevented
    }
}
