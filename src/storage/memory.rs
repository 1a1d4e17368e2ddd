//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! Every bulk batch runs under a single write lock, which makes the batch a
//! snapshot: concurrent appends wait until it commits.

use std::sync::RwLock;

use chrono::Utc;

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::record::{EventRecord, NewRecord, RecordId};
use crate::storage::table::{ClaimTable, RecordTable};
use crate::storage::traits::{
    BulkOutcome, BulkUpdate, ClaimStore, PhantomReads, RecordStore, ResolveScope, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory claim store.
#[derive(Debug, Default)]
pub struct InMemoryClaimStore {
    state: RwLock<ClaimTable>,
}

impl InMemoryClaimStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClaimStore for InMemoryClaimStore {
    fn insert_if_absent(&self, claim: OwnershipClaim) -> Result<ClaimWrite, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("claim.insert_if_absent"))?;
        Ok(state.insert_if_absent(claim))
    }

    fn get(&self, primary_key: &str) -> Result<Option<OwnershipClaim>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("claim.get"))?;
        Ok(state.get(primary_key).cloned())
    }
}

/// Thread-safe in-memory record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: RwLock<RecordTable>,
}

impl InMemoryRecordStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn append(&self, record: NewRecord) -> Result<EventRecord, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("record.append"))?;
        Ok(state.append(record, Utc::now()))
    }

    fn get(&self, id: RecordId) -> Result<Option<EventRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.get"))?;
        Ok(state.get(id).cloned())
    }

    fn find_by_entity(&self, entity_key: &str) -> Result<Vec<EventRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.find_by_entity"))?;
        Ok(state.find_by_entity(entity_key))
    }

    fn find_authoritative(&self, entity_key: &str) -> Result<Option<EventRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.find_authoritative"))?;
        Ok(state.find_authoritative(entity_key))
    }

    fn unsettled_entities(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("record.unsettled_entities"))?;
        Ok(state.unsettled_entities(limit))
    }

    fn apply_bulk(
        &self,
        scope: &ResolveScope,
        updates: &[BulkUpdate],
    ) -> Result<BulkOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("record.apply_bulk"))?;
        let plan = state.plan(scope, updates);
        let touched = state.apply_changes(&plan.changes)?;
        Ok(BulkOutcome {
            affected: plan.affected,
            survivors: state.survivors(&touched),
        })
    }

    fn phantom_reads(&self) -> PhantomReads {
        PhantomReads::Prevented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    use crate::engine::RESOLUTION_PASSES as PASSES;
    use crate::record::RecordStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn claim_insert_if_absent_returns_existing() {
        let store = InMemoryClaimStore::new();
        let first = store.insert_if_absent(OwnershipClaim::new("dept", "alice")).unwrap();
        assert!(first.was_inserted());

        let second = store.insert_if_absent(OwnershipClaim::new("dept", "bob")).unwrap();
        assert_eq!(second, ClaimWrite::Existing(first.claim().clone()));
        assert_eq!(store.get("dept").unwrap().unwrap().secondary_key, "alice");
        assert!(store.get("other").unwrap().is_none());
    }

    #[test]
    fn claim_race_has_single_winner() {
        let store = Arc::new(InMemoryClaimStore::new());
        let bound: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = Arc::clone(&store);
                    s.spawn(move || {
                        store
                            .insert_if_absent(OwnershipClaim::new("p", format!("s{i}")))
                            .unwrap()
                            .into_claim()
                            .secondary_key
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(bound.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn record_append_get_and_history_order() {
        let store = InMemoryRecordStore::new();
        let late = store.append(NewRecord::unresolved("e", json!({"v": 2}), at(20))).unwrap();
        let early = store.append(NewRecord::unresolved("e", json!({"v": 1}), at(10))).unwrap();
        assert!(late.id < early.id);

        let history = store.find_by_entity("e").unwrap();
        assert_eq!(history.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        assert_eq!(store.get(late.id).unwrap().unwrap(), late);
        assert!(store.find_by_entity("missing").unwrap().is_empty());
    }

    #[test]
    fn apply_bulk_reports_survivors_of_touched_entities() {
        let store = InMemoryRecordStore::new();
        store.append(NewRecord::unresolved("a", json!({}), at(1))).unwrap();
        let a2 = store.append(NewRecord::unresolved("a", json!({}), at(2))).unwrap();
        let p = store.append(NewRecord::processed("b", json!({}), at(1))).unwrap();

        let outcome = store.apply_bulk(&ResolveScope::All, &PASSES).unwrap();
        assert_eq!(outcome.affected, vec![0, 1, 1]);
        assert_eq!(outcome.survivors.len(), 1);
        assert_eq!(outcome.survivors["a"], a2.id);

        assert_eq!(store.find_authoritative("a").unwrap().unwrap().id, a2.id);
        assert_eq!(store.find_authoritative("b").unwrap().unwrap().id, p.id);
        assert_eq!(store.get(p.id).unwrap().unwrap().status, RecordStatus::Processed);

        let again = store.apply_bulk(&ResolveScope::All, &PASSES).unwrap();
        assert_eq!(again.total_affected(), 0);
        assert!(again.survivors.is_empty());
    }
}
