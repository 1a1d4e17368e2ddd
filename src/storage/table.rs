//! In-process record and claim tables shared by the memory and persistent
//! backends.
//!
//! Bulk updates are evaluated the way a SQL engine would run
//! `UPDATE .. WHERE <predicate over GROUP BY entity>`: one aggregation sweep
//! over the scoped rows, then one filtering sweep that collects matching ids.
//! Planning is separated from applying so the persistent backend can log a
//! whole batch before mutating anything.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::record::{select_authoritative, EventRecord, NewRecord, RecordId, RecordStatus};
use crate::storage::traits::{BulkUpdate, ResolveScope, StorageError};

/// Claims keyed by primary key.
#[derive(Debug, Default, Clone)]
pub(crate) struct ClaimTable {
    by_primary: HashMap<String, OwnershipClaim>,
}

impl ClaimTable {
    pub(crate) fn insert_if_absent(&mut self, claim: OwnershipClaim) -> ClaimWrite {
        match self.by_primary.get(&claim.primary_key) {
            Some(existing) => ClaimWrite::Existing(existing.clone()),
            None => {
                self.by_primary
                    .insert(claim.primary_key.clone(), claim.clone());
                ClaimWrite::Inserted(claim)
            }
        }
    }

    pub(crate) fn get(&self, primary_key: &str) -> Option<&OwnershipClaim> {
        self.by_primary.get(primary_key)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_primary.len()
    }
}

/// Status changes computed for one batch, in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BulkPlan {
    pub(crate) affected: Vec<u64>,
    pub(crate) changes: Vec<(RecordId, RecordStatus)>,
}

#[derive(Debug, Default, Clone, Copy)]
struct EntityAggregate {
    has_processed: bool,
    top_candidate: Option<(DateTime<Utc>, RecordId)>,
}

/// Append-only record rows. `RecordId(n)` lives at index `n - 1`.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordTable {
    rows: Vec<EventRecord>,
    by_entity: HashMap<String, Vec<usize>>,
}

impl RecordTable {
    pub(crate) fn next_id(&self) -> RecordId {
        RecordId::new(self.rows.len() as u64 + 1)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Assigns the next id and appends.
    pub(crate) fn append(&mut self, record: NewRecord, ingested_at: DateTime<Utc>) -> EventRecord {
        let stored = record.into_record(self.next_id(), ingested_at);
        self.insert_stored(stored.clone());
        stored
    }

    /// Appends a record that already carries its id (WAL replay).
    pub(crate) fn insert_stored(&mut self, record: EventRecord) {
        let idx = self.rows.len();
        self.by_entity
            .entry(record.entity_key.clone())
            .or_default()
            .push(idx);
        self.rows.push(record);
    }

    fn index_of(id: RecordId) -> Option<usize> {
        usize::try_from(id.get()).ok()?.checked_sub(1)
    }

    pub(crate) fn get(&self, id: RecordId) -> Option<&EventRecord> {
        self.rows.get(Self::index_of(id)?)
    }

    pub(crate) fn find_by_entity(&self, entity_key: &str) -> Vec<EventRecord> {
        let mut out: Vec<EventRecord> = self
            .by_entity
            .get(entity_key)
            .map(|idxs| idxs.iter().map(|&i| self.rows[i].clone()).collect())
            .unwrap_or_default();
        out.sort_by(EventRecord::cmp_recency);
        out
    }

    pub(crate) fn find_authoritative(&self, entity_key: &str) -> Option<EventRecord> {
        let idxs = self.by_entity.get(entity_key)?;
        select_authoritative(idxs.iter().map(|&i| &self.rows[i])).cloned()
    }

    /// Entities with an unresolved record, or with a candidate sitting next to
    /// a processed record.
    pub(crate) fn unsettled_entities(&self, limit: usize) -> Vec<String> {
        let mut keys: Vec<&String> = self
            .by_entity
            .iter()
            .filter(|(_, idxs)| {
                let mut has_processed = false;
                let mut has_active = false;
                for &i in idxs.iter() {
                    match self.rows[i].status {
                        RecordStatus::Unresolved => return true,
                        RecordStatus::Processed => has_processed = true,
                        RecordStatus::Active => has_active = true,
                        RecordStatus::Ignored => {}
                    }
                }
                has_processed && has_active
            })
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        keys.into_iter().take(limit).cloned().collect()
    }

    fn scoped_indexes(&self, scope: &ResolveScope) -> Vec<usize> {
        match scope {
            ResolveScope::All => (0..self.rows.len()).collect(),
            ResolveScope::Entities(keys) => keys
                .iter()
                .filter_map(|k| self.by_entity.get(k))
                .flatten()
                .copied()
                .collect(),
        }
    }

    /// Computes the status changes for `updates`, each evaluated against the
    /// state left by the previous one, without touching the table.
    pub(crate) fn plan(&self, scope: &ResolveScope, updates: &[BulkUpdate]) -> BulkPlan {
        let scoped = self.scoped_indexes(scope);
        let mut overlay: HashMap<usize, RecordStatus> = HashMap::new();
        let mut plan = BulkPlan::default();

        for &update in updates {
            let status_of = |i: usize| overlay.get(&i).copied().unwrap_or(self.rows[i].status);

            let mut aggregates: HashMap<&str, EntityAggregate> = HashMap::new();
            for &i in &scoped {
                let row = &self.rows[i];
                let agg = aggregates.entry(row.entity_key.as_str()).or_default();
                let status = status_of(i);
                if status == RecordStatus::Processed {
                    agg.has_processed = true;
                }
                if status.is_candidate() {
                    let key = row.recency_key();
                    if agg.top_candidate.map_or(true, |top| key > top) {
                        agg.top_candidate = Some(key);
                    }
                }
            }

            let matched: Vec<usize> = scoped
                .iter()
                .copied()
                .filter(|&i| {
                    let row = &self.rows[i];
                    let agg = aggregates[row.entity_key.as_str()];
                    let status = status_of(i);
                    match update {
                        BulkUpdate::IgnoreDominatedByProcessed => {
                            agg.has_processed && status.is_candidate()
                        }
                        BulkUpdate::IgnoreSupersededByRecency => {
                            !agg.has_processed
                                && status.is_candidate()
                                && agg.top_candidate != Some(row.recency_key())
                        }
                        BulkUpdate::ActivateSurvivors => {
                            !agg.has_processed
                                && status == RecordStatus::Unresolved
                                && agg.top_candidate == Some(row.recency_key())
                        }
                    }
                })
                .collect();

            let target = update.target_status();
            plan.affected.push(matched.len() as u64);
            for i in matched {
                overlay.insert(i, target);
                plan.changes.push((self.rows[i].id, target));
            }
        }

        plan
    }

    /// Applies previously planned (or replayed) status changes.
    pub(crate) fn apply_changes(
        &mut self,
        changes: &[(RecordId, RecordStatus)],
    ) -> Result<BTreeSet<String>, StorageError> {
        let mut touched = BTreeSet::new();
        for &(id, status) in changes {
            let idx = Self::index_of(id)
                .filter(|&i| i < self.rows.len())
                .ok_or(StorageError::RecordNotFound(id))?;
            let row = &mut self.rows[idx];
            row.status = status;
            touched.insert(row.entity_key.clone());
        }
        Ok(touched)
    }

    /// Authoritative record id for each of the given entities that has one.
    pub(crate) fn survivors(&self, entities: &BTreeSet<String>) -> BTreeMap<String, RecordId> {
        entities
            .iter()
            .filter_map(|k| self.find_authoritative(k).map(|r| (k.clone(), r.id)))
            .collect()
    }
}
