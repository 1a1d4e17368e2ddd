//! Set-based batch resolution of competing event records.
//!
//! A run is a fixed sequence of bulk updates handed to the record store as one
//! atomic batch:
//!
//! 1. **Processed dominance**: in every entity that has a `Processed` record,
//!    all `Unresolved`/`Active` records become `Ignored`.
//! 2. **Recency**: in every other entity, all `Unresolved`/`Active` records
//!    except the one with the greatest `(observed_at, id)` become `Ignored`.
//!    The survivor, if still `Unresolved`, becomes `Active`.
//!
//! Cost is a constant number of bulk statements per run regardless of how
//! many entities are involved. Each update is a pure function of the rows it
//! sees, so running the batch on a resolved set matches nothing. That is what
//! makes re-running after a failure or on a schedule safe.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::record::RecordId;
use crate::storage::{BulkUpdate, PhantomReads, RecordStore, ResolveScope};
use crate::validation::InputLimits;

/// The passes of one resolution run, in order.
pub const RESOLUTION_PASSES: [BulkUpdate; 3] = [
    BulkUpdate::IgnoreDominatedByProcessed,
    BulkUpdate::IgnoreSupersededByRecency,
    BulkUpdate::ActivateSurvivors,
];

/// Summary of one resolution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    /// Correlates the run with its log lines.
    pub run_id: Uuid,
    /// Number of entities the run was scoped to; `None` for the whole store.
    pub scope_entities: Option<usize>,
    /// Records ignored because their entity has a processed record.
    pub dominated_count: u64,
    /// Records ignored because a more recent sibling exists.
    pub superseded_count: u64,
    /// `dominated_count + superseded_count`.
    pub ignored_count: u64,
    /// Records promoted from `Unresolved` to `Active`.
    pub activated_count: u64,
    /// Authoritative record of every entity this run changed.
    pub active_by_entity: BTreeMap<String, RecordId>,
    /// Phantom-read behavior the run executed under.
    pub phantom_reads: PhantomReads,
}

impl ResolutionReport {
    fn empty(run_id: Uuid, phantom_reads: PhantomReads) -> Self {
        Self {
            run_id,
            scope_entities: Some(0),
            dominated_count: 0,
            superseded_count: 0,
            ignored_count: 0,
            activated_count: 0,
            active_by_entity: BTreeMap::new(),
            phantom_reads,
        }
    }

    /// Returns true if the run mutated nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.ignored_count == 0 && self.activated_count == 0
    }

    /// Number of entities whose records changed.
    #[must_use]
    pub fn entities_changed(&self) -> usize {
        self.active_by_entity.len()
    }
}

/// Computes final per-entity status for the unresolved record set.
#[derive(Clone)]
pub struct BatchResolver {
    records: Arc<dyn RecordStore>,
    limits: InputLimits,
    phantom_reads_override: Option<PhantomReads>,
}

impl BatchResolver {
    /// Creates a resolver over the given record store.
    ///
    /// `phantom_reads_override` replaces the backend-reported behavior when set.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        limits: InputLimits,
        phantom_reads_override: Option<PhantomReads>,
    ) -> Self {
        Self {
            records,
            limits,
            phantom_reads_override,
        }
    }

    /// Phantom-read behavior in effect for this resolver's runs.
    #[must_use]
    pub fn phantom_reads(&self) -> PhantomReads {
        self.phantom_reads_override
            .unwrap_or_else(|| self.records.phantom_reads())
    }

    /// Resolves every record inside `scope`.
    ///
    /// An empty entity set returns an empty report without touching storage.
    ///
    /// # Errors
    /// - `Validation` if a scoped entity key is malformed
    /// - `StorageUnavailable` if the batch fails; the store guarantees the
    ///   batch was not partially applied, and re-running converges
    pub fn resolve(&self, scope: &ResolveScope) -> EngineResult<ResolutionReport> {
        let run_id = Uuid::new_v4();
        let phantom_reads = self.phantom_reads();

        let scope = self.normalize(scope)?;
        if scope.is_empty() {
            return Ok(ResolutionReport::empty(run_id, phantom_reads));
        }

        let outcome = self.records.apply_bulk(&scope, &RESOLUTION_PASSES)?;
        let count = |i: usize| outcome.affected.get(i).copied().unwrap_or(0);
        let (dominated_count, superseded_count, activated_count) = (count(0), count(1), count(2));

        let scope_entities = match &scope {
            ResolveScope::All => None,
            ResolveScope::Entities(keys) => Some(keys.len()),
        };
        let report = ResolutionReport {
            run_id,
            scope_entities,
            dominated_count,
            superseded_count,
            ignored_count: dominated_count + superseded_count,
            activated_count,
            active_by_entity: outcome.survivors,
            phantom_reads,
        };

        if report.is_noop() {
            tracing::debug!(%run_id, "resolution run made no changes");
        } else {
            tracing::info!(
                %run_id,
                dominated = dominated_count,
                superseded = superseded_count,
                activated = activated_count,
                entities = report.entities_changed(),
                phantom_reads = %phantom_reads,
                "resolution run applied"
            );
        }
        Ok(report)
    }

    /// Convenience for resolving a set of entity keys.
    pub fn resolve_entities<I, S>(&self, entity_keys: I) -> EngineResult<ResolutionReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resolve(&ResolveScope::entities(entity_keys))
    }

    fn normalize(&self, scope: &ResolveScope) -> EngineResult<ResolveScope> {
        match scope {
            ResolveScope::All => Ok(ResolveScope::All),
            ResolveScope::Entities(keys) => {
                let keys = keys
                    .iter()
                    .map(|k| self.limits.key("entity_key", k).map(str::to_string))
                    .collect::<Result<_, _>>()?;
                Ok(ResolveScope::Entities(keys))
            }
        }
    }
}
