//! Abstract storage traits for claimfold.
//!
//! These traits define the contract that storage backends must implement. The
//! engine never reads-then-writes through them: claims go through a single
//! conditional insert and resolution goes through predicate-driven bulk updates
//! evaluated by the backend against one snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::record::{select_authoritative, EventRecord, NewRecord, RecordId, RecordStatus};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Record not found.
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Whether a backend's snapshot can observe rows inserted after it was taken.
///
/// This is a property of the chosen backend and its isolation level, not a
/// guarantee the engine makes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhantomReads {
    /// Rows inserted mid-batch are invisible to the batch.
    Prevented,
    /// Rows inserted mid-batch may be observed by later passes.
    Possible,
}

impl fmt::Display for PhantomReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prevented => write!(f, "prevented"),
            Self::Possible => write!(f, "possible"),
        }
    }
}

/// The set of entities a resolution batch considers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResolveScope {
    /// Every record in the store.
    #[default]
    All,
    /// Only records whose entity key is in the set.
    Entities(BTreeSet<String>),
}

impl ResolveScope {
    /// Builds an entity scope from any iterator of keys.
    pub fn entities<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Entities(keys.into_iter().map(Into::into).collect())
    }

    /// Returns true if the entity key falls inside this scope.
    #[must_use]
    pub fn contains(&self, entity_key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Entities(keys) => keys.contains(entity_key),
        }
    }

    /// Returns true if the scope names no entity at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Entities(keys) if keys.is_empty())
    }
}

/// A predicate-driven bulk status update.
///
/// Each variant is evaluated by the backend as one set-based statement: an
/// aggregation over the scoped records followed by a filtered update. None of
/// them ever touches a `Processed` or `Ignored` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkUpdate {
    /// `Unresolved`/`Active` records of entities that have a `Processed`
    /// record become `Ignored`.
    IgnoreDominatedByProcessed,
    /// In entities with no `Processed` record, `Unresolved`/`Active` records
    /// whose `(observed_at, id)` is below the per-entity maximum become
    /// `Ignored`.
    IgnoreSupersededByRecency,
    /// In entities with no `Processed` record, `Unresolved` records with no
    /// more recent `Unresolved`/`Active` sibling become `Active`.
    ActivateSurvivors,
}

impl BulkUpdate {
    /// Status assigned to matching rows.
    #[must_use]
    pub const fn target_status(self) -> RecordStatus {
        match self {
            Self::IgnoreDominatedByProcessed | Self::IgnoreSupersededByRecency => {
                RecordStatus::Ignored
            }
            Self::ActivateSurvivors => RecordStatus::Active,
        }
    }
}

/// Result of one atomic bulk batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BulkOutcome {
    /// Rows affected by each update, in the order the updates were given.
    pub affected: Vec<u64>,
    /// Authoritative record per entity whose records were mutated.
    pub survivors: BTreeMap<String, RecordId>,
}

impl BulkOutcome {
    /// Total rows mutated across the batch.
    #[must_use]
    pub fn total_affected(&self) -> u64 {
        self.affected.iter().sum()
    }
}

/// Storage trait for ownership claims.
///
/// # Atomicity
/// `insert_if_absent` must be a single conditional write native to the
/// backend. Implementing it as `get` followed by an insert reintroduces the
/// race the claim protocol exists to remove.
pub trait ClaimStore: Send + Sync {
    /// Insert the claim unless one exists for its primary key; in that case
    /// leave the existing claim untouched and return it.
    fn insert_if_absent(&self, claim: OwnershipClaim) -> Result<ClaimWrite, StorageError>;

    /// Get the claim for a primary key.
    fn get(&self, primary_key: &str) -> Result<Option<OwnershipClaim>, StorageError>;
}

/// Storage trait for event records.
pub trait RecordStore: Send + Sync {
    /// Append a record and return it with its assigned id.
    ///
    /// Ids must be strictly increasing in append order.
    fn append(&self, record: NewRecord) -> Result<EventRecord, StorageError>;

    /// Get a record by id.
    fn get(&self, id: RecordId) -> Result<Option<EventRecord>, StorageError>;

    /// All records for an entity, ordered by `(observed_at, id)`.
    fn find_by_entity(&self, entity_key: &str) -> Result<Vec<EventRecord>, StorageError>;

    /// The authoritative record for an entity, if resolution produced one.
    fn find_authoritative(&self, entity_key: &str) -> Result<Option<EventRecord>, StorageError> {
        let records = self.find_by_entity(entity_key)?;
        Ok(select_authoritative(&records).cloned())
    }

    /// Entity keys whose records do not yet satisfy the resolved-state
    /// invariant, sorted ascending, at most `limit` of them.
    fn unsettled_entities(&self, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Apply the updates in order, atomically, against one snapshot.
    ///
    /// Either every update is applied or none is.
    fn apply_bulk(
        &self,
        scope: &ResolveScope,
        updates: &[BulkUpdate],
    ) -> Result<BulkOutcome, StorageError>;

    /// Phantom-read behavior of this backend's batches.
    fn phantom_reads(&self) -> PhantomReads;
}
