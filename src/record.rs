//! Versioned event records and their resolution status.
//!
//! Records are append-only. The only mutation a record ever sees is a status
//! change performed by the batch resolver.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned, monotonically increasing record identifier.
///
/// Ordering on `RecordId` is ingestion order, and is the tie-break used when two
/// records share an `observed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolution status of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Ingested, not yet classified.
    Unresolved,
    /// Already acted on downstream. Dominates every other record of its entity.
    Processed,
    /// Superseded by another record of the same entity.
    Ignored,
    /// The surviving record of an entity with no processed record.
    Active,
}

impl RecordStatus {
    /// Stable lowercase name, also used as the SQL column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::Active => "active",
        }
    }

    /// Parses the lowercase name produced by [`RecordStatus::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unresolved" => Some(Self::Unresolved),
            "processed" => Some(Self::Processed),
            "ignored" => Some(Self::Ignored),
            "active" => Some(Self::Active),
            _ => None,
        }
    }

    /// True for the statuses that make a record authoritative for its entity.
    #[must_use]
    pub const fn is_authoritative(self) -> bool {
        matches!(self, Self::Processed | Self::Active)
    }

    /// True for the statuses the resolver may still demote.
    #[must_use]
    pub const fn is_candidate(self) -> bool {
        matches!(self, Self::Unresolved | Self::Active)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned state-transition record for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-assigned identifier.
    pub id: RecordId,
    /// Groups records belonging to the same logical entity.
    pub entity_key: String,
    /// Opaque attribute set (always a JSON object).
    pub payload: serde_json::Value,
    /// Current resolution status.
    pub status: RecordStatus,
    /// Recency timestamp. Need not equal ingestion time.
    pub observed_at: DateTime<Utc>,
    /// When the store accepted the record.
    pub ingested_at: DateTime<Utc>,
}

impl EventRecord {
    /// The `(observed_at, id)` key records are ranked by; larger wins.
    #[must_use]
    pub fn recency_key(&self) -> (DateTime<Utc>, RecordId) {
        (self.observed_at, self.id)
    }

    /// Compares two records by recency, ties broken by id.
    #[must_use]
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        self.recency_key().cmp(&other.recency_key())
    }
}

/// A record awaiting an identifier from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Entity grouping key.
    pub entity_key: String,
    /// Opaque attribute set.
    pub payload: serde_json::Value,
    /// Initial status: `Unresolved` or `Processed`.
    pub status: RecordStatus,
    /// Recency timestamp.
    pub observed_at: DateTime<Utc>,
}

impl NewRecord {
    /// An unresolved record.
    #[must_use]
    pub fn unresolved(
        entity_key: impl Into<String>,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            payload,
            status: RecordStatus::Unresolved,
            observed_at,
        }
    }

    /// A record that was already acted on downstream.
    #[must_use]
    pub fn processed(
        entity_key: impl Into<String>,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: RecordStatus::Processed,
            ..Self::unresolved(entity_key, payload, observed_at)
        }
    }

    /// Materializes the record with a store-assigned id.
    #[must_use]
    pub fn into_record(self, id: RecordId, ingested_at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id,
            entity_key: self.entity_key,
            payload: self.payload,
            status: self.status,
            observed_at: self.observed_at,
            ingested_at,
        }
    }
}

/// Picks the authoritative record among one entity's records.
///
/// The most recent processed record wins if any exists; otherwise the active
/// record. Unresolved and ignored records are never authoritative.
#[must_use]
pub fn select_authoritative<'a, I>(records: I) -> Option<&'a EventRecord>
where
    I: IntoIterator<Item = &'a EventRecord>,
{
    let mut processed: Option<&EventRecord> = None;
    let mut active: Option<&EventRecord> = None;
    for r in records {
        let slot = match r.status {
            RecordStatus::Processed => &mut processed,
            RecordStatus::Active => &mut active,
            RecordStatus::Unresolved | RecordStatus::Ignored => continue,
        };
        if slot.map_or(true, |cur| r.cmp_recency(cur) == Ordering::Greater) {
            *slot = Some(r);
        }
    }
    processed.or(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn rec(id: u64, t: i64, status: RecordStatus) -> EventRecord {
        NewRecord {
            entity_key: "e".into(),
            payload: json!({}),
            status,
            observed_at: Utc.timestamp_opt(t, 0).unwrap(),
        }
        .into_record(RecordId::new(id), Utc::now())
    }

    #[test]
    fn test_status_roundtrip_names() {
        for s in [
            RecordStatus::Unresolved,
            RecordStatus::Processed,
            RecordStatus::Ignored,
            RecordStatus::Active,
        ] {
            assert_eq!(RecordStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RecordStatus::parse("ACTIVE"), None);
    }

    #[test]
    fn test_recency_tie_breaks_on_id() {
        let a = rec(1, 100, RecordStatus::Unresolved);
        let b = rec(2, 100, RecordStatus::Unresolved);
        assert_eq!(b.cmp_recency(&a), Ordering::Greater);

        let c = rec(0, 101, RecordStatus::Unresolved);
        assert_eq!(c.cmp_recency(&b), Ordering::Greater);
    }

    #[test]
    fn test_select_authoritative_prefers_processed() {
        let records = vec![
            rec(1, 10, RecordStatus::Processed),
            rec(2, 30, RecordStatus::Active),
            rec(3, 40, RecordStatus::Unresolved),
        ];
        assert_eq!(select_authoritative(&records).unwrap().id, RecordId::new(1));
    }

    #[test]
    fn test_select_authoritative_ignores_unresolved() {
        let records = vec![
            rec(1, 10, RecordStatus::Unresolved),
            rec(2, 20, RecordStatus::Ignored),
        ];
        assert!(select_authoritative(&records).is_none());

        let records = vec![rec(1, 10, RecordStatus::Ignored), rec(2, 5, RecordStatus::Active)];
        assert_eq!(select_authoritative(&records).unwrap().id, RecordId::new(2));
    }

    #[test]
    fn test_new_record_processed_keeps_fields() {
        let t = Utc.timestamp_opt(5, 0).unwrap();
        let r = NewRecord::processed("emp1", json!({"a": 1}), t);
        assert_eq!(r.status, RecordStatus::Processed);
        assert_eq!(r.entity_key, "emp1");
        assert_eq!(r.observed_at, t);
    }
}
