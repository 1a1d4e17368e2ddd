//! Append-only ingestion of event records.
//!
//! Ingestion never looks at resolution state and never rejects duplicates.
//! Duplicates are expected; the batch resolver collapses them later.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::EngineResult;
use crate::record::{NewRecord, RecordId};
use crate::storage::RecordStore;
use crate::validation::InputLimits;

/// Appends new versioned records for an entity.
#[derive(Clone)]
pub struct RecordIngestor {
    records: Arc<dyn RecordStore>,
    limits: InputLimits,
}

impl RecordIngestor {
    /// Creates an ingestor over the given record store.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>, limits: InputLimits) -> Self {
        Self { records, limits }
    }

    /// Appends an `Unresolved` record and returns its id.
    ///
    /// # Errors
    /// - `Validation` for an empty/malformed key or a non-object payload
    /// - `StorageUnavailable` if the append fails
    pub fn ingest(
        &self,
        entity_key: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<RecordId> {
        let entity_key = self.limits.key("entity_key", entity_key)?;
        self.limits.payload(&payload)?;
        self.limits.timestamp("observed_at", observed_at)?;
        self.append(NewRecord::unresolved(entity_key, payload, observed_at))
    }

    /// Appends a record that a downstream consumer has already acted on.
    ///
    /// Processed records dominate every other record of their entity and are
    /// never demoted by the resolver.
    pub fn ingest_processed(
        &self,
        entity_key: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<RecordId> {
        let entity_key = self.limits.key("entity_key", entity_key)?;
        self.limits.payload(&payload)?;
        self.limits.timestamp("observed_at", observed_at)?;
        self.append(NewRecord::processed(entity_key, payload, observed_at))
    }

    fn append(&self, record: NewRecord) -> EngineResult<RecordId> {
        let stored = self.records.append(record)?;
        tracing::debug!(
            record_id = %stored.id,
            entity_key = %stored.entity_key,
            status = %stored.status,
            observed_at = %stored.observed_at,
            "record ingested"
        );
        Ok(stored.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::record::RecordStatus;
    use crate::storage::InMemoryRecordStore;

    fn setup() -> (Arc<InMemoryRecordStore>, RecordIngestor) {
        let store = Arc::new(InMemoryRecordStore::new());
        let ingestor = RecordIngestor::new(store.clone(), InputLimits::default());
        (store, ingestor)
    }

    #[test]
    fn test_duplicates_are_appended() {
        let (store, ingestor) = setup();
        let now = Utc::now();
        let a = ingestor.ingest("emp1", json!({"title": "eng"}), now).unwrap();
        let b = ingestor.ingest("emp1", json!({"title": "eng"}), now).unwrap();
        assert!(b > a);

        let history = store.find_by_entity("emp1").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.status == RecordStatus::Unresolved));
    }

    #[test]
    fn test_processed_ingest_sets_status() {
        let (store, ingestor) = setup();
        let id = ingestor
            .ingest_processed(" emp1 ", json!({}), Utc::now())
            .unwrap();
        let rec = store.get(id).unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Processed);
        assert_eq!(rec.entity_key, "emp1");
    }

    #[test]
    fn test_invalid_input_rejected() {
        let (store, ingestor) = setup();
        assert!(ingestor.ingest("", json!({}), Utc::now()).unwrap_err().is_validation());
        assert!(ingestor
            .ingest("emp1", json!("not an object"), Utc::now())
            .unwrap_err()
            .is_validation());
        assert!(ingestor
            .ingest("emp1", json!({}), chrono::DateTime::<Utc>::MAX_UTC)
            .unwrap_err()
            .is_validation());
        assert!(store.find_by_entity("emp1").unwrap().is_empty());
    }
}
