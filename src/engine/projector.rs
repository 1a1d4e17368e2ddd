//! Read-only view of resolved state.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::record::EventRecord;
use crate::storage::RecordStore;
use crate::validation::InputLimits;

/// Answers "what is the current record for this entity".
#[derive(Clone)]
pub struct StatusProjector {
    records: Arc<dyn RecordStore>,
    limits: InputLimits,
}

impl StatusProjector {
    /// Creates a projector over the given record store.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>, limits: InputLimits) -> Self {
        Self { records, limits }
    }

    /// The authoritative record of an entity: its latest `Processed` record if
    /// any, otherwise its `Active` record.
    ///
    /// Returns `None` when the entity has no records or has not been resolved
    /// yet. Never mutates anything.
    pub fn active_record(&self, entity_key: &str) -> EngineResult<Option<EventRecord>> {
        let entity_key = self.limits.key("entity_key", entity_key)?;
        Ok(self.records.find_authoritative(entity_key)?)
    }

    /// Every record of an entity ordered by `(observed_at, id)`.
    pub fn history(&self, entity_key: &str) -> EngineResult<Vec<EventRecord>> {
        let entity_key = self.limits.key("entity_key", entity_key)?;
        Ok(self.records.find_by_entity(entity_key)?)
    }

    /// Up to `limit` entity keys, sorted, that the next resolution run would change.
    pub fn pending_entities(&self, limit: usize) -> EngineResult<Vec<String>> {
        Ok(self.records.unsettled_entities(limit)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::engine::BatchResolver;
    use crate::record::{NewRecord, RecordStatus};
    use crate::storage::{InMemoryRecordStore, ResolveScope};

    fn setup() -> (Arc<InMemoryRecordStore>, StatusProjector, BatchResolver) {
        let store = Arc::new(InMemoryRecordStore::new());
        let projector = StatusProjector::new(store.clone(), InputLimits::default());
        let resolver = BatchResolver::new(store.clone(), InputLimits::default(), None);
        (store, projector, resolver)
    }

    #[test]
    fn test_unknown_and_unresolved_entities_have_no_active_record() {
        let (store, projector, _) = setup();
        assert!(projector.active_record("nobody").unwrap().is_none());

        store
            .append(NewRecord::unresolved("emp1", json!({}), Utc::now()))
            .unwrap();
        assert!(projector.active_record("emp1").unwrap().is_none());
        assert_eq!(projector.pending_entities(10).unwrap(), vec!["emp1".to_string()]);
    }

    #[test]
    fn test_active_record_after_resolution() {
        let (store, projector, resolver) = setup();
        let now = Utc::now();
        store
            .append(NewRecord::unresolved("emp1", json!({"v": 1}), now - Duration::hours(1)))
            .unwrap();
        let latest = store
            .append(NewRecord::unresolved("emp1", json!({"v": 2}), now))
            .unwrap();
        resolver.resolve(&ResolveScope::All).unwrap();

        let active = projector.active_record("emp1").unwrap().unwrap();
        assert_eq!(active.id, latest.id);
        assert_eq!(active.status, RecordStatus::Active);
        assert!(projector.pending_entities(10).unwrap().is_empty());
    }

    #[test]
    fn test_processed_record_is_authoritative() {
        let (store, projector, resolver) = setup();
        let now = Utc::now();
        let processed = store
            .append(NewRecord::processed("emp1", json!({}), now - Duration::days(1)))
            .unwrap();
        store
            .append(NewRecord::unresolved("emp1", json!({}), now))
            .unwrap();
        resolver.resolve(&ResolveScope::All).unwrap();

        assert_eq!(projector.active_record("emp1").unwrap().unwrap().id, processed.id);
    }

    #[test]
    fn test_history_is_ordered_by_observation() {
        let (store, projector, _) = setup();
        let now = Utc::now();
        store.append(NewRecord::unresolved("e", json!({}), now)).unwrap();
        store
            .append(NewRecord::unresolved("e", json!({}), now - Duration::minutes(5)))
            .unwrap();

        let history = projector.history("e").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].observed_at < history[1].observed_at);
    }

    #[test]
    fn test_pending_entities_sorted_and_limited() {
        let (store, projector, _) = setup();
        for key in ["c", "a", "b"] {
            store
                .append(NewRecord::unresolved(key, json!({}), Utc::now()))
                .unwrap();
        }
        assert_eq!(projector.pending_entities(2).unwrap(), vec!["a", "b"]);
    }
}
