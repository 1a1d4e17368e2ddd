//! SQLite backend.
//!
//! Claims and resolver passes map onto native SQL:
//! - `insert_if_absent` is `INSERT .. ON CONFLICT DO NOTHING RETURNING`, falling
//!   back to reading the existing row, inside one `BEGIN IMMEDIATE` transaction.
//! - each [`BulkUpdate`] is one `UPDATE .. WHERE EXISTS (correlated subquery)`
//!   statement; a batch runs inside a single `BEGIN IMMEDIATE` transaction.
//!
//! Timestamps are stored as integer nanoseconds since the epoch, the same
//! precision `DateTime<Utc>` carries, so recency ranks exactly as in the other
//! backends.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::record::{EventRecord, NewRecord, RecordId, RecordStatus};
use crate::storage::traits::{
    BulkOutcome, BulkUpdate, ClaimStore, PhantomReads, RecordStore, ResolveScope, StorageError,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ownership_claims (
        primary_key   TEXT PRIMARY KEY NOT NULL,
        secondary_key TEXT NOT NULL,
        claimed_at    INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS event_records (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_key  TEXT NOT NULL,
        payload     TEXT NOT NULL,
        status      TEXT NOT NULL,
        observed_at INTEGER NOT NULL,
        ingested_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_records_entity_status
        ON event_records (entity_key, status);
    CREATE INDEX IF NOT EXISTS idx_event_records_status
        ON event_records (status);
";

const CLAIM_INSERT_SQL: &str = "
    INSERT INTO ownership_claims (primary_key, secondary_key, claimed_at)
    VALUES (?1, ?2, ?3)
    ON CONFLICT (primary_key) DO NOTHING
    RETURNING primary_key, secondary_key, claimed_at
";

const CLAIM_SELECT_SQL: &str = "
    SELECT primary_key, secondary_key, claimed_at FROM ownership_claims WHERE primary_key = ?1
";

const RECORD_COLUMNS: &str = "id, entity_key, payload, status, observed_at, ingested_at";

// `?1` is NULL for the whole table, or a JSON array of entity keys.
const IGNORE_DOMINATED_SQL: &str = "
    UPDATE event_records SET status = 'ignored'
    WHERE status IN ('unresolved', 'active')
      AND (?1 IS NULL OR entity_key IN (SELECT value FROM json_each(?1)))
      AND EXISTS (
          SELECT 1 FROM event_records p
          WHERE p.entity_key = event_records.entity_key AND p.status = 'processed'
      )
    RETURNING entity_key
";

const IGNORE_SUPERSEDED_SQL: &str = "
    UPDATE event_records SET status = 'ignored'
    WHERE status IN ('unresolved', 'active')
      AND (?1 IS NULL OR entity_key IN (SELECT value FROM json_each(?1)))
      AND NOT EXISTS (
          SELECT 1 FROM event_records p
          WHERE p.entity_key = event_records.entity_key AND p.status = 'processed'
      )
      AND (observed_at, id) < (
          SELECT n.observed_at, n.id FROM event_records n
          WHERE n.entity_key = event_records.entity_key
            AND n.status IN ('unresolved', 'active')
          ORDER BY n.observed_at DESC, n.id DESC
          LIMIT 1
      )
    RETURNING entity_key
";

const ACTIVATE_SURVIVORS_SQL: &str = "
    UPDATE event_records SET status = 'active'
    WHERE status = 'unresolved'
      AND (?1 IS NULL OR entity_key IN (SELECT value FROM json_each(?1)))
      AND NOT EXISTS (
          SELECT 1 FROM event_records p
          WHERE p.entity_key = event_records.entity_key AND p.status = 'processed'
      )
      AND NOT EXISTS (
          SELECT 1 FROM event_records n
          WHERE n.entity_key = event_records.entity_key
            AND n.status IN ('unresolved', 'active')
            AND (n.observed_at, n.id) > (event_records.observed_at, event_records.id)
      )
    RETURNING entity_key
";

const UNSETTLED_SQL: &str = "
    SELECT DISTINCT r.entity_key FROM event_records r
    WHERE r.status = 'unresolved'
       OR (r.status = 'active' AND EXISTS (
              SELECT 1 FROM event_records p
              WHERE p.entity_key = r.entity_key AND p.status = 'processed'))
    ORDER BY r.entity_key
    LIMIT ?1
";

fn backend_err(err: rusqlite::Error) -> StorageError {
    StorageError::BackendError(err.to_string())
}

fn lock_err() -> StorageError {
    StorageError::BackendError("poisoned lock: sqlite.connection".to_string())
}

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn to_nanos(field: &str, at: DateTime<Utc>) -> Result<i64, StorageError> {
    at.timestamp_nanos_opt().ok_or_else(|| {
        StorageError::SerializationError(format!("{field} out of range for nanosecond storage: {at}"))
    })
}

fn map_claim(row: &Row<'_>) -> rusqlite::Result<OwnershipClaim> {
    Ok(OwnershipClaim {
        primary_key: row.get(0)?,
        secondary_key: row.get(1)?,
        claimed_at: DateTime::from_timestamp_nanos(row.get(2)?),
    })
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let id: i64 = row.get(0)?;
    let payload: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(EventRecord {
        id: RecordId::new(
            u64::try_from(id).map_err(|_| conversion_err(0, format!("negative id {id}")))?,
        ),
        entity_key: row.get(1)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| conversion_err(2, format!("invalid payload json: {e}")))?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| conversion_err(3, format!("unknown status {status:?}")))?,
        observed_at: DateTime::from_timestamp_nanos(row.get(4)?),
        ingested_at: DateTime::from_timestamp_nanos(row.get(5)?),
    })
}

fn scope_param(scope: &ResolveScope) -> Result<Option<String>, StorageError> {
    match scope {
        ResolveScope::All => Ok(None),
        ResolveScope::Entities(keys) => serde_json::to_string(keys)
            .map(Some)
            .map_err(|e| StorageError::SerializationError(e.to_string())),
    }
}

const fn update_sql(update: BulkUpdate) -> &'static str {
    match update {
        BulkUpdate::IgnoreDominatedByProcessed => IGNORE_DOMINATED_SQL,
        BulkUpdate::IgnoreSupersededByRecency => IGNORE_SUPERSEDED_SQL,
        BulkUpdate::ActivateSurvivors => ACTIVATE_SURVIVORS_SQL,
    }
}

/// SQLite-backed claim and record store sharing one connection.
pub struct SqliteStores {
    conn: Mutex<Connection>,
}

impl SqliteStores {
    /// Opens (or creates) a database file and bootstraps the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Self::bootstrap(conn)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ClaimStore for SqliteStores {
    fn insert_if_absent(&self, claim: OwnershipClaim) -> Result<ClaimWrite, StorageError> {
        let claimed_at = to_nanos("claimed_at", claim.claimed_at)?;
        let mut conn = self.conn.lock().map_err(|_| lock_err())?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend_err)?;

        let inserted = tx
            .query_row(
                CLAIM_INSERT_SQL,
                params![claim.primary_key, claim.secondary_key, claimed_at],
                map_claim,
            )
            .optional()
            .map_err(backend_err)?;
        let write = match inserted {
            Some(durable) => ClaimWrite::Inserted(durable),
            None => ClaimWrite::Existing(
                tx.query_row(CLAIM_SELECT_SQL, params![claim.primary_key], map_claim)
                    .map_err(backend_err)?,
            ),
        };

        tx.commit().map_err(backend_err)?;
        Ok(write)
    }

    fn get(&self, primary_key: &str) -> Result<Option<OwnershipClaim>, StorageError> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.query_row(CLAIM_SELECT_SQL, params![primary_key], map_claim)
            .optional()
            .map_err(backend_err)
    }
}

impl RecordStore for SqliteStores {
    fn append(&self, record: NewRecord) -> Result<EventRecord, StorageError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let observed_at = to_nanos("observed_at", record.observed_at)?;
        let ingested_at = Utc::now();

        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let id: i64 = conn
            .query_row(
                "INSERT INTO event_records (entity_key, payload, status, observed_at, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
                params![
                    record.entity_key,
                    payload,
                    record.status.as_str(),
                    observed_at,
                    to_nanos("ingested_at", ingested_at)?
                ],
                |row| row.get(0),
            )
            .map_err(backend_err)?;
        let id = u64::try_from(id)
            .map_err(|_| StorageError::BackendError(format!("negative record id {id}")))?;
        Ok(record.into_record(RecordId::new(id), ingested_at))
    }

    fn get(&self, id: RecordId) -> Result<Option<EventRecord>, StorageError> {
        let raw = i64::try_from(id.get()).map_err(|_| StorageError::RecordNotFound(id))?;
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM event_records WHERE id = ?1"),
            params![raw],
            map_record,
        )
        .optional()
        .map_err(backend_err)
    }

    fn find_by_entity(&self, entity_key: &str) -> Result<Vec<EventRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM event_records
                 WHERE entity_key = ?1
                 ORDER BY observed_at ASC, id ASC"
            ))
            .map_err(backend_err)?;
        let rows = stmt
            .query_map(params![entity_key], map_record)
            .map_err(backend_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend_err)
    }

    fn find_authoritative(&self, entity_key: &str) -> Result<Option<EventRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM event_records
                 WHERE entity_key = ?1 AND status IN ('processed', 'active')
                 ORDER BY status = 'processed' DESC, observed_at DESC, id DESC
                 LIMIT 1"
            ),
            params![entity_key],
            map_record,
        )
        .optional()
        .map_err(backend_err)
    }

    fn unsettled_entities(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock().map_err(|_| lock_err())?;
        let mut stmt = conn.prepare(UNSETTLED_SQL).map_err(backend_err)?;
        let rows = stmt
            .query_map(params![limit], |row| row.get(0))
            .map_err(backend_err)?;
        rows.collect::<Result<Vec<String>, _>>().map_err(backend_err)
    }

    fn apply_bulk(
        &self,
        scope: &ResolveScope,
        updates: &[BulkUpdate],
    ) -> Result<BulkOutcome, StorageError> {
        let scope = scope_param(scope)?;
        let mut conn = self.conn.lock().map_err(|_| lock_err())?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(backend_err)?;

        let mut affected = Vec::with_capacity(updates.len());
        let mut touched = BTreeSet::new();
        for &update in updates {
            let mut stmt = tx.prepare(update_sql(update)).map_err(backend_err)?;
            let keys = stmt
                .query_map(params![scope], |row| row.get::<_, String>(0))
                .map_err(backend_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend_err)?;
            affected.push(keys.len() as u64);
            touched.extend(keys);
        }

        let mut survivors = BTreeMap::new();
        if !touched.is_empty() {
            let touched_json = serde_json::to_string(&touched)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            let mut stmt = tx
                .prepare(
                    "SELECT entity_key, id FROM event_records
                     WHERE status IN ('processed', 'active')
                       AND entity_key IN (SELECT value FROM json_each(?1))
                     ORDER BY entity_key, status = 'processed', observed_at, id",
                )
                .map_err(backend_err)?;
            let rows = stmt
                .query_map(params![touched_json], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(backend_err)?;
            // Rows are ordered so the preferred record per entity comes last.
            for row in rows {
                let (key, id) = row.map_err(backend_err)?;
                let id = u64::try_from(id)
                    .map_err(|_| StorageError::BackendError(format!("negative record id {id}")))?;
                survivors.insert(key, RecordId::new(id));
            }
        }

        tx.commit().map_err(backend_err)?;
        Ok(BulkOutcome { affected, survivors })
    }

    fn phantom_reads(&self) -> PhantomReads {
        // BEGIN IMMEDIATE takes the write lock up front; no other writer can
        // insert until the batch commits.
        PhantomReads::Prevented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use serde_json::json;

    use crate::engine::RESOLUTION_PASSES as PASSES;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn claim_returns_existing_binding() {
        let store = SqliteStores::in_memory().unwrap();
        let first = store.insert_if_absent(OwnershipClaim::new("p", "a")).unwrap();
        assert!(first.was_inserted());
        let second = store.insert_if_absent(OwnershipClaim::new("p", "b")).unwrap();
        assert!(!second.was_inserted());
        assert_eq!(second.claim().secondary_key, "a");
        assert_eq!(ClaimStore::get(&store, "p").unwrap().unwrap().secondary_key, "a");
    }

    #[test]
    fn claim_reports_insertion_exactly() {
        let store = SqliteStores::in_memory().unwrap();
        let claim = OwnershipClaim::new("p", "a");
        let first = store.insert_if_absent(claim.clone()).unwrap();
        assert_eq!(first, ClaimWrite::Inserted(claim.clone()));

        // Same secondary key, same timestamp: still not a second insertion.
        let again = store.insert_if_absent(claim.clone()).unwrap();
        assert_eq!(again, ClaimWrite::Existing(claim));
    }

    #[test]
    fn recency_keeps_nanosecond_precision() {
        let store = SqliteStores::in_memory().unwrap();
        let base = at(20);
        let later = store
            .append(NewRecord::unresolved("e", json!({}), base + chrono::Duration::nanoseconds(500)))
            .unwrap();
        let earlier = store
            .append(NewRecord::unresolved("e", json!({}), base + chrono::Duration::nanoseconds(100)))
            .unwrap();
        assert!(earlier.id > later.id);

        let outcome = store.apply_bulk(&ResolveScope::All, &PASSES).unwrap();
        assert_eq!(outcome.survivors["e"], later.id);
        let active = store.find_authoritative("e").unwrap().unwrap();
        assert_eq!(active.observed_at, later.observed_at);
        assert_eq!(
            RecordStore::get(&store, earlier.id).unwrap().unwrap().status,
            RecordStatus::Ignored
        );
    }

    #[test]
    fn record_roundtrip_and_order() {
        let store = SqliteStores::in_memory().unwrap();
        let b = store.append(NewRecord::unresolved("e", json!({"v": 2}), at(20))).unwrap();
        let a = store.append(NewRecord::unresolved("e", json!({"v": 1}), at(10))).unwrap();
        assert_eq!(RecordStore::get(&store, b.id).unwrap().unwrap(), b);
        let ids: Vec<_> = store.find_by_entity("e").unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn passes_match_policy() {
        let store = SqliteStores::in_memory().unwrap();
        let e1_p = store.append(NewRecord::processed("e1", json!({}), at(1))).unwrap();
        let e1_u = store.append(NewRecord::unresolved("e1", json!({}), at(2))).unwrap();
        let e2_old = store.append(NewRecord::unresolved("e2", json!({}), at(1))).unwrap();
        let e2_new = store.append(NewRecord::unresolved("e2", json!({}), at(2))).unwrap();
        let tie_lo = store.append(NewRecord::unresolved("e3", json!({}), at(5))).unwrap();
        let tie_hi = store.append(NewRecord::unresolved("e3", json!({}), at(5))).unwrap();

        let outcome = store.apply_bulk(&ResolveScope::All, &PASSES).unwrap();
        assert_eq!(outcome.affected, vec![1, 2, 2]);
        assert_eq!(outcome.survivors["e1"], e1_p.id);
        assert_eq!(outcome.survivors["e2"], e2_new.id);
        assert_eq!(outcome.survivors["e3"], tie_hi.id);

        let status = |id| RecordStore::get(&store, id).unwrap().unwrap().status;
        assert_eq!(status(e1_p.id), RecordStatus::Processed);
        assert_eq!(status(e1_u.id), RecordStatus::Ignored);
        assert_eq!(status(e2_old.id), RecordStatus::Ignored);
        assert_eq!(status(tie_lo.id), RecordStatus::Ignored);

        let again = store.apply_bulk(&ResolveScope::All, &PASSES).unwrap();
        assert_eq!(again.total_affected(), 0);
        assert!(store.unsettled_entities(10).unwrap().is_empty());
    }

    #[test]
    fn scope_restricts_updates() {
        let store = SqliteStores::in_memory().unwrap();
        store.append(NewRecord::unresolved("a", json!({}), at(1))).unwrap();
        let b = store.append(NewRecord::unresolved("b", json!({}), at(1))).unwrap();

        let outcome = store
            .apply_bulk(&ResolveScope::entities(["a"]), &PASSES)
            .unwrap();
        assert_eq!(outcome.total_affected(), 1);
        assert_eq!(
            RecordStore::get(&store, b.id).unwrap().unwrap().status,
            RecordStatus::Unresolved
        );
        assert_eq!(store.unsettled_entities(10).unwrap(), vec!["b".to_string()]);
    }
}
