//! The engine running on the SQLite backend.

#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::thread;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tempfile::tempdir;

use claimfold::storage::SqliteStores;
use claimfold::{ClaimfoldEngine, PhantomReads, RecordStatus, ResolveScope};

fn day(d: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2024, 3, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

fn engine_over(stores: &Arc<SqliteStores>) -> ClaimfoldEngine {
    ClaimfoldEngine::new(stores.clone(), stores.clone())
}

#[test]
fn test_processed_record_takes_over_from_active() {
    let stores = Arc::new(SqliteStores::in_memory().unwrap());
    let engine = engine_over(&stores);

    let old = engine.ingest("emp1", json!({"v": 19}), day(19)).unwrap();
    let newer = engine.ingest("emp1", json!({"v": 20}), day(20)).unwrap();
    engine.resolve(&ResolveScope::All).unwrap();
    assert_eq!(engine.active_record("emp1").unwrap().unwrap().id, newer);

    let processed = engine.ingest_processed("emp1", json!({"v": 21}), day(21)).unwrap();
    let report = engine.resolve(&ResolveScope::All).unwrap();
    assert_eq!(report.dominated_count, 1);
    assert_eq!(report.phantom_reads, PhantomReads::Prevented);
    assert_eq!(engine.active_record("emp1").unwrap().unwrap().id, processed);

    let history = engine.history("emp1").unwrap();
    let ids: Vec<_> = history.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![old, newer, processed]);
    assert_eq!(history[0].status, RecordStatus::Ignored);
    assert_eq!(history[1].status, RecordStatus::Ignored);

    assert!(engine.resolve(&ResolveScope::All).unwrap().is_noop());
}

#[test]
fn test_tie_break_and_scope() {
    let stores = Arc::new(SqliteStores::in_memory().unwrap());
    let engine = engine_over(&stores);

    let lo = engine.ingest("a", json!({}), day(1)).unwrap();
    let hi = engine.ingest("a", json!({}), day(1)).unwrap();
    engine.ingest("b", json!({}), day(1)).unwrap();

    let report = engine.resolve(&ResolveScope::entities(["a"])).unwrap();
    assert_eq!(report.superseded_count, 1);
    assert_eq!(report.active_by_entity.len(), 1);
    assert_eq!(report.active_by_entity["a"], hi);
    assert!(hi > lo);
    assert_eq!(engine.pending_entities(10).unwrap(), vec!["b"]);
}

#[test]
fn test_state_persists_in_database_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("claimfold.db");

    {
        let stores = Arc::new(SqliteStores::open(&path).unwrap());
        let engine = engine_over(&stores);
        assert_eq!(engine.claim("badge-1", "emp1").unwrap(), "emp1");
        engine.ingest("emp1", json!({"v": 1}), day(1)).unwrap();
        engine.resolve(&ResolveScope::All).unwrap();
    }

    let stores = Arc::new(SqliteStores::open(&path).unwrap());
    let engine = engine_over(&stores);
    assert_eq!(engine.claim("badge-1", "emp2").unwrap(), "emp1");
    let active = engine.active_record("emp1").unwrap().unwrap();
    assert_eq!(active.status, RecordStatus::Active);
    assert_eq!(active.payload, json!({"v": 1}));
}

#[test]
fn test_concurrent_claims_agree() {
    let stores = Arc::new(SqliteStores::in_memory().unwrap());
    let engine = engine_over(&stores);

    let bound: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let engine = engine.clone();
                s.spawn(move || engine.claim("dept-1", &format!("w{i}")).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(bound.windows(2).all(|w| w[0] == w[1]));
}
