//! Concurrent ownership claims against the in-memory backend.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use claimfold::{ClaimfoldEngine, Verdict};

const WRITERS: usize = 32;

#[test]
fn test_exactly_one_writer_wins() {
    let engine = ClaimfoldEngine::in_memory();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let results: Vec<(String, String)> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let engine = engine.clone();
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    let mine = format!("writer-{i}");
                    barrier.wait();
                    let bound = engine.claim("dept-42", &mine).unwrap();
                    (mine, bound)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let bound: HashSet<&str> = results.iter().map(|(_, b)| b.as_str()).collect();
    assert_eq!(bound.len(), 1, "all callers must observe the same owner");
    let winner = *bound.iter().next().unwrap();

    let winners = results.iter().filter(|(mine, b)| mine == b).count();
    assert_eq!(winners, 1);

    let durable = engine.registrar().owner_of("dept-42").unwrap().unwrap();
    assert_eq!(durable.secondary_key, winner);
}

#[test]
fn test_concurrent_verdicts_agree_with_owner() {
    let engine = ClaimfoldEngine::in_memory();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let verdicts: Vec<(String, Verdict)> = thread::scope(|s| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let engine = engine.clone();
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    let mine = format!("emp-{}", i % 4);
                    barrier.wait();
                    let verdict = engine.accept("badge-1", &mine).unwrap();
                    (mine, verdict)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let owner = engine.registrar().owner_of("badge-1").unwrap().unwrap();
    for (mine, verdict) in verdicts {
        if mine == owner.secondary_key {
            assert_eq!(verdict, Verdict::Accepted);
        } else {
            assert_eq!(
                verdict,
                Verdict::Rejected {
                    owned_secondary_key: owner.secondary_key.clone()
                }
            );
        }
    }
}

#[test]
fn test_independent_primary_keys_do_not_contend() {
    let engine = ClaimfoldEngine::in_memory();
    thread::scope(|s| {
        for i in 0..WRITERS {
            let engine = engine.clone();
            s.spawn(move || {
                let key = format!("p-{i}");
                assert_eq!(engine.claim(&key, "owner").unwrap(), "owner");
            });
        }
    });
    for i in 0..WRITERS {
        assert!(engine.registrar().owner_of(&format!("p-{i}")).unwrap().is_some());
    }
}
