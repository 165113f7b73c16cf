//! Concurrency invariants: readers never observe a stale computed field

use flowspell_core::{ComputedFieldDef, UpdateOp};
use flowspell_state::StateStore;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

/// Writers append items while readers continuously check that the computed
/// count matches the list length in every observed snapshot.
#[test]
fn concurrent_readers_see_consistent_computed_fields() {
    let store = Arc::new(StateStore::new());
    let mut computed = BTreeMap::new();
    computed.insert(
        "count".to_string(),
        ComputedFieldDef::single("state.items", "input.length"),
    );
    let mut defaults = BTreeMap::new();
    defaults.insert("items".to_string(), json!([]));
    store
        .initialise("wf_conc", &computed, &defaults, BTreeMap::new())
        .unwrap();

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..200 {
                store
                    .update("wf_conc", &[UpdateOp::append("state.items", json!(i))])
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = store.read("wf_conc").unwrap();
                    let len = snapshot.state["items"].as_array().unwrap().len();
                    let count = snapshot.computed["count"].as_i64().unwrap() as usize;
                    assert_eq!(len, count, "observed items={len} count={count}");
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let snapshot = store.read("wf_conc").unwrap();
    assert_eq!(snapshot.computed["count"], json!(200));
}

/// Different workflows proceed independently; writes to one never leak into
/// another.
#[test]
fn workflows_are_isolated() {
    let store = Arc::new(StateStore::new());
    for id in ["wf_a", "wf_b"] {
        let mut defaults = BTreeMap::new();
        defaults.insert("n".to_string(), json!(0));
        store
            .initialise(id, &BTreeMap::new(), &defaults, BTreeMap::new())
            .unwrap();
    }

    let handles: Vec<_> = [("wf_a", 1), ("wf_b", 1000)]
        .into_iter()
        .map(|(id, by)| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    store
                        .update(id, &[UpdateOp::increment("state.n", json!(by))])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.read("wf_a").unwrap().state["n"], json!(100));
    assert_eq!(store.read("wf_b").unwrap().state["n"], json!(100_000));
}

/// Sibling-style interleaved writers on one workflow are serialised; the
/// final state reflects every write.
#[test]
fn interleaved_writers_are_serialised() {
    let store = Arc::new(StateStore::new());
    let mut defaults = BTreeMap::new();
    defaults.insert("n".to_string(), json!(0));
    store
        .initialise("wf_shared", &BTreeMap::new(), &defaults, BTreeMap::new())
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    store
                        .update("wf_shared", &[UpdateOp::increment("state.n", json!(1))])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.read("wf_shared").unwrap().state["n"], json!(400));
}
