// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Refcount-GC soundness: after any sequence of puts and head moves, every
//! chunk reachable from a head is retained, every unreachable chunk is gone,
//! and each stored refcount equals heads-pointing plus inbound refs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use undertow_dag::{Chunk, DagStore, Hash};
use undertow_kv::MemStore;

/// A scripted commit: which previously-created chunks to reference from a
/// fresh parent, and where to point each of two heads afterwards.
#[derive(Debug, Clone)]
struct Step {
    child_picks: Vec<u8>,
    head_a: Option<u8>,
    head_b: Option<u8>,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (
        proptest::collection::vec(0u8..8, 0..4),
        proptest::option::of(0u8..8),
        proptest::option::of(0u8..8),
    )
        .prop_map(|(child_picks, head_a, head_b)| Step {
            child_picks,
            head_a,
            head_b,
        })
}

async fn run_script(steps: Vec<Step>) {
    let dag = DagStore::new(Arc::new(MemStore::new()));
    // All chunks ever created, in creation order, with their refs.
    let mut created: Vec<(Hash, Vec<Hash>)> = Vec::new();
    let mut heads: BTreeMap<&'static str, Hash> = BTreeMap::new();

    for (i, step) in steps.iter().enumerate() {
        let mut wt = dag.write().await.unwrap();

        let refs: Vec<Hash> = step
            .child_picks
            .iter()
            .filter_map(|pick| created.get(*pick as usize).map(|(h, _)| *h))
            .collect();
        let chunk = Chunk::new(json!({ "step": i }), &refs);
        let deduped: Vec<Hash> = chunk.refs().to_vec();
        // Re-put every chunk the new parent references so the commit is
        // self-contained even when the referenced chunk was collected.
        let mut to_put = vec![chunk.clone()];
        let mut seen: BTreeSet<Hash> = to_put.iter().map(Chunk::hash).collect();
        let mut frontier = deduped.clone();
        while let Some(h) = frontier.pop() {
            if !seen.insert(h) {
                continue;
            }
            let (_, child_refs) = created
                .iter()
                .find(|(ch, _)| *ch == h)
                .expect("script only references created chunks");
            let payload_idx = created.iter().position(|(ch, _)| *ch == h).unwrap();
            to_put.push(rebuild(payload_idx, child_refs));
            frontier.extend(child_refs.iter().copied());
        }
        for c in to_put {
            wt.put_chunk(c);
        }
        created.push((chunk.hash(), deduped));

        for (name, pick) in [("a", step.head_a), ("b", step.head_b)] {
            match pick {
                Some(p) => {
                    if let Some((h, _)) = created.get(p as usize) {
                        wt.set_head(name, *h);
                        heads.insert(name, *h);
                    }
                }
                None => {
                    wt.remove_head(name);
                    heads.remove(name);
                }
            }
        }
        // Heads may point at collected chunks from earlier steps; re-put
        // their closures too.
        for h in heads.values() {
            reput_closure(&mut wt, &created, *h);
        }
        wt.commit().await.unwrap();
    }

    check_invariants(&dag, &created, &heads).await;
}

fn rebuild(step_idx: usize, refs: &[Hash]) -> Chunk {
    Chunk::new(json!({ "step": step_idx }), refs)
}

fn reput_closure(
    wt: &mut undertow_dag::DagWrite,
    created: &[(Hash, Vec<Hash>)],
    root: Hash,
) {
    let mut frontier = vec![root];
    let mut seen = BTreeSet::new();
    while let Some(h) = frontier.pop() {
        if !seen.insert(h) {
            continue;
        }
        if let Some(idx) = created.iter().position(|(ch, _)| *ch == h) {
            let refs = created[idx].1.clone();
            wt.put_chunk(rebuild(idx, &refs));
            frontier.extend(refs);
        }
    }
}

async fn check_invariants(
    dag: &DagStore,
    created: &[(Hash, Vec<Hash>)],
    heads: &BTreeMap<&'static str, Hash>,
) {
    // Model: reachable set from heads over the scripted ref graph.
    let mut reachable: BTreeSet<Hash> = BTreeSet::new();
    let mut frontier: Vec<Hash> = heads.values().copied().collect();
    while let Some(h) = frontier.pop() {
        if !reachable.insert(h) {
            continue;
        }
        if let Some((_, refs)) = created.iter().find(|(ch, _)| *ch == h) {
            frontier.extend(refs.iter().copied());
        }
    }

    let rt = dag.read().await.unwrap();
    for (hash, refs) in created {
        let stored = rt.has_chunk(*hash).await.unwrap();
        assert_eq!(
            stored,
            reachable.contains(hash),
            "chunk {hash} stored={stored} but reachable={}",
            reachable.contains(hash)
        );
        if stored {
            let head_count = heads.values().filter(|h| *h == hash).count() as u64;
            let inbound = reachable
                .iter()
                .filter(|h| {
                    created
                        .iter()
                        .find(|(ch, _)| ch == *h)
                        .is_some_and(|(_, rs)| rs.contains(hash))
                })
                .count() as u64;
            assert_eq!(
                rt.ref_count(*hash).await.unwrap(),
                head_count + inbound,
                "refcount of {hash} != heads + inbound refs"
            );
        } else {
            assert_eq!(rt.ref_count(*hash).await.unwrap(), 0);
        }
        let _ = refs;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn gc_retains_exactly_the_reachable_set(steps in proptest::collection::vec(step_strategy(), 1..10)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run_script(steps));
    }
}
