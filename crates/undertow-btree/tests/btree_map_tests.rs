// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Value};
use undertow_btree::{diff, BTree, DiffOp, ScanOptions};
use undertow_dag::{DagStore, DagWrite};
use undertow_kv::MemStore;

async fn dag_write() -> DagWrite {
    DagStore::new(Arc::new(MemStore::new()))
        .write()
        .await
        .unwrap()
}

#[tokio::test]
async fn put_get_del_laws() {
    let mut dag = dag_write().await;
    let mut tree = BTree::init(&mut dag);

    assert!(tree.put(&mut dag, "k", json!({"v": 1})).await.unwrap());
    assert_eq!(tree.get(&dag, "k").await.unwrap(), Some(json!({"v": 1})));
    assert!(tree.has(&dag, "k").await.unwrap());

    // Idempotent put reports no change and keeps the root stable.
    let root = tree.root();
    assert!(!tree.put(&mut dag, "k", json!({"v": 1})).await.unwrap());
    assert_eq!(tree.root(), root);

    assert!(tree.del(&mut dag, "k").await.unwrap());
    assert_eq!(tree.get(&dag, "k").await.unwrap(), None);
    assert!(!tree.del(&mut dag, "k").await.unwrap());
}

#[tokio::test]
async fn total_deletion_collapses_to_empty_leaf() {
    let mut dag = dag_write().await;
    let empty = BTree::init(&mut dag);
    let mut tree = empty;
    for i in 0..50 {
        tree.put(&mut dag, &format!("key{i:03}"), json!(i)).await.unwrap();
    }
    assert_ne!(tree.root(), empty.root());
    for i in 0..50 {
        tree.del(&mut dag, &format!("key{i:03}")).await.unwrap();
    }
    assert_eq!(tree.root(), empty.root());
}

#[tokio::test]
async fn bulk_volume_reads_back() {
    let mut dag = dag_write().await;
    let mut tree = BTree::init(&mut dag);
    for i in 0..500u32 {
        tree.put(&mut dag, &format!("k/{i:04}"), json!({"i": i}))
            .await
            .unwrap();
    }
    for i in (0..500u32).step_by(7) {
        assert_eq!(
            tree.get(&dag, &format!("k/{i:04}")).await.unwrap(),
            Some(json!({"i": i}))
        );
    }
    let all = tree
        .scan(&dag, &ScanOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 500);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0), "ascending order");
}

#[tokio::test]
async fn scan_prefix_start_and_limit() {
    let mut dag = dag_write().await;
    let mut tree = BTree::init(&mut dag);
    for key in ["a/1", "a/2", "a/3", "b/1", "c/1"] {
        tree.put(&mut dag, key, json!(key)).await.unwrap();
    }

    let scanned = tree
        .scan(
            &dag,
            &ScanOptions {
                prefix: "a/".into(),
                ..ScanOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        scanned.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
        vec!["a/1", "a/2", "a/3"]
    );

    let scanned = tree
        .scan(
            &dag,
            &ScanOptions {
                prefix: "a/".into(),
                start_key: Some("a/2".into()),
                start_exclusive: true,
                limit: Some(1),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        scanned.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
        vec!["a/3"]
    );

    let scanned = tree
        .scan(
            &dag,
            &ScanOptions {
                start_key: Some("b/1".into()),
                ..ScanOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        scanned.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
        vec!["b/1", "c/1"]
    );
}

async fn entries_of(tree: &BTree, dag: &DagWrite) -> BTreeMap<String, Value> {
    tree.scan(dag, &ScanOptions::default())
        .await
        .unwrap()
        .into_iter()
        .collect()
}

#[tokio::test]
async fn diff_transforms_old_into_new() {
    let mut dag = dag_write().await;
    let mut old = BTree::init(&mut dag);
    for i in 0..120u32 {
        old.put(&mut dag, &format!("k{i:03}"), json!(i)).await.unwrap();
    }
    let mut new = old;
    new.del(&mut dag, "k003").await.unwrap();
    new.put(&mut dag, "k050", json!("changed")).await.unwrap();
    new.put(&mut dag, "zzz", json!(true)).await.unwrap();

    let ops = diff(&dag, old.root(), new.root()).await.unwrap();
    assert!(ops.windows(2).all(|w| w[0].key() < w[1].key()));
    for op in &ops {
        assert_ne!(op.old_value(), op.new_value(), "no-op entries are omitted");
    }

    // Applying the ops to the old entry set reproduces the new one.
    let mut model = entries_of(&old, &dag).await;
    for op in &ops {
        match op {
            DiffOp::Add { key, new_value } | DiffOp::Change { key, new_value, .. } => {
                model.insert(key.clone(), new_value.clone());
            }
            DiffOp::Del { key, .. } => {
                model.remove(key);
            }
        }
    }
    assert_eq!(model, entries_of(&new, &dag).await);
    assert_eq!(ops.len(), 3);
}

#[tokio::test]
async fn diff_of_identical_roots_is_empty() {
    let mut dag = dag_write().await;
    let mut tree = BTree::init(&mut dag);
    tree.put(&mut dag, "a", json!(1)).await.unwrap();
    assert!(diff(&dag, tree.root(), tree.root()).await.unwrap().is_empty());
}

fn key_value_pairs() -> impl Strategy<Value = Vec<(String, u32)>> {
    proptest::collection::vec(("[a-e]{1,3}", 0u32..100), 1..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The root hash is a pure function of the final key→value map: building
    /// the same map along two different edit paths converges.
    #[test]
    fn root_hash_is_history_independent(
        pairs in key_value_pairs(),
        extra in "[a-e]{1,3}",
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut dag = dag_write().await;

            // Path one: insert in given order.
            let mut forward = BTree::init(&mut dag);
            for (k, v) in &pairs {
                forward.put(&mut dag, k, json!(v)).await.unwrap();
            }

            // Path two: insert reversed, with a detour through an extra key
            // that is deleted again.
            let mut detour = BTree::init(&mut dag);
            detour.put(&mut dag, &extra, json!("detour")).await.unwrap();
            for (k, v) in pairs.iter().rev() {
                detour.put(&mut dag, k, json!(v)).await.unwrap();
            }
            // Re-apply forward order so later duplicates win identically.
            for (k, v) in &pairs {
                detour.put(&mut dag, k, json!(v)).await.unwrap();
            }
            if !pairs.iter().any(|(k, _)| k == &extra) {
                detour.del(&mut dag, &extra).await.unwrap();
            }

            prop_assert_eq!(
                entries_of(&forward, &dag).await,
                entries_of(&detour, &dag).await
            );
            prop_assert_eq!(forward.root(), detour.root());
            Ok(())
        })?;
    }

    /// Tree contents always match a model map under random interleaved puts
    /// and dels.
    #[test]
    fn tree_matches_model_map(ops in proptest::collection::vec(("[a-d]{1,2}", proptest::option::of(0u32..10)), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut dag = dag_write().await;
            let mut tree = BTree::init(&mut dag);
            let mut model: BTreeMap<String, Value> = BTreeMap::new();
            for (key, op) in ops {
                match op {
                    Some(v) => {
                        tree.put(&mut dag, &key, json!(v)).await.unwrap();
                        model.insert(key, json!(v));
                    }
                    None => {
                        let changed = tree.del(&mut dag, &key).await.unwrap();
                        prop_assert_eq!(changed, model.remove(&key).is_some());
                    }
                }
            }
            prop_assert_eq!(entries_of(&tree, &dag).await, model);
            Ok(())
        })?;
    }
}
