// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end pull flows over a lazy dag: fresh snapshot application,
//! rebase of pending mutations, cookie races, and push collection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use undertow_btree::DiffOp;
use undertow_dag::{head, DagStore, Hash, LazyStore};
use undertow_kv::MemStore;
use undertow_sync::{
    begin_pull, collect_pending_mutations, genesis_commit, handle_pull_response, local_mutations,
    maybe_end_pull, next_mutation_id, push, read_commit, replay_mutation, BeginPullResult,
    ClientId, HandlePullResponse, LocalCommitArgs, MutatorFn, MutatorFuture, MutatorRegistry,
    PatchOp, PullDescription, PullError, PullRequest, PullResponse, PullResponseOk, Puller,
    PullerResult, PushDescription, PushOutcome, PushRequest, Pusher, PusherResult, ReadTx,
    SyncError, Whence, WriteTx, HttpRequestInfo, MAIN_DIFF_KEY,
};

fn add_data<'a>(tx: &'a mut WriteTx, args: Value) -> MutatorFuture<'a> {
    Box::pin(async move {
        let Value::Object(map) = args else {
            anyhow::bail!("addData expects an object");
        };
        for (key, value) in map {
            tx.put(&key, value).await?;
        }
        Ok(())
    })
}

fn mutators() -> MutatorRegistry {
    let mut registry = MutatorRegistry::new();
    registry.insert("addData".to_owned(), Arc::new(add_data) as MutatorFn);
    registry
}

async fn fresh_lazy() -> LazyStore {
    let source = DagStore::new(Arc::new(MemStore::new()));
    let lazy = LazyStore::new(source, 16 * 1024 * 1024);
    let mut wt = lazy.write().await.unwrap();
    let (genesis, _) = genesis_commit(&mut wt, &[]).unwrap();
    wt.set_head(head::MAIN, genesis);
    wt.commit().await.unwrap();
    lazy
}

struct FixedPuller {
    response: PullResponse,
    requests: Mutex<Vec<PullRequest>>,
}

impl FixedPuller {
    fn ok(cookie: Value, lmid: &[(&str, u64)], patch: Vec<PatchOp>) -> Self {
        Self {
            response: PullResponse::Ok(PullResponseOk {
                cookie,
                last_mutation_id_changes: lmid
                    .iter()
                    .map(|(c, id)| (ClientId::from(*c), *id))
                    .collect(),
                patch,
            }),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Puller for FixedPuller {
    async fn pull(
        &self,
        request: &PullRequest,
        _request_id: &str,
    ) -> Result<PullerResult, PullError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PullerResult {
            response: Some(self.response.clone()),
            http_request_info: HttpRequestInfo::ok(),
        })
    }
}

fn desc() -> PullDescription {
    PullDescription {
        profile_id: "p1".into(),
        client_group_id: "g1".into(),
        schema_version: "1".into(),
    }
}

async fn mutate(lazy: &LazyStore, client: &str, args: Value) -> Hash {
    let registry = mutators();
    let mut wt = WriteTx::open(lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    let client_id = ClientId::from(client);
    let mutation_id = next_mutation_id(wt.dag(), &client_id, wt.basis_hash(), 0)
        .await
        .unwrap();
    let mutator = registry.get("addData").unwrap();
    mutator(&mut wt, args.clone()).await.unwrap();
    wt.commit_local(
        head::MAIN,
        LocalCommitArgs {
            client_id,
            mutation_id,
            mutator_name: "addData".into(),
            mutator_args: args,
            original_hash: None,
            timestamp: 100,
        },
    )
    .await
    .unwrap()
}

async fn finish_pull(lazy: &LazyStore, sync_head: Hash) -> undertow_sync::MaybeEndPullResult {
    let registry = mutators();
    // Each replay moves the sync head; the next finalization turn must
    // expect the moved head.
    let mut expected = sync_head;
    loop {
        let result = maybe_end_pull(lazy, expected).await.unwrap();
        if result.replay_mutations.is_empty() {
            return result;
        }
        for replay in &result.replay_mutations {
            expected = replay_mutation(lazy, &registry, head::SYNC, replay)
                .await
                .unwrap();
        }
    }
}

#[tokio::test]
async fn fresh_snapshot_applies_patch_and_cookie() {
    let lazy = fresh_lazy().await;
    let puller = FixedPuller::ok(
        json!("c1"),
        &[],
        vec![
            PatchOp::Put {
                key: "a".into(),
                value: json!(1),
            },
            PatchOp::Put {
                key: "b".into(),
                value: json!(2),
            },
        ],
    );

    let begin = begin_pull(&lazy, &puller, &desc(), "rid-1").await.unwrap();
    let BeginPullResult::Applied { sync_head } = begin.result else {
        unreachable!("expected Applied, got {:?}", begin.result);
    };
    let end = finish_pull(&lazy, sync_head).await;

    let diffs = end.diffs.get(MAIN_DIFF_KEY).unwrap();
    assert_eq!(
        diffs,
        &vec![
            DiffOp::Add {
                key: "a".into(),
                new_value: json!(1)
            },
            DiffOp::Add {
                key: "b".into(),
                new_value: json!(2)
            },
        ]
    );

    let rt = ReadTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    assert_eq!(rt.get("a").await.unwrap(), Some(json!(1)));
    assert_eq!(rt.get("b").await.unwrap(), Some(json!(2)));
    assert_eq!(
        rt.commit().as_snapshot().unwrap().cookie,
        json!("c1"),
        "main cookie advanced"
    );

    // The request carried the base cookie and group id.
    let requests = puller.requests.lock().unwrap();
    assert_eq!(requests[0].cookie, Value::Null);
    assert_eq!(requests[0].client_group_id, "g1".into());
}

#[tokio::test]
async fn pending_mutation_replays_onto_new_snapshot() {
    let lazy = fresh_lazy().await;

    // Land cookie c1 with {a: 1}.
    let first = FixedPuller::ok(
        json!("c1"),
        &[],
        vec![PatchOp::Put {
            key: "a".into(),
            value: json!(1),
        }],
    );
    let begin = begin_pull(&lazy, &first, &desc(), "rid-1").await.unwrap();
    let BeginPullResult::Applied { sync_head } = begin.result else {
        unreachable!();
    };
    finish_pull(&lazy, sync_head).await;

    // Local optimistic write: a = 2.
    let original = mutate(&lazy, "tab-1", json!({"a": 2})).await;
    let original_commit = {
        let dag = lazy.read().await.unwrap();
        read_commit(&dag, original).await.unwrap()
    };
    let original_id = original_commit.as_local().unwrap().mutation_id;

    // Pull c2 which knows nothing of the local write.
    let second = FixedPuller::ok(
        json!("c2"),
        &[],
        vec![PatchOp::Put {
            key: "b".into(),
            value: json!(3),
        }],
    );
    let begin = begin_pull(&lazy, &second, &desc(), "rid-2").await.unwrap();
    let BeginPullResult::Applied { sync_head } = begin.result else {
        unreachable!();
    };

    // First finalization turn hands back the pending mutation.
    let turn = maybe_end_pull(&lazy, sync_head).await.unwrap();
    assert_eq!(turn.replay_mutations.len(), 1);
    assert!(turn.diffs.is_empty(), "no diffs on replay turns");

    let end = finish_pull(&lazy, sync_head).await;
    assert!(end.replay_mutations.is_empty());

    let rt = ReadTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    assert_eq!(rt.get("a").await.unwrap(), Some(json!(2)), "local write replayed");
    assert_eq!(rt.get("b").await.unwrap(), Some(json!(3)), "server patch applied");

    // The replayed head keeps the original mutation ID and records its
    // provenance.
    let dag = lazy.read().await.unwrap();
    let main_head = dag.must_get_head(head::MAIN).unwrap();
    let pending = local_mutations(&dag, main_head).await.unwrap();
    assert_eq!(pending.len(), 1);
    let replayed = pending[0].1.as_local().unwrap();
    assert_eq!(replayed.mutation_id, original_id);
    assert_eq!(replayed.original_hash, Some(original));
}

#[tokio::test]
async fn cookie_regression_is_rejected_without_side_effects() {
    let lazy = fresh_lazy().await;
    let first = FixedPuller::ok(json!("c2"), &[], vec![]);
    let begin = begin_pull(&lazy, &first, &desc(), "rid-1").await.unwrap();
    let BeginPullResult::Applied { sync_head } = begin.result else {
        unreachable!();
    };
    finish_pull(&lazy, sync_head).await;

    let stale = PullResponseOk {
        cookie: json!("c1"),
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![PatchOp::Put {
            key: "x".into(),
            value: json!(9),
        }],
    };
    let err = handle_pull_response(&lazy, &json!("c2"), &stale)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("Received cookie \"c1\" is < last snapshot cookie \"c2\"; ignoring client view"),
        "unexpected message: {message}"
    );

    // Main untouched.
    let rt = ReadTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    assert_eq!(rt.commit().as_snapshot().unwrap().cookie, json!("c2"));
    assert_eq!(rt.get("x").await.unwrap(), None);
}

#[tokio::test]
async fn equal_cookie_is_a_noop() {
    let lazy = fresh_lazy().await;
    let response = PullResponseOk {
        cookie: Value::Null,
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![],
    };
    let result = handle_pull_response(&lazy, &Value::Null, &response)
        .await
        .unwrap();
    assert_eq!(result, HandlePullResponse::NoOp);
}

#[tokio::test]
async fn last_mutation_id_regression_is_rejected() {
    let lazy = fresh_lazy().await;
    // Land a snapshot that confirms tab-1 at 5.
    let first = FixedPuller::ok(json!("c1"), &[("tab-1", 5)], vec![]);
    let begin = begin_pull(&lazy, &first, &desc(), "rid-1").await.unwrap();
    let BeginPullResult::Applied { sync_head } = begin.result else {
        unreachable!();
    };
    finish_pull(&lazy, sync_head).await;

    let response = PullResponseOk {
        cookie: json!("c2"),
        last_mutation_id_changes: [(ClientId::from("tab-1"), 3)].into(),
        patch: vec![],
    };
    let err = handle_pull_response(&lazy, &json!("c1"), &response)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LastMutationIdRegression { .. }));
}

#[tokio::test]
async fn same_response_applies_at_most_once() {
    let lazy = fresh_lazy().await;
    let response = PullResponseOk {
        cookie: json!("c1"),
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![PatchOp::Put {
            key: "a".into(),
            value: json!(1),
        }],
    };

    let first = handle_pull_response(&lazy, &Value::Null, &response)
        .await
        .unwrap();
    let HandlePullResponse::Applied { sync_head } = first else {
        unreachable!();
    };
    finish_pull(&lazy, sync_head).await;

    // The racing pull saw the same base; it loses with CookieMismatch.
    let second = handle_pull_response(&lazy, &Value::Null, &response)
        .await
        .unwrap();
    assert_eq!(second, HandlePullResponse::CookieMismatch);
}

#[tokio::test]
async fn overlapping_sync_is_detected() {
    let lazy = fresh_lazy().await;
    let response = PullResponseOk {
        cookie: json!("c1"),
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![],
    };
    let HandlePullResponse::Applied { sync_head } =
        handle_pull_response(&lazy, &Value::Null, &response)
            .await
            .unwrap()
    else {
        unreachable!();
    };

    // A racing refresh replaces main with a different snapshot before the
    // pull finalizes.
    {
        let dag = lazy.write().await.unwrap();
        let main_head = dag.must_get_head(head::MAIN).unwrap();
        let commit = read_commit(&dag, main_head).await.unwrap();
        let wt = WriteTx::from_parts(dag, main_head, commit);
        wt.commit_snapshot(
            head::MAIN,
            undertow_sync::SnapshotCommitArgs {
                basis_hash: Some(main_head),
                last_mutation_ids: BTreeMap::new(),
                cookie: json!("refresh"),
            },
        )
        .await
        .unwrap();
    }

    let err = maybe_end_pull(&lazy, sync_head).await.unwrap_err();
    assert!(matches!(err, SyncError::OverlappingSyncs));
}

#[tokio::test]
async fn apply_patch_update_and_clear_semantics() {
    let lazy = fresh_lazy().await;
    let response = PullResponseOk {
        cookie: json!("c1"),
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![
            PatchOp::Put {
                key: "gone".into(),
                value: json!(1),
            },
            PatchOp::Clear,
            PatchOp::Put {
                key: "row".into(),
                value: json!({"a": 1, "b": 2, "c": 3}),
            },
            PatchOp::Update {
                key: "row".into(),
                merge: Some(
                    json!({"b": 20})
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                constrain: Some(vec!["a".into(), "b".into()]),
            },
            PatchOp::Del { key: "nope".into() },
        ],
    };
    let HandlePullResponse::Applied { sync_head } =
        handle_pull_response(&lazy, &Value::Null, &response)
            .await
            .unwrap()
    else {
        unreachable!();
    };
    finish_pull(&lazy, sync_head).await;

    let rt = ReadTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    assert_eq!(rt.get("gone").await.unwrap(), None, "clear wiped earlier put");
    assert_eq!(
        rt.get("row").await.unwrap(),
        Some(json!({"a": 1, "b": 20})),
        "constrain then merge"
    );
}

struct RecordingPusher {
    requests: Mutex<Vec<PushRequest>>,
    response: Option<undertow_sync::PushResponse>,
}

#[async_trait::async_trait]
impl Pusher for RecordingPusher {
    async fn push(
        &self,
        request: &PushRequest,
        _request_id: &str,
    ) -> Result<PusherResult, undertow_sync::PushError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(PusherResult {
            response: self.response.clone(),
            http_request_info: HttpRequestInfo::ok(),
        })
    }
}

#[tokio::test]
async fn push_sends_unacknowledged_mutations_oldest_first() {
    let lazy = fresh_lazy().await;
    mutate(&lazy, "tab-1", json!({"a": 1})).await;
    mutate(&lazy, "tab-1", json!({"b": 2})).await;

    let last_ackd: BTreeMap<ClientId, u64> = [(ClientId::from("tab-1"), 1)].into();
    let pending = collect_pending_mutations(&lazy, &last_ackd).await.unwrap();
    assert_eq!(pending.len(), 1, "mutation 1 already acknowledged");
    assert_eq!(pending[0].id, 2);

    let pusher = RecordingPusher {
        requests: Mutex::new(Vec::new()),
        response: None,
    };
    let push_desc = PushDescription {
        profile_id: "p1".into(),
        client_group_id: "g1".into(),
        schema_version: "1".into(),
    };
    let (outcome, info) = push(&lazy, &pusher, &push_desc, &BTreeMap::new(), "rid-9")
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Success);
    assert_eq!(info.http_status_code, 200);

    let requests = pusher.requests.lock().unwrap();
    let ids: Vec<u64> = requests[0].mutations.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2], "oldest first");
    assert_eq!(requests[0].push_version, 1);
}

#[tokio::test]
async fn push_with_nothing_pending_sends_no_request() {
    let lazy = fresh_lazy().await;
    let pusher = RecordingPusher {
        requests: Mutex::new(Vec::new()),
        response: None,
    };
    let push_desc = PushDescription {
        profile_id: "p1".into(),
        client_group_id: "g1".into(),
        schema_version: "1".into(),
    };
    let (outcome, _) = push(&lazy, &pusher, &push_desc, &BTreeMap::new(), "rid-0")
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::NothingToPush);
    assert!(pusher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_mutator_still_advances_accounting() {
    let lazy = fresh_lazy().await;

    // A local commit whose mutator is not registered anymore.
    let mut wt = WriteTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    wt.put("seed", json!(1)).await.unwrap();
    let original = wt
        .commit_local(
            head::MAIN,
            LocalCommitArgs {
                client_id: ClientId::from("tab-1"),
                mutation_id: 1,
                mutator_name: "vanished".into(),
                mutator_args: json!({}),
                original_hash: None,
                timestamp: 1,
            },
        )
        .await
        .unwrap();

    let response = PullResponseOk {
        cookie: json!("c1"),
        last_mutation_id_changes: BTreeMap::new(),
        patch: vec![],
    };
    let HandlePullResponse::Applied { sync_head } =
        handle_pull_response(&lazy, &Value::Null, &response)
            .await
            .unwrap()
    else {
        unreachable!();
    };

    let turn = maybe_end_pull(&lazy, sync_head).await.unwrap();
    assert_eq!(turn.replay_mutations.len(), 1);
    let replayed = replay_mutation(
        &lazy,
        &MutatorRegistry::new(),
        head::SYNC,
        &turn.replay_mutations[0],
    )
    .await
    .unwrap();
    let end = finish_pull(&lazy, replayed).await;
    assert!(end.replay_mutations.is_empty());

    let dag = lazy.read().await.unwrap();
    let main_head = dag.must_get_head(head::MAIN).unwrap();
    let commit = read_commit(&dag, main_head).await.unwrap();
    let meta = commit.as_local().unwrap();
    assert_eq!(main_head, replayed);
    assert_eq!(meta.mutation_id, 1, "replay reuses the original ID");
    assert_eq!(meta.original_hash, Some(original));
    // Tombstone semantics: the unknown mutator left no state change.
    let rt = ReadTx::open(&lazy, Whence::Head(head::MAIN.to_owned()))
        .await
        .unwrap();
    assert_eq!(rt.get("seed").await.unwrap(), None);
}
