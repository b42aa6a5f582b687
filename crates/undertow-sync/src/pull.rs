// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pull: fetch a newer server snapshot and land it without losing pending
//! local mutations.
//!
//! The flow is three phases, each atomic at the dag layer:
//!
//! 1. [`begin_pull`] captures main's base cookie, calls the [`Puller`], and
//!    on a usable response runs [`handle_pull_response`], which validates the
//!    response against the *current* base snapshot and commits a new
//!    snapshot under the `sync` head.
//! 2. The caller replays each pending local mutation onto the sync chain via
//!    [`replay_mutation`].
//! 3. [`maybe_end_pull`] either hands back the pending set to replay or —
//!    once the sync chain covers them — moves `main`, drops `sync`, and
//!    reports the accumulated diffs for subscribers.
//!
//! A pull that loses a race (`CookieMismatch`, `WrongSyncHead`,
//! `OverlappingSyncs`) aborts without side effects; the server response is
//! applied at most once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use undertow_dag::{head, Hash, LazyStore};

use crate::commit::{base_snapshot, local_mutations, mutation_id, read_commit, Commit};
use crate::cookie::{compare_cookies, Cookie};
use crate::ids::{ClientGroupId, ClientId};
use crate::patch::PatchOp;
use crate::subscriptions::{commit_diffs, DiffsMap};
use crate::tx::{MutatorRegistry, SnapshotCommitArgs, Whence, WriteTx};
use crate::{HttpRequestInfo, SyncError, SyncResult, VersionType};

/// Wire request for the pull endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Pull protocol version; currently always 1.
    pub pull_version: u32,
    /// Identifies the browser profile across databases.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The pulling client group.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    /// The base cookie the client is at.
    pub cookie: Cookie,
    /// Application schema version.
    pub schema_version: String,
}

/// Successful pull-response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseOk {
    /// The server ordering token for this snapshot.
    pub cookie: Cookie,
    /// Per-client confirmed-mutation advances since the request cookie.
    #[serde(default, rename = "lastMutationIDChanges")]
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    /// Ordered patch transforming the base snapshot's value map.
    #[serde(default)]
    pub patch: Vec<PatchOp>,
}

/// Error bodies the pull endpoint may return with HTTP 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error")]
pub enum PullErrorResponse {
    /// The server no longer knows this client group.
    ClientStateNotFound,
    /// The server cannot speak this protocol or schema version.
    VersionNotSupported {
        /// Which version surface was rejected.
        #[serde(rename = "versionType")]
        version_type: VersionType,
    },
}

/// A parsed pull response: either a usable body or a distinguished error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponse {
    /// A distinguished error body.
    Error(PullErrorResponse),
    /// A usable response body.
    Ok(PullResponseOk),
}

/// What a [`Puller`] produced: a parsed response when one was available,
/// plus request metadata either way.
#[derive(Debug, Clone, PartialEq)]
pub struct PullerResult {
    /// Parsed response; `None` when the body was unusable (non-200,
    /// non-JSON).
    pub response: Option<PullResponse>,
    /// Request metadata for logging and online-state tracking.
    pub http_request_info: HttpRequestInfo,
}

/// Transport-level pull failure (network unreachable, aborted).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[PULL_TRANSPORT] {0}")]
pub struct PullError(pub String);

/// The pull transport seam. Implementations own HTTP, auth headers, and
/// fetch cancellation; the engine sees typed results only.
#[async_trait]
pub trait Puller: Send + Sync {
    /// Executes one pull request.
    async fn pull(
        &self,
        request: &PullRequest,
        request_id: &str,
    ) -> Result<PullerResult, PullError>;
}

/// Outcome of [`begin_pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginPullResult {
    /// A new snapshot was committed under the sync head.
    Applied {
        /// The new sync head.
        sync_head: Hash,
    },
    /// The response was already covered by the local state.
    NoOp,
    /// Another pull or refresh moved main's base snapshot first.
    CookieMismatch,
    /// No usable response (transport failure or unusable body).
    NoResponse,
    /// The server no longer knows this client group.
    ClientStateNotFound,
    /// The server rejected a protocol or schema version.
    VersionNotSupported {
        /// Which version surface was rejected.
        version_type: VersionType,
    },
}

/// [`BeginPullResult`] plus the request metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginPull {
    /// How the pull ended.
    pub result: BeginPullResult,
    /// Request metadata for the connection loop.
    pub http_info: HttpRequestInfo,
}

/// Outcome of [`handle_pull_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlePullResponse {
    /// A new snapshot was committed under the sync head.
    Applied {
        /// The new sync head.
        sync_head: Hash,
    },
    /// The base snapshot no longer carries the expected cookie.
    CookieMismatch,
    /// The response cookie equals the base cookie; nothing to apply.
    NoOp,
}

/// One pending local commit to replay onto the sync chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayCommit {
    /// The original commit's hash (threaded through as `original_hash`).
    pub hash: Hash,
    /// The original commit.
    pub commit: Commit,
}

/// Outcome of [`maybe_end_pull`].
#[derive(Debug, Clone, PartialEq)]
pub struct MaybeEndPullResult {
    /// The sync head this finalization ran against.
    pub sync_head: Hash,
    /// Main after this turn: unchanged while replays remain, the old sync
    /// head once finalized.
    pub main_head: Hash,
    /// Pending mutations to replay, oldest first; empty once finalized.
    pub replay_mutations: Vec<ReplayCommit>,
    /// Diffs between the old and new main. Only non-empty on the final
    /// turn.
    pub diffs: DiffsMap,
}

/// Arguments identifying the puller's client.
#[derive(Debug, Clone)]
pub struct PullDescription {
    /// Profile identifier sent to the server.
    pub profile_id: String,
    /// The pulling client group.
    pub client_group_id: ClientGroupId,
    /// Application schema version.
    pub schema_version: String,
}

/// Captures main's base cookie, runs the puller, and applies a usable
/// response. See the module docs for the race rules.
pub async fn begin_pull(
    lazy: &LazyStore,
    puller: &dyn Puller,
    desc: &PullDescription,
    request_id: &str,
) -> SyncResult<BeginPull> {
    let base_cookie = {
        let dag = lazy.read().await?;
        let main_head = dag.must_get_head(head::MAIN)?;
        let (_, base) = base_snapshot(&dag, main_head).await?;
        base.as_snapshot()
            .map(|meta| meta.cookie.clone())
            .ok_or_else(|| SyncError::BadCommit("base snapshot is not a snapshot".into()))?
    };

    let request = PullRequest {
        pull_version: 1,
        profile_id: desc.profile_id.clone(),
        client_group_id: desc.client_group_id.clone(),
        cookie: base_cookie.clone(),
        schema_version: desc.schema_version.clone(),
    };

    let puller_result = match puller.pull(&request, request_id).await {
        Ok(result) => result,
        Err(err) => {
            return Ok(BeginPull {
                result: BeginPullResult::NoResponse,
                http_info: HttpRequestInfo {
                    http_status_code: 0,
                    error_message: err.to_string(),
                },
            });
        }
    };

    let http_info = puller_result.http_request_info;
    let result = match puller_result.response {
        None => BeginPullResult::NoResponse,
        Some(PullResponse::Error(PullErrorResponse::ClientStateNotFound)) => {
            BeginPullResult::ClientStateNotFound
        }
        Some(PullResponse::Error(PullErrorResponse::VersionNotSupported { version_type })) => {
            BeginPullResult::VersionNotSupported { version_type }
        }
        Some(PullResponse::Ok(body)) => {
            match handle_pull_response(lazy, &base_cookie, &body).await? {
                HandlePullResponse::Applied { sync_head } => {
                    BeginPullResult::Applied { sync_head }
                }
                HandlePullResponse::CookieMismatch => BeginPullResult::CookieMismatch,
                HandlePullResponse::NoOp => BeginPullResult::NoOp,
            }
        }
    };
    Ok(BeginPull { result, http_info })
}

/// Validates a pull response against the current base snapshot and, when it
/// advances the cookie, commits a new snapshot under the `sync` head.
///
/// This is also the poke entry point: a poke carries the base cookie it was
/// computed against plus a pull response body.
pub async fn handle_pull_response(
    lazy: &LazyStore,
    expected_base_cookie: &Cookie,
    response: &PullResponseOk,
) -> SyncResult<HandlePullResponse> {
    let dag = lazy.write().await?;
    let main_head = dag.must_get_head(head::MAIN)?;
    let (base_hash, base_commit) = base_snapshot(&dag, main_head).await?;
    let base_meta = base_commit
        .as_snapshot()
        .ok_or_else(|| SyncError::BadCommit("base snapshot is not a snapshot".into()))?;

    // Another pull or refresh won the race; this response was computed
    // against a base we no longer have.
    if base_meta.cookie != *expected_base_cookie {
        return Ok(HandlePullResponse::CookieMismatch);
    }

    for (client, new_lmid) in &response.last_mutation_id_changes {
        let current = base_meta.last_mutation_ids.get(client).copied().unwrap_or(0);
        if *new_lmid < current {
            return Err(SyncError::LastMutationIdRegression {
                client: client.clone(),
                received: *new_lmid,
                base: current,
            });
        }
    }

    if compare_cookies(&response.cookie, &base_meta.cookie) == std::cmp::Ordering::Less {
        return Err(SyncError::CookieRegression {
            received: render_cookie(&response.cookie),
            base: render_cookie(&base_meta.cookie),
        });
    }

    if response.cookie == base_meta.cookie {
        if !response.patch.is_empty() || !response.last_mutation_id_changes.is_empty() {
            tracing::error!(
                "pull response carried changes but did not advance the cookie; ignoring"
            );
        }
        return Ok(HandlePullResponse::NoOp);
    }

    let mut merged = base_meta.last_mutation_ids.clone();
    for (client, lmid) in &response.last_mutation_id_changes {
        merged.insert(client.clone(), *lmid);
    }

    let mut wt = WriteTx::from_parts(dag, base_hash, base_commit.clone());
    wt.apply_patch(&response.patch).await?;
    let sync_head = wt
        .commit_snapshot(
            head::SYNC,
            SnapshotCommitArgs {
                basis_hash: Some(base_hash),
                last_mutation_ids: merged,
                cookie: response.cookie.clone(),
            },
        )
        .await?;
    Ok(HandlePullResponse::Applied { sync_head })
}

fn render_cookie(cookie: &Cookie) -> String {
    serde_json::to_string(cookie).unwrap_or_else(|_| "<unrenderable>".to_owned())
}

/// Finalizes a pull: either returns the pending mutations still to replay,
/// or moves `main` to the sync head and reports the diffs.
pub async fn maybe_end_pull(
    lazy: &LazyStore,
    expected_sync_head: Hash,
) -> SyncResult<MaybeEndPullResult> {
    let mut dag = lazy.write().await?;
    let sync_head = dag.must_get_head(head::SYNC)?;
    if sync_head != expected_sync_head {
        return Err(SyncError::WrongSyncHead {
            expected: expected_sync_head,
        });
    }
    let main_head = dag.must_get_head(head::MAIN)?;
    let (main_base_hash, _) = base_snapshot(&dag, main_head).await?;
    let (_, sync_base) = base_snapshot(&dag, sync_head).await?;
    let sync_base_meta = sync_base
        .as_snapshot()
        .ok_or_else(|| SyncError::BadCommit("sync base is not a snapshot".into()))?;
    if sync_base_meta.basis_hash != Some(main_base_hash) {
        return Err(SyncError::OverlappingSyncs);
    }

    // Pending: local commits on main whose mutation ID the sync chain has
    // not yet covered.
    let mut replay = Vec::new();
    let mut covered: BTreeMap<ClientId, u64> = BTreeMap::new();
    for (hash, commit) in local_mutations(&dag, main_head).await? {
        let Some(meta) = commit.as_local() else {
            continue;
        };
        let client = meta.client_id.clone();
        let sync_lmid = match covered.get(&client) {
            Some(v) => *v,
            None => {
                let v = mutation_id(&dag, &client, sync_head).await?;
                covered.insert(client.clone(), v);
                v
            }
        };
        if meta.mutation_id > sync_lmid {
            replay.push(ReplayCommit { hash, commit });
        }
    }
    replay.reverse();

    if !replay.is_empty() {
        return Ok(MaybeEndPullResult {
            sync_head,
            main_head,
            replay_mutations: replay,
            diffs: DiffsMap::new(),
        });
    }

    let main_commit = read_commit(&dag, main_head).await?;
    let sync_commit = read_commit(&dag, sync_head).await?;
    let diffs = commit_diffs(&dag, &main_commit, &sync_commit).await?;
    dag.set_head(head::MAIN, sync_head);
    dag.remove_head(head::SYNC);
    dag.commit().await?;

    Ok(MaybeEndPullResult {
        sync_head,
        main_head: sync_head,
        replay_mutations: Vec::new(),
        diffs,
    })
}

/// Replays one pending local commit onto the chain at `onto_head` (the
/// `sync` head during a pull, the refresh head during a refresh).
///
/// The replay reuses the original's client, mutation ID, mutator name, and
/// arguments, and records the original's hash. An unregistered mutator —
/// or one that fails during replay — still commits an empty-effect write so
/// mutation-ID accounting stays monotone.
pub async fn replay_mutation(
    lazy: &LazyStore,
    mutators: &MutatorRegistry,
    onto_head: &str,
    original: &ReplayCommit,
) -> SyncResult<Hash> {
    let meta = original
        .commit
        .as_local()
        .ok_or_else(|| SyncError::BadCommit("replay of a non-local commit".into()))?;

    let mut wt = WriteTx::open(lazy, Whence::Head(onto_head.to_owned())).await?;
    match mutators.get(&meta.mutator_name) {
        Some(mutator) => {
            if let Err(err) = mutator(&mut wt, meta.mutator_args.clone()).await {
                tracing::error!(
                    mutator = %meta.mutator_name,
                    mutation_id = meta.mutation_id,
                    %err,
                    "mutator failed during replay; committing empty effect"
                );
                // Discard the partial write and restart from the target head
                // so the commit really is empty-effect. The old transaction
                // holds the dag write lock; release it first.
                drop(wt);
                wt = WriteTx::open(lazy, Whence::Head(onto_head.to_owned())).await?;
            }
        }
        None => {
            tracing::warn!(
                mutator = %meta.mutator_name,
                "unknown mutator during replay; committing empty effect"
            );
        }
    }

    wt.commit_local(
        onto_head,
        crate::tx::LocalCommitArgs {
            client_id: meta.client_id.clone(),
            mutation_id: meta.mutation_id,
            mutator_name: meta.mutator_name.clone(),
            mutator_args: meta.mutator_args.clone(),
            original_hash: Some(original.hash),
            timestamp: meta.timestamp,
        },
    )
    .await
}
