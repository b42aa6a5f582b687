// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit log and sync engine.
//!
//! This crate is the semantics layer between the dag and the client facade:
//!
//! - [`Commit`] records — server-confirmed snapshots and optimistic local
//!   mutations — with chain traversal and per-client mutation-ID accounting.
//! - [`ReadTx`]/[`WriteTx`] — key-value transactions over a commit's value
//!   B-tree, maintaining every configured index on the way through.
//! - Pull — [`begin_pull`], [`handle_pull_response`], [`maybe_end_pull`] —
//!   and the replay ([`replay_mutation`]) that rebases pending local
//!   mutations onto a freshly pulled snapshot.
//! - Push — pending-mutation collection and the [`Pusher`] seam.
//! - Subscription bookkeeping — read-set recording, diff intersection, and
//!   the commit-ordered firing queue.
//!
//! Network transports stay behind the [`Puller`]/[`Pusher`] traits; the
//! engine only ever sees their typed results.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod commit;
mod cookie;
mod ids;
mod patch;
mod pull;
mod push;
mod subscriptions;
mod tx;

pub use commit::{
    base_snapshot, genesis_commit, local_mutations, mutation_id, next_mutation_id, read_commit,
    Commit, CommitMeta, IndexDefinition, IndexRecord, LocalMeta, SnapshotMeta,
};
pub use cookie::{compare_cookies, Cookie};
pub use ids::{ClientGroupId, ClientId};
pub use patch::PatchOp;
pub use pull::{
    begin_pull, handle_pull_response, maybe_end_pull, replay_mutation, BeginPull,
    BeginPullResult, HandlePullResponse, MaybeEndPullResult, PullDescription, PullError,
    PullErrorResponse, PullRequest, PullResponse, PullResponseOk, Puller, PullerResult,
    ReplayCommit,
};
pub use push::{
    collect_pending_mutations, push, Mutation, PushDescription, PushError, PushOutcome,
    PushRequest, PushResponse, Pusher, PusherResult,
};
pub use subscriptions::{
    commit_diffs, DiffsMap, ReadSet, ScanRecord, SubscriptionId, SubscriptionManager,
    WatchCallback, WatchOptions, MAIN_DIFF_KEY,
};
pub use tx::{
    LocalCommitArgs, MutatorFn, MutatorFuture, MutatorRegistry, ReadTx, SnapshotCommitArgs,
    Whence, WriteTx,
};

use undertow_btree::IndexKeyError;
use undertow_dag::DagError;

/// HTTP-ish request metadata reported alongside pull/push results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpRequestInfo {
    /// Status code of the request; 0 when the request never completed.
    pub http_status_code: u16,
    /// Error message, empty on success.
    pub error_message: String,
}

impl HttpRequestInfo {
    /// Info for a request that succeeded with 200.
    pub fn ok() -> Self {
        Self {
            http_status_code: 200,
            error_message: String::new(),
        }
    }
}

/// Which protocol surface a `VersionNotSupported` response refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    /// The pull protocol version.
    Pull,
    /// The push protocol version.
    Push,
    /// The application schema version.
    Schema,
}

/// Errors surfaced by the commit and sync layers.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Underlying dag failure (including missing chunks).
    #[error(transparent)]
    Dag(#[from] DagError),
    /// A chunk failed to decode as a commit.
    #[error("[SYNC_BAD_COMMIT] {0}")]
    BadCommit(String),
    /// The server cookie moved backwards relative to the local base
    /// snapshot.
    #[error(
        "[SYNC_COOKIE_REGRESSION] Received cookie {received} is < last snapshot cookie {base}; \
         ignoring client view"
    )]
    CookieRegression {
        /// The cookie the server sent, JSON-rendered.
        received: String,
        /// The local base snapshot cookie, JSON-rendered.
        base: String,
    },
    /// A per-client last-mutation-ID moved backwards.
    #[error(
        "[SYNC_LMID_REGRESSION] lastMutationID went backwards for client {client}: {received} < {base}"
    )]
    LastMutationIdRegression {
        /// The client whose ID regressed.
        client: ClientId,
        /// The ID the server sent.
        received: u64,
        /// The ID recorded in the base snapshot.
        base: u64,
    },
    /// The sync head moved while a pull was finalizing.
    #[error("[SYNC_WRONG_SYNC_HEAD] sync head changed during pull; expected {expected}")]
    WrongSyncHead {
        /// The sync head the pull created.
        expected: undertow_dag::Hash,
    },
    /// Main's base snapshot no longer matches the sync snapshot's basis.
    #[error("[SYNC_OVERLAPPING] Overlapping syncs")]
    OverlappingSyncs,
    /// Index extraction failed inside a user write.
    #[error(transparent)]
    Index(#[from] IndexKeyError),
    /// A user mutator failed; the enclosing write is discarded.
    #[error("[SYNC_MUTATOR_FAILED] mutator {name:?} failed: {source}")]
    MutatorFailed {
        /// Name of the failing mutator.
        name: String,
        /// The mutator's error.
        #[source]
        source: anyhow::Error,
    },
}

/// Convenience alias for sync results.
pub type SyncResult<T> = Result<T, SyncError>;
