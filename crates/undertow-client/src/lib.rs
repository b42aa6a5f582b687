// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client facade and lifecycle for the undertow sync engine.
//!
//! [`Replica`] ties the layers together for one "tab": a lazy working dag
//! over a shared persistent store, registered mutators, subscriptions, and
//! the background machinery — heartbeat, persist, refresh, client and
//! client-group GC, cross-database GC, and mutation recovery — that keeps a
//! multi-tab deployment coherent.
//!
//! Process-wide services (the named-store provider, the cross-tab
//! [`Channels`], the database registry) are constructor-injected through
//! [`ReplicaOptions`]; tests wire several replicas to one provider to play
//! multiple tabs.
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

mod channels;
mod clients;
mod collect_dbs;
mod connection;
mod dbs;
mod deleted;
mod gc;
mod groups;
mod options;
mod persist;
mod recovery;
mod replica;

pub use channels::Channels;
pub use clients::{expired_clients, read_clients, read_clients_w, write_clients, Client, ClientMap};
pub use collect_dbs::collect_databases;
pub use dbs::{DbRecord, DbRegistry, FORMAT_VERSION};
pub use deleted::{
    read_deleted_clients, read_deleted_clients_w, write_deleted_clients, DeletedClients,
};
pub use gc::{collect_client_groups, collect_clients};
pub use groups::{
    find_matching_group, read_client_groups, read_client_groups_w, write_client_groups,
    ClientGroup, ClientGroupMap,
};
pub use options::{
    system_now, HostCallbacks, KvStore, NowFn, ReplicaOptions, RequestOptions,
    UpdateNeededReason,
};
pub use recovery::recover_mutations;
pub use replica::{QueryBody, QueryTx, Replica};

use undertow_dag::DagError;
use undertow_kv::StoreError;
use undertow_sync::{ClientId, SyncError};

/// Errors surfaced by the client facade.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// Underlying sync-layer failure.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Underlying dag failure.
    #[error(transparent)]
    Dag(#[from] DagError),
    /// Underlying kv failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Operation on a closed replica.
    #[error("[REPLICA_CLOSED] operation on closed instance")]
    Closed,
    /// The options fail validation.
    #[error("[REPLICA_BAD_OPTIONS] {0}")]
    BadOptions(String),
    /// This client's persistent state is gone (GC'd here or on the server).
    #[error("[REPLICA_CLIENT_STATE_NOT_FOUND] state of client {0} not found")]
    ClientStateNotFound(ClientId),
    /// A mutate call named an unregistered mutator.
    #[error("[REPLICA_UNKNOWN_MUTATOR] no mutator named {0:?}")]
    UnknownMutator(String),
    /// A persistent record failed to decode.
    #[error("[REPLICA_BAD_RECORD] {0}")]
    BadRecord(String),
    /// A user mutator failed; nothing was committed.
    #[error("[REPLICA_MUTATOR_FAILED] mutator {name:?} failed: {source}")]
    MutatorFailed {
        /// Name of the failing mutator.
        name: String,
        /// The mutator's error.
        #[source]
        source: anyhow::Error,
    },
    /// A poke's base cookie no longer matches local state; the host should
    /// disconnect and re-register its poke stream.
    #[error("[REPLICA_POKE_STALE] poke base cookie does not match local state")]
    PokeOutOfDate,
}

/// Convenience alias for replica results.
pub type ReplicaResult<T> = Result<T, ReplicaError>;
