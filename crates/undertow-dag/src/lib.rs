// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed chunk DAG for the undertow sync engine.
//!
//! The dag is the unit of durability for everything above the kv layer:
//! commits, B-tree nodes, and client records are all [`Chunk`]s — immutable
//! `(hash, data, refs)` triples addressed by a BLAKE3 digest of their
//! canonically-encoded JSON payload. Named heads pin roots; a transitive
//! reference-count sweep at commit time removes everything a head can no
//! longer reach.
//!
//! Two stores are provided:
//!
//! - [`DagStore`] — the persistent store over an [`undertow_kv::Store`].
//!   Write transactions buffer puts and head moves and apply them, plus the
//!   refcount GC, inside a single kv write transaction.
//! - [`LazyStore`] — the in-memory working overlay. Reads fall through a
//!   byte-budgeted LRU cache to a source [`DagStore`]; writes land in a
//!   mem-only staging area and never touch the source. Persist and refresh
//!   (in the client layer) bridge the two.
//!
//! # Hash Domain Policy
//!
//! Chunk hashes are domain-separated content hashes:
//! `BLAKE3("chunk:" || canonical(data))`. Refs do not contribute to the hash;
//! they are derived from the payload by the layer that writes it (a B-tree
//! node's child pointers, a commit's strong edges). Two chunks with the same
//! payload are the same chunk.
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

mod chunk;
mod hash;
mod keys;
mod lazy;
mod store;
mod traits;

pub use chunk::{json_size, Chunk};
pub use hash::{chunk_hash, Hash};
pub use lazy::{LazyRead, LazyStore, LazyWrite};
pub use store::{DagRead, DagStore, DagWrite, HeadChange};
pub use traits::{ChunkRead, ChunkWrite};

use undertow_kv::StoreError;

/// Well-known head names used by the layers above.
pub mod head {
    /// Latest committed state of the working (lazy) dag.
    pub const MAIN: &str = "main";
    /// In-flight pull / replay target.
    pub const SYNC: &str = "sync";
    /// Root of the client map in the persistent dag.
    pub const CLIENTS: &str = "clients";
    /// Root of the client-group map in the persistent dag.
    pub const CLIENT_GROUPS: &str = "client-groups";
    /// Tombstone set of collected client and client-group ids.
    pub const DELETED_CLIENTS: &str = "deleted-clients";
}

/// Errors surfaced by the dag layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// A chunk required by the caller is not in the store.
    ///
    /// The client layer probes for a collected client before surfacing this
    /// kind; see the sync engine's failure semantics.
    #[error("[DAG_CHUNK_MISSING] chunk {0} not found")]
    ChunkNotFound(Hash),
    /// A required named head is absent.
    #[error("[DAG_HEAD_MISSING] head {0:?} not found")]
    HeadNotFound(String),
    /// Stored bytes failed to decode as a chunk, refcount, or head.
    #[error("[DAG_CORRUPT] {0}")]
    Corrupt(String),
    /// The underlying kv store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias for dag results.
pub type DagResult<T> = Result<T, DagError>;
