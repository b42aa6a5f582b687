// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Key-value substrate for the undertow sync engine.
//!
//! `undertow-kv` defines the transactional [`Store`] trait that every higher
//! layer (dag, commit log, client registry) is written against, plus the two
//! in-process realizations:
//!
//! - [`MemStore`] — a snapshot-isolated in-memory store.
//! - [`StoreRegistry`] — a process-wide map of named [`MemStore`]s, standing
//!   in for the browser origin's IndexedDB: several engine instances ("tabs")
//!   that open the same name share one store and therefore one write queue.
//!
//! # Transaction Model
//!
//! `read()` hands out a snapshot: the transaction observes the store exactly
//! as it was at open time, concurrent with any writer. `write()` hands out an
//! exclusive transaction — writes are serialized **per store name** by an
//! async mutex, so a second writer suspends until the first commits or drops.
//! Dropping a write transaction without calling [`WriteTransaction::commit`]
//! discards its buffered mutations.
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

mod mem;
mod registry;

pub use mem::MemStore;
pub use registry::StoreRegistry;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors surfaced by the kv layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store was closed before or during the operation.
    #[error("[KV_CLOSED] operation on closed store")]
    Closed,
    /// The named store does not exist in the registry.
    #[error("[KV_NO_SUCH_STORE] no store named {0:?}")]
    NoSuchStore(String),
}

/// Convenience alias for kv results.
pub type StoreResult<T> = Result<T, StoreError>;

/// A transactional key-to-bytes map.
///
/// The trait is object-safe so higher layers can hold `Arc<dyn Store>` and be
/// indifferent to the realization behind it.
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a snapshot read transaction.
    async fn read(&self) -> StoreResult<Box<dyn ReadTransaction>>;

    /// Opens an exclusive write transaction.
    ///
    /// Suspends until any in-flight write transaction on the same store
    /// commits or is dropped.
    async fn write(&self) -> StoreResult<Box<dyn WriteTransaction>>;

    /// Closes the store. Subsequent transactions fail with
    /// [`StoreError::Closed`]; snapshots already handed out stay readable.
    async fn close(&self);

    /// Returns `true` once [`close`](Store::close) has run.
    fn is_closed(&self) -> bool;
}

/// Snapshot read access to a store.
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Returns `true` when `key` is present in the snapshot.
    async fn has(&self, key: &str) -> StoreResult<bool>;

    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;
}

/// Exclusive write access to a store.
///
/// A write transaction sees its own pending mutations through the
/// [`ReadTransaction`] methods. Nothing is visible to other transactions
/// until [`commit`](WriteTransaction::commit).
#[async_trait]
pub trait WriteTransaction: ReadTransaction {
    /// Buffers a put of `value` under `key`.
    async fn put(&mut self, key: &str, value: Bytes) -> StoreResult<()>;

    /// Buffers a deletion of `key`. Deleting an absent key is a no-op.
    async fn del(&mut self, key: &str) -> StoreResult<()>;

    /// Atomically publishes all buffered mutations and releases the write
    /// lock.
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Factory for named stores.
///
/// This is the seam the client options plug into: the in-process
/// [`StoreRegistry`] implements it, and hosts may supply their own provider
/// for a genuinely persistent backend.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Opens (creating if absent) the store named `name`.
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Store>>;

    /// Drops the store named `name` and all its data.
    async fn drop_store(&self, name: &str) -> StoreResult<()>;

    /// Names of all stores this provider currently knows about.
    async fn store_names(&self) -> StoreResult<Vec<String>>;
}
