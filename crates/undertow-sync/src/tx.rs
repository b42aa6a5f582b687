// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Read and write transactions over a commit.
//!
//! A transaction pins one commit and exposes the key-value surface of its
//! value B-tree. Writes additionally maintain every index tree configured on
//! the basis commit and finalize into a new commit chunk plus a head move,
//! all inside one dag write transaction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use undertow_btree::{index_keys, BTree, ScanOptions};
use undertow_dag::{Hash, LazyStore, LazyWrite};

use crate::commit::{read_commit, Commit, CommitMeta, IndexDefinition, IndexRecord, LocalMeta, SnapshotMeta};
use crate::cookie::Cookie;
use crate::ids::ClientId;
use crate::patch::PatchOp;
use crate::{SyncError, SyncResult};

/// How a transaction locates its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whence {
    /// The commit a named head points at.
    Head(String),
    /// A specific commit hash.
    Hash(Hash),
}

/// Boxed future a mutator returns; borrows the transaction it runs over.
pub type MutatorFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// A user-supplied mutator: an async function over a write transaction.
pub type MutatorFn =
    Arc<dyn for<'a> Fn(&'a mut WriteTx, Value) -> MutatorFuture<'a> + Send + Sync>;

/// Registered mutators, keyed by name.
pub type MutatorRegistry = std::collections::BTreeMap<String, MutatorFn>;

/// Read-only transaction over one commit.
pub struct ReadTx {
    dag: undertow_dag::LazyRead,
    commit_hash: Hash,
    commit: Commit,
    value: BTree,
}

impl ReadTx {
    /// Opens a read transaction at `whence`.
    pub async fn open(lazy: &LazyStore, whence: Whence) -> SyncResult<Self> {
        let dag = lazy.read().await?;
        let commit_hash = match whence {
            Whence::Head(name) => dag.must_get_head(&name)?,
            Whence::Hash(hash) => hash,
        };
        let commit = read_commit(&dag, commit_hash).await?;
        let value = BTree::at(commit.value_hash);
        Ok(Self {
            dag,
            commit_hash,
            commit,
            value,
        })
    }

    /// The pinned commit's hash.
    pub fn commit_hash(&self) -> Hash {
        self.commit_hash
    }

    /// The pinned commit.
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// Returns the value under `key`.
    pub async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.value.get(&self.dag, key).await?)
    }

    /// Returns `true` when `key` is present.
    pub async fn has(&self, key: &str) -> SyncResult<bool> {
        Ok(self.value.has(&self.dag, key).await?)
    }

    /// Scans the value map.
    pub async fn scan(&self, opts: &ScanOptions) -> SyncResult<Vec<(String, Value)>> {
        Ok(self.value.scan(&self.dag, opts).await?)
    }

    /// Scans an index tree; keys are in the packed `(secondary, primary)`
    /// encoding.
    pub async fn scan_index(
        &self,
        index_name: &str,
        opts: &ScanOptions,
    ) -> SyncResult<Vec<(String, Value)>> {
        let record = self
            .commit
            .indexes
            .iter()
            .find(|idx| idx.definition.name == index_name)
            .ok_or_else(|| {
                SyncError::BadCommit(format!("no index named {index_name:?}"))
            })?;
        let tree = BTree::at(record.value_hash);
        Ok(tree.scan(&self.dag, opts).await?)
    }
}

/// Arguments for finalizing a local-mutation commit.
#[derive(Debug, Clone)]
pub struct LocalCommitArgs {
    /// The mutating client.
    pub client_id: ClientId,
    /// Pre-computed mutation ID (next along the chain, or the original's on
    /// replay).
    pub mutation_id: u64,
    /// Mutator name.
    pub mutator_name: String,
    /// Mutator arguments.
    pub mutator_args: Value,
    /// The original local commit when this is a replay.
    pub original_hash: Option<Hash>,
    /// Client wall-clock milliseconds.
    pub timestamp: u64,
}

/// Arguments for finalizing a snapshot commit.
#[derive(Debug, Clone)]
pub struct SnapshotCommitArgs {
    /// The superseded snapshot (weak hint).
    pub basis_hash: Option<Hash>,
    /// Merged per-client confirmed-mutation lower bounds.
    pub last_mutation_ids: std::collections::BTreeMap<ClientId, u64>,
    /// The server ordering token.
    pub cookie: Cookie,
}

/// Write transaction over one commit.
pub struct WriteTx {
    dag: LazyWrite,
    basis_hash: Hash,
    basis: Commit,
    value: BTree,
    indexes: Vec<(IndexDefinition, BTree)>,
}

impl WriteTx {
    /// Opens a write transaction at `whence`.
    pub async fn open(lazy: &LazyStore, whence: Whence) -> SyncResult<Self> {
        let dag = lazy.write().await?;
        let basis_hash = match whence {
            Whence::Head(name) => dag.must_get_head(&name)?,
            Whence::Hash(hash) => hash,
        };
        let basis = read_commit(&dag, basis_hash).await?;
        Ok(Self::from_parts(dag, basis_hash, basis))
    }

    /// Builds a write transaction over an already-open dag write.
    ///
    /// Used by the pull path, which must resolve its basis and validate
    /// cookies inside the same dag transaction it writes through.
    pub fn from_parts(dag: LazyWrite, basis_hash: Hash, basis: Commit) -> Self {
        let value = BTree::at(basis.value_hash);
        let indexes = basis
            .indexes
            .iter()
            .map(|record| (record.definition.clone(), BTree::at(record.value_hash)))
            .collect();
        Self {
            dag,
            basis_hash,
            basis,
            value,
            indexes,
        }
    }

    /// The basis commit's hash.
    pub fn basis_hash(&self) -> Hash {
        self.basis_hash
    }

    /// The basis commit.
    pub fn basis(&self) -> &Commit {
        &self.basis
    }

    /// The dag write this transaction runs inside.
    pub fn dag(&self) -> &LazyWrite {
        &self.dag
    }

    /// Returns the value under `key`, seeing this transaction's own writes.
    pub async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        Ok(self.value.get(&self.dag, key).await?)
    }

    /// Returns `true` when `key` is present.
    pub async fn has(&self, key: &str) -> SyncResult<bool> {
        Ok(self.value.has(&self.dag, key).await?)
    }

    /// Scans the value map, seeing this transaction's own writes.
    pub async fn scan(&self, opts: &ScanOptions) -> SyncResult<Vec<(String, Value)>> {
        Ok(self.value.scan(&self.dag, opts).await?)
    }

    /// Sets `key` to `value`, maintaining indexes. Index extraction failures
    /// fail the put.
    pub async fn put(&mut self, key: &str, value: Value) -> SyncResult<()> {
        self.put_impl(key, value, false).await
    }

    /// Removes `key`, maintaining indexes. Returns `false` when absent.
    pub async fn del(&mut self, key: &str) -> SyncResult<bool> {
        let old = self.value.get(&self.dag, key).await?;
        let Some(old) = old else {
            return Ok(false);
        };
        self.update_indexes(key, Some(&old), None, true).await?;
        self.value.del(&mut self.dag, key).await?;
        Ok(true)
    }

    /// Removes every key and empties every index.
    pub async fn clear(&mut self) -> SyncResult<()> {
        self.value.clear(&mut self.dag);
        for (_, tree) in &mut self.indexes {
            tree.clear(&mut self.dag);
        }
        Ok(())
    }

    /// Applies a pull patch in order.
    ///
    /// Index extraction failures here are logged and skipped — a server
    /// patch must not wedge the client on one unindexable row.
    pub async fn apply_patch(&mut self, patch: &[PatchOp]) -> SyncResult<()> {
        for op in patch {
            match op {
                PatchOp::Clear => self.clear().await?,
                PatchOp::Put { key, value } => {
                    self.put_impl(key, value.clone(), true).await?;
                }
                PatchOp::Update {
                    key,
                    merge,
                    constrain,
                } => {
                    let merged = self.merge_value(key, merge.as_ref(), constrain.as_deref()).await?;
                    self.put_impl(key, merged, true).await?;
                }
                PatchOp::Del { key } => {
                    self.del(key).await?;
                }
            }
        }
        Ok(())
    }

    async fn merge_value(
        &self,
        key: &str,
        merge: Option<&Map<String, Value>>,
        constrain: Option<&[String]>,
    ) -> SyncResult<Value> {
        let mut base = match self.value.get(&self.dag, key).await? {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(fields) = constrain {
            base.retain(|k, _| fields.iter().any(|f| f == k));
        }
        if let Some(merge) = merge {
            for (k, v) in merge {
                base.insert(k.clone(), v.clone());
            }
        }
        Ok(Value::Object(base))
    }

    async fn put_impl(&mut self, key: &str, value: Value, lenient: bool) -> SyncResult<()> {
        let old = self.value.get(&self.dag, key).await?;
        self.update_indexes(key, old.as_ref(), Some(&value), lenient)
            .await?;
        self.value.put(&mut self.dag, key, value).await?;
        Ok(())
    }

    async fn update_indexes(
        &mut self,
        key: &str,
        old: Option<&Value>,
        new: Option<&Value>,
        lenient: bool,
    ) -> SyncResult<()> {
        for (definition, tree) in &mut self.indexes {
            if !key.starts_with(&definition.key_prefix) {
                continue;
            }
            if let Some(old) = old {
                match index_keys(key, old, &definition.json_pointer, definition.allow_empty) {
                    Ok(keys) => {
                        for index_key in keys {
                            tree.del(&mut self.dag, &index_key).await?;
                        }
                    }
                    Err(err) => {
                        // The old entry never made it into the index; there
                        // is nothing to remove.
                        tracing::debug!(index = %definition.name, %err, "stale index entry skipped");
                    }
                }
            }
            if let Some(new) = new {
                match index_keys(key, new, &definition.json_pointer, definition.allow_empty) {
                    Ok(keys) => {
                        for index_key in keys {
                            tree.put(&mut self.dag, &index_key, new.clone()).await?;
                        }
                    }
                    Err(err) if lenient => {
                        tracing::warn!(index = %definition.name, %err, "entry not indexed");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    fn index_records(&self) -> Vec<IndexRecord> {
        self.indexes
            .iter()
            .map(|(definition, tree)| IndexRecord {
                definition: definition.clone(),
                value_hash: tree.root(),
            })
            .collect()
    }

    /// Finalizes into a local-mutation commit under `head` and commits the
    /// dag transaction. Returns the new commit's hash.
    pub async fn commit_local(mut self, head: &str, args: LocalCommitArgs) -> SyncResult<Hash> {
        let commit = Commit {
            meta: CommitMeta::Local(LocalMeta {
                basis_hash: self.basis_hash,
                base_snapshot_hash: self.basis.base_snapshot_hash(self.basis_hash),
                mutation_id: args.mutation_id,
                mutator_name: args.mutator_name,
                mutator_args: args.mutator_args,
                original_hash: args.original_hash,
                timestamp: args.timestamp,
                client_id: args.client_id,
            }),
            value_hash: self.value.root(),
            indexes: self.index_records(),
        };
        let chunk = commit.chunk()?;
        let hash = chunk.hash();
        self.dag.put_chunk(chunk);
        self.dag.set_head(head, hash);
        self.dag.commit().await?;
        Ok(hash)
    }

    /// Finalizes into a snapshot commit under `head` and commits the dag
    /// transaction. Returns the new commit's hash.
    pub async fn commit_snapshot(mut self, head: &str, args: SnapshotCommitArgs) -> SyncResult<Hash> {
        let commit = Commit {
            meta: CommitMeta::Snapshot(SnapshotMeta {
                basis_hash: args.basis_hash,
                last_mutation_ids: args.last_mutation_ids,
                cookie: args.cookie,
            }),
            value_hash: self.value.root(),
            indexes: self.index_records(),
        };
        let chunk = commit.chunk()?;
        let hash = chunk.hash();
        self.dag.put_chunk(chunk);
        self.dag.set_head(head, hash);
        self.dag.commit().await?;
        Ok(hash)
    }
}
