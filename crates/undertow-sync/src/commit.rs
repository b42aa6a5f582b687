// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit records and chain traversal.
//!
//! A commit is a chunk whose payload is the serialized [`CommitMeta`] plus
//! the value B-tree root and index records. Strong refs keep the value tree,
//! the index trees, and — for local commits — the basis chain alive; a
//! snapshot's `basis_hash` and a replayed commit's `original_hash` are weak
//! lookup hints and deliberately not refs, so superseded history can be
//! collected out from under them.
//!
//! Chain invariants
//! - Following `basis_hash` from any commit reaches exactly one snapshot.
//! - Per client, mutation IDs strictly increase with no gaps along a chain.
//! - A snapshot's `last_mutation_ids` is a lower bound on what the server
//!   has confirmed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_dag::{Chunk, ChunkRead, Hash};

use crate::cookie::Cookie;
use crate::ids::ClientId;
use crate::{SyncError, SyncResult};

/// Configuration of one index over the value map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    /// Index name, unique per client group.
    pub name: String,
    /// Only value keys with this prefix are indexed.
    pub key_prefix: String,
    /// JSON pointer selecting the secondary key inside the value.
    pub json_pointer: String,
    /// Index under the empty secondary when the pointer resolves to nothing.
    #[serde(default)]
    pub allow_empty: bool,
}

/// An index definition together with its current tree root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// The definition this tree was built from.
    pub definition: IndexDefinition,
    /// Root of the index B-tree.
    pub value_hash: Hash,
}

/// Metadata of a server-confirmed snapshot commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// The snapshot this one superseded. A lookup hint, not a ref.
    pub basis_hash: Option<Hash>,
    /// Per-client lower bounds on server-confirmed mutation IDs.
    #[serde(rename = "lastMutationIDs")]
    pub last_mutation_ids: BTreeMap<ClientId, u64>,
    /// The server ordering token this snapshot represents.
    pub cookie: Cookie,
}

/// Metadata of an optimistic local-mutation commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMeta {
    /// The commit this mutation ran against. A strong ref.
    pub basis_hash: Hash,
    /// Cached result of chasing `basis_hash` to a snapshot.
    pub base_snapshot_hash: Hash,
    /// This client's mutation counter value for this mutation.
    pub mutation_id: u64,
    /// Registered mutator that produced the write.
    pub mutator_name: String,
    /// Arguments the mutator ran with (re-used verbatim on replay).
    pub mutator_args: Value,
    /// For replayed commits, the local commit this replays. A hint, not a
    /// ref.
    pub original_hash: Option<Hash>,
    /// Client wall-clock milliseconds when the mutation was created.
    pub timestamp: u64,
    /// The client that created the mutation.
    pub client_id: ClientId,
}

/// The two commit flavors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommitMeta {
    /// Server-confirmed state.
    Snapshot(SnapshotMeta),
    /// Pending optimistic mutation.
    Local(LocalMeta),
}

/// One record of the commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Snapshot or local metadata.
    pub meta: CommitMeta,
    /// Root of the value B-tree at this commit.
    pub value_hash: Hash,
    /// Index trees at this commit.
    pub indexes: Vec<IndexRecord>,
}

impl Commit {
    /// The basis this commit was created against, if any.
    pub fn basis_hash(&self) -> Option<Hash> {
        match &self.meta {
            CommitMeta::Snapshot(meta) => meta.basis_hash,
            CommitMeta::Local(meta) => Some(meta.basis_hash),
        }
    }

    /// Returns `true` for snapshot commits.
    pub fn is_snapshot(&self) -> bool {
        matches!(self.meta, CommitMeta::Snapshot(_))
    }

    /// Snapshot metadata, when this is a snapshot.
    pub fn as_snapshot(&self) -> Option<&SnapshotMeta> {
        match &self.meta {
            CommitMeta::Snapshot(meta) => Some(meta),
            CommitMeta::Local(_) => None,
        }
    }

    /// Local metadata, when this is a local commit.
    pub fn as_local(&self) -> Option<&LocalMeta> {
        match &self.meta {
            CommitMeta::Local(meta) => Some(meta),
            CommitMeta::Snapshot(_) => None,
        }
    }

    /// The hash of this commit's base snapshot, given this commit's own
    /// hash (a snapshot is its own base).
    pub fn base_snapshot_hash(&self, own_hash: Hash) -> Hash {
        match &self.meta {
            CommitMeta::Snapshot(_) => own_hash,
            CommitMeta::Local(meta) => meta.base_snapshot_hash,
        }
    }

    /// Encodes this commit as a chunk.
    ///
    /// Strong refs: the value tree, every index tree, and — for local
    /// commits — the basis. Weak hints stay out of the ref list.
    pub fn chunk(&self) -> SyncResult<Chunk> {
        let data = serde_json::to_value(self)
            .map_err(|e| SyncError::BadCommit(format!("encode: {e}")))?;
        let mut refs = vec![self.value_hash];
        refs.extend(self.indexes.iter().map(|idx| idx.value_hash));
        if let CommitMeta::Local(meta) = &self.meta {
            refs.push(meta.basis_hash);
        }
        Ok(Chunk::new(data, &refs))
    }

    /// Decodes a chunk as a commit.
    pub fn from_chunk(chunk: &Chunk) -> SyncResult<Commit> {
        serde_json::from_value(chunk.data().clone())
            .map_err(|e| SyncError::BadCommit(format!("chunk {}: {e}", chunk.hash())))
    }
}

/// Reads and decodes the commit at `hash`.
pub async fn read_commit(dag: &dyn ChunkRead, hash: Hash) -> SyncResult<Commit> {
    Commit::from_chunk(&dag.must_chunk(hash).await?)
}

/// Stages the genesis snapshot for a fresh client group: empty value map,
/// empty index trees, `null` cookie, no confirmed mutations.
pub fn genesis_commit(
    dag: &mut dyn undertow_dag::ChunkWrite,
    indexes: &[IndexDefinition],
) -> SyncResult<(Hash, Commit)> {
    let value = undertow_btree::BTree::init(dag);
    let commit = Commit {
        meta: CommitMeta::Snapshot(SnapshotMeta {
            basis_hash: None,
            last_mutation_ids: BTreeMap::new(),
            cookie: Value::Null,
        }),
        value_hash: value.root(),
        indexes: indexes
            .iter()
            .map(|definition| IndexRecord {
                definition: definition.clone(),
                value_hash: undertow_btree::BTree::init(dag).root(),
            })
            .collect(),
    };
    let chunk = commit.chunk()?;
    let hash = chunk.hash();
    dag.stage_chunk(chunk);
    Ok((hash, commit))
}

/// Chases basis pointers from `hash` to its base snapshot.
///
/// Local commits carry a cached `base_snapshot_hash`, so this is at most two
/// reads; the cache is verified to actually name a snapshot.
pub async fn base_snapshot(dag: &dyn ChunkRead, hash: Hash) -> SyncResult<(Hash, Commit)> {
    let commit = read_commit(dag, hash).await?;
    let snapshot_hash = commit.base_snapshot_hash(hash);
    if snapshot_hash == hash {
        return Ok((hash, commit));
    }
    let snapshot = read_commit(dag, snapshot_hash).await?;
    if !snapshot.is_snapshot() {
        return Err(SyncError::BadCommit(format!(
            "base snapshot hash {snapshot_hash} does not name a snapshot"
        )));
    }
    Ok((snapshot_hash, snapshot))
}

/// Returns the local-commit suffix above the base snapshot, head first.
pub async fn local_mutations(
    dag: &dyn ChunkRead,
    from: Hash,
) -> SyncResult<Vec<(Hash, Commit)>> {
    let mut out = Vec::new();
    let mut hash = from;
    loop {
        let commit = read_commit(dag, hash).await?;
        match &commit.meta {
            CommitMeta::Snapshot(_) => break,
            CommitMeta::Local(meta) => {
                let basis = meta.basis_hash;
                out.push((hash, commit));
                hash = basis;
            }
        }
    }
    Ok(out)
}

/// The highest mutation ID for `client` reachable from `hash`.
///
/// Walks basis pointers; the first local commit by `client` is the maximum
/// (IDs strictly increase along a chain), and the base snapshot's
/// `last_mutation_ids` bounds everything below it.
pub async fn mutation_id(
    dag: &dyn ChunkRead,
    client: &ClientId,
    hash: Hash,
) -> SyncResult<u64> {
    let mut hash = hash;
    loop {
        let commit = read_commit(dag, hash).await?;
        match &commit.meta {
            CommitMeta::Snapshot(meta) => {
                return Ok(meta.last_mutation_ids.get(client).copied().unwrap_or(0));
            }
            CommitMeta::Local(meta) => {
                if &meta.client_id == client {
                    return Ok(meta.mutation_id);
                }
                hash = meta.basis_hash;
            }
        }
    }
}

/// The ID the next local mutation by `client` must carry when written on
/// `basis`: one past the larger of the chain's view and the server's
/// acknowledged floor.
pub async fn next_mutation_id(
    dag: &dyn ChunkRead,
    client: &ClientId,
    basis: Hash,
    last_ackd: u64,
) -> SyncResult<u64> {
    Ok(mutation_id(dag, client, basis).await?.max(last_ackd) + 1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use undertow_btree::BTree;
    use undertow_dag::{ChunkWrite, DagStore, DagWrite};
    use undertow_kv::MemStore;

    async fn dag() -> DagWrite {
        DagStore::new(Arc::new(MemStore::new()))
            .write()
            .await
            .unwrap()
    }

    fn snapshot(
        basis: Option<Hash>,
        lmids: &[(&str, u64)],
        cookie: Cookie,
        value_hash: Hash,
    ) -> Commit {
        Commit {
            meta: CommitMeta::Snapshot(SnapshotMeta {
                basis_hash: basis,
                last_mutation_ids: lmids
                    .iter()
                    .map(|(c, id)| (ClientId::from(*c), *id))
                    .collect(),
                cookie,
            }),
            value_hash,
            indexes: Vec::new(),
        }
    }

    fn local(
        basis: Hash,
        base_snapshot: Hash,
        client: &str,
        id: u64,
        value_hash: Hash,
    ) -> Commit {
        Commit {
            meta: CommitMeta::Local(LocalMeta {
                basis_hash: basis,
                base_snapshot_hash: base_snapshot,
                mutation_id: id,
                mutator_name: "addData".into(),
                mutator_args: json!({"n": id}),
                original_hash: None,
                timestamp: 0,
                client_id: ClientId::from(client),
            }),
            value_hash,
            indexes: Vec::new(),
        }
    }

    fn stage(dag: &mut DagWrite, commit: &Commit) -> Hash {
        let chunk = commit.chunk().unwrap();
        let hash = chunk.hash();
        dag.stage_chunk(chunk);
        hash
    }

    /// snapshot ← local(a,1) ← local(b,7) ← local(a,2)
    async fn chain(dag: &mut DagWrite) -> (Hash, Hash) {
        let value = BTree::init(dag).root();
        let s = stage(dag, &snapshot(None, &[("a", 0), ("b", 6)], json!("c1"), value));
        let l1 = stage(dag, &local(s, s, "a", 1, value));
        let l2 = stage(dag, &local(l1, s, "b", 7, value));
        let l3 = stage(dag, &local(l2, s, "a", 2, value));
        (s, l3)
    }

    #[tokio::test]
    async fn chunk_roundtrip_and_refs() {
        let mut dag = dag().await;
        let value = BTree::init(&mut dag).root();
        let snap = snapshot(None, &[("a", 3)], json!({"order": 4}), value);
        let chunk = snap.chunk().unwrap();
        assert_eq!(Commit::from_chunk(&chunk).unwrap(), snap);
        // Snapshot basis is weak: only the value tree is a ref.
        assert_eq!(chunk.refs(), &[value]);

        let snap_hash = chunk.hash();
        let loc = local(snap_hash, snap_hash, "a", 4, value);
        let chunk = loc.chunk().unwrap();
        assert_eq!(chunk.refs(), &[value, snap_hash]);
    }

    #[tokio::test]
    async fn base_snapshot_walks_and_verifies() {
        let mut dag = dag().await;
        let (s, head) = chain(&mut dag).await;
        let (found, commit) = base_snapshot(&dag, head).await.unwrap();
        assert_eq!(found, s);
        assert!(commit.is_snapshot());
        // A snapshot is its own base.
        let (found, _) = base_snapshot(&dag, s).await.unwrap();
        assert_eq!(found, s);
    }

    #[tokio::test]
    async fn local_mutations_returns_head_first_suffix() {
        let mut dag = dag().await;
        let (_, head) = chain(&mut dag).await;
        let pending = local_mutations(&dag, head).await.unwrap();
        let ids: Vec<u64> = pending
            .iter()
            .map(|(_, c)| c.as_local().unwrap().mutation_id)
            .collect();
        assert_eq!(ids, vec![2, 7, 1]);
    }

    #[tokio::test]
    async fn mutation_id_prefers_chain_then_snapshot() {
        let mut dag = dag().await;
        let (s, head) = chain(&mut dag).await;
        assert_eq!(mutation_id(&dag, &ClientId::from("a"), head).await.unwrap(), 2);
        assert_eq!(mutation_id(&dag, &ClientId::from("b"), head).await.unwrap(), 7);
        // Unknown client falls through to the snapshot, then to zero.
        assert_eq!(mutation_id(&dag, &ClientId::from("z"), head).await.unwrap(), 0);
        assert_eq!(mutation_id(&dag, &ClientId::from("b"), s).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn next_mutation_id_honors_server_floor() {
        let mut dag = dag().await;
        let (_, head) = chain(&mut dag).await;
        let a = ClientId::from("a");
        assert_eq!(next_mutation_id(&dag, &a, head, 0).await.unwrap(), 3);
        // The server has acknowledged further than the chain shows.
        assert_eq!(next_mutation_id(&dag, &a, head, 9).await.unwrap(), 10);
    }
}
