// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistent dag store over a kv store.
//!
//! A [`DagWrite`] buffers chunk puts and head moves, then applies everything
//! — including the reference-count GC — inside one kv write transaction, so
//! a dag commit is atomic: either the new heads, the new chunks, and the
//! updated refcounts all land, or none do.
//!
//! # Refcount invariant
//!
//! For every stored chunk `c`:
//! `refcount(c) = |heads pointing at c| + |stored chunks listing c in refs|`,
//! and `refcount(c) > 0` (zero-count chunks are deleted in the same commit
//! that dropped them to zero, cascading through their refs).

use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_kv::{ReadTransaction, Store, WriteTransaction};

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::keys::{chunk_key, head_key, ref_count_key};
use crate::{DagError, DagResult};

/// At-rest encoding of a chunk: payload plus strong refs, CBOR-framed.
#[derive(Serialize, Deserialize)]
struct ChunkRecord {
    data: Value,
    refs: Vec<Hash>,
}

fn encode_chunk(chunk: &Chunk) -> DagResult<Bytes> {
    let record = ChunkRecord {
        data: chunk.data().clone(),
        refs: chunk.refs().to_vec(),
    };
    let mut out = Vec::new();
    ciborium::ser::into_writer(&record, &mut out)
        .map_err(|e| DagError::Corrupt(format!("chunk encode: {e}")))?;
    Ok(Bytes::from(out))
}

fn decode_chunk(hash: Hash, bytes: &Bytes) -> DagResult<Chunk> {
    let record: ChunkRecord = ciborium::de::from_reader(bytes.as_ref())
        .map_err(|e| DagError::Corrupt(format!("chunk {hash} decode: {e}")))?;
    Ok(Chunk::with_hash(hash, Arc::new(record.data), &record.refs))
}

fn encode_count(count: u64) -> DagResult<Bytes> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(&count, &mut out)
        .map_err(|e| DagError::Corrupt(format!("refcount encode: {e}")))?;
    Ok(Bytes::from(out))
}

fn decode_count(hash: Hash, bytes: &Bytes) -> DagResult<u64> {
    ciborium::de::from_reader(bytes.as_ref())
        .map_err(|e| DagError::Corrupt(format!("refcount {hash} decode: {e}")))
}

fn decode_head(name: &str, bytes: &Bytes) -> DagResult<Hash> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| DagError::Corrupt(format!("head {name:?} utf8: {e}")))?;
    Hash::from_hex(s).ok_or_else(|| DagError::Corrupt(format!("head {name:?} hex: {s:?}")))
}

/// A head move observed by a dag commit: `(old, new)` with `None` for
/// absent/removed.
pub type HeadChange = (Option<Hash>, Option<Hash>);

/// Persistent dag over a kv store. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct DagStore {
    kv: Arc<dyn Store>,
}

impl DagStore {
    /// Wraps a kv store.
    pub fn new(kv: Arc<dyn Store>) -> Self {
        Self { kv }
    }

    /// Opens a snapshot read transaction.
    pub async fn read(&self) -> DagResult<DagRead> {
        Ok(DagRead {
            kv: self.kv.read().await?,
        })
    }

    /// Opens an exclusive write transaction.
    pub async fn write(&self) -> DagResult<DagWrite> {
        Ok(DagWrite {
            kv: self.kv.write().await?,
            pending_chunks: FxHashMap::default(),
            pending_heads: FxHashMap::default(),
        })
    }

    /// Closes the underlying kv store.
    pub async fn close(&self) {
        self.kv.close().await;
    }
}

/// Snapshot read access to a dag.
pub struct DagRead {
    kv: Box<dyn ReadTransaction>,
}

impl DagRead {
    /// Returns the chunk stored under `hash`, if any.
    pub async fn get_chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        match self.kv.get(&chunk_key(hash)).await? {
            Some(bytes) => Ok(Some(decode_chunk(hash, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the chunk stored under `hash` or [`DagError::ChunkNotFound`].
    pub async fn must_get_chunk(&self, hash: Hash) -> DagResult<Chunk> {
        self.get_chunk(hash)
            .await?
            .ok_or(DagError::ChunkNotFound(hash))
    }

    /// Returns `true` when a chunk is stored under `hash`.
    pub async fn has_chunk(&self, hash: Hash) -> DagResult<bool> {
        Ok(self.kv.has(&chunk_key(hash)).await?)
    }

    /// Returns the hash the named head points at, if the head exists.
    pub async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        match self.kv.get(&head_key(name)).await? {
            Some(bytes) => Ok(Some(decode_head(name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the named head or [`DagError::HeadNotFound`].
    pub async fn must_get_head(&self, name: &str) -> DagResult<Hash> {
        self.get_head(name)
            .await?
            .ok_or_else(|| DagError::HeadNotFound(name.to_owned()))
    }

    /// Stored refcount of `hash` (0 when absent). Diagnostic surface for the
    /// GC-soundness tests.
    pub async fn ref_count(&self, hash: Hash) -> DagResult<u64> {
        match self.kv.get(&ref_count_key(hash)).await? {
            Some(bytes) => decode_count(hash, &bytes),
            None => Ok(0),
        }
    }
}

/// Exclusive write access to a dag.
pub struct DagWrite {
    kv: Box<dyn WriteTransaction>,
    pending_chunks: FxHashMap<Hash, Chunk>,
    /// Head name → staged target (`None` = remove).
    pending_heads: FxHashMap<String, Option<Hash>>,
}

impl DagWrite {
    /// Stages a chunk. Idempotent by hash.
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.pending_chunks.insert(chunk.hash(), chunk);
    }

    /// Stages a head move.
    pub fn set_head(&mut self, name: &str, hash: Hash) {
        self.pending_heads.insert(name.to_owned(), Some(hash));
    }

    /// Stages a head removal.
    pub fn remove_head(&mut self, name: &str) {
        self.pending_heads.insert(name.to_owned(), None);
    }

    /// Reads a chunk through the staged puts.
    pub async fn get_chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        if let Some(chunk) = self.pending_chunks.get(&hash) {
            return Ok(Some(chunk.clone()));
        }
        match self.kv.get(&chunk_key(hash)).await? {
            Some(bytes) => Ok(Some(decode_chunk(hash, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads a chunk through the staged puts or fails with
    /// [`DagError::ChunkNotFound`].
    pub async fn must_get_chunk(&self, hash: Hash) -> DagResult<Chunk> {
        self.get_chunk(hash)
            .await?
            .ok_or(DagError::ChunkNotFound(hash))
    }

    /// Reads a head through the staged moves.
    pub async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        if let Some(staged) = self.pending_heads.get(name) {
            return Ok(*staged);
        }
        match self.kv.get(&head_key(name)).await? {
            Some(bytes) => Ok(Some(decode_head(name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads a head through the staged moves or fails with
    /// [`DagError::HeadNotFound`].
    pub async fn must_get_head(&self, name: &str) -> DagResult<Hash> {
        self.get_head(name)
            .await?
            .ok_or_else(|| DagError::HeadNotFound(name.to_owned()))
    }

    /// Atomically applies staged puts and head moves, runs the refcount GC,
    /// and commits the kv transaction.
    pub async fn commit(mut self) -> DagResult<()> {
        let head_changes = self.load_head_changes().await?;
        let counts = self.compute_ref_counts(&head_changes).await?;

        // Apply refcount updates, deleting chunks that dropped to zero.
        for (hash, entry) in &counts {
            let new = entry.current();
            if new == entry.old {
                continue;
            }
            if new == 0 {
                self.kv.del(&ref_count_key(*hash)).await?;
                if entry.old > 0 {
                    self.kv.del(&chunk_key(*hash)).await?;
                }
            } else {
                self.kv.put(&ref_count_key(*hash), encode_count(new)?).await?;
            }
        }

        // Write only the staged chunks that ended up referenced; an
        // unreferenced put is garbage in the same commit that staged it.
        let mut skipped = 0usize;
        for (hash, chunk) in &self.pending_chunks {
            let live = counts.get(hash).is_some_and(|entry| entry.current() > 0);
            if live {
                self.kv.put(&chunk_key(*hash), encode_chunk(chunk)?).await?;
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::debug!(skipped, "dropped unreferenced staged chunks at commit");
        }

        for (name, (_, new)) in &head_changes {
            match new {
                Some(hash) => {
                    self.kv
                        .put(&head_key(name), Bytes::from(hash.to_string()))
                        .await?;
                }
                None => self.kv.del(&head_key(name)).await?,
            }
        }

        self.kv.commit().await?;
        Ok(())
    }

    async fn load_head_changes(&self) -> DagResult<Vec<(String, HeadChange)>> {
        let mut changes = Vec::with_capacity(self.pending_heads.len());
        for (name, new) in &self.pending_heads {
            let old = match self.kv.get(&head_key(name)).await? {
                Some(bytes) => Some(decode_head(name, &bytes)?),
                None => None,
            };
            if old != *new {
                changes.push((name.clone(), (old, *new)));
            }
        }
        // Deterministic processing order regardless of hash-map iteration.
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(changes)
    }

    /// Transitive refcount pass.
    ///
    /// Seeds a delta per moved head (`-1` old target, `+1` new target) and
    /// runs a worklist to a fixpoint: a chunk whose count rises from zero
    /// increments each of its refs, one whose count falls to zero decrements
    /// them. Bounces (0→1→0) are fine — each transition is applied
    /// symmetrically, so the net effect is exact.
    async fn compute_ref_counts(
        &self,
        head_changes: &[(String, HeadChange)],
    ) -> DagResult<FxHashMap<Hash, CountEntry>> {
        let mut counts: FxHashMap<Hash, CountEntry> = FxHashMap::default();
        let mut worklist: Vec<(Hash, i64)> = Vec::new();
        for (_, (old, new)) in head_changes {
            if let Some(h) = old {
                worklist.push((*h, -1));
            }
            if let Some(h) = new {
                worklist.push((*h, 1));
            }
        }

        while let Some((hash, delta)) = worklist.pop() {
            let entry = match counts.entry(hash) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let old = match self.kv.get(&ref_count_key(hash)).await? {
                        Some(bytes) => decode_count(hash, &bytes)?,
                        None => 0,
                    };
                    v.insert(CountEntry {
                        old,
                        new: i64::try_from(old).map_err(|_| {
                            DagError::Corrupt(format!("refcount {hash} overflows"))
                        })?,
                    })
                }
            };

            let prev = entry.new;
            entry.new += delta;
            if entry.new < 0 {
                return Err(DagError::Corrupt(format!(
                    "refcount of {hash} went negative"
                )));
            }

            let rose = prev == 0 && entry.new > 0;
            let fell = prev > 0 && entry.new == 0;
            if rose || fell {
                let child_delta = if rose { 1 } else { -1 };
                let refs = self.refs_of(hash).await?;
                for r in refs {
                    worklist.push((r, child_delta));
                }
            }
        }
        Ok(counts)
    }

    async fn refs_of(&self, hash: Hash) -> DagResult<Vec<Hash>> {
        if let Some(chunk) = self.pending_chunks.get(&hash) {
            return Ok(chunk.refs().to_vec());
        }
        match self.kv.get(&chunk_key(hash)).await? {
            Some(bytes) => Ok(decode_chunk(hash, &bytes)?.refs().to_vec()),
            None => Err(DagError::ChunkNotFound(hash)),
        }
    }
}

#[derive(Debug)]
struct CountEntry {
    old: u64,
    new: i64,
}

impl CountEntry {
    fn current(&self) -> u64 {
        u64::try_from(self.new).unwrap_or(0)
    }
}
