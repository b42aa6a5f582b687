// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Read-through in-memory overlay of a persistent dag.
//!
//! The lazy store is where a client instance actually works: every mutation
//! and every pull lands here first and is bridged to the shared persistent
//! dag later (persist) or from it (refresh). It is composed of three layers:
//!
//! - **staging** — chunks written locally and not yet persisted ("mem-only").
//!   Never evicted; dropped only when a commit makes them unreachable from
//!   every lazy head, or when the persister marks them persisted.
//! - **cache** — an LRU over chunks loaded from the source, bounded by a byte
//!   budget. Eviction is by least-recent use, weighted by chunk size.
//! - **source** — the persistent [`DagStore`]; reads fall through to it and
//!   populate the cache.
//!
//! Heads set here are purely in-memory and never touch the source; the
//! persister moves them across explicitly.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::chunk::Chunk;
use crate::hash::Hash;
use crate::store::DagStore;
use crate::{DagError, DagResult};

#[derive(Default)]
struct LazyState {
    heads: FxHashMap<String, Hash>,
    mem_only: FxHashMap<Hash, Chunk>,
}

struct CacheState {
    lru: LruCache<Hash, Chunk>,
    total_bytes: usize,
    limit_bytes: usize,
}

impl CacheState {
    fn get(&mut self, hash: Hash) -> Option<Chunk> {
        self.lru.get(&hash).cloned()
    }

    fn insert(&mut self, chunk: Chunk) {
        let size = chunk.size_bytes();
        if size > self.limit_bytes {
            // A chunk larger than the whole budget would immediately evict
            // everything else; serve it uncached instead.
            return;
        }
        if let Some(prev) = self.lru.put(chunk.hash(), chunk) {
            self.total_bytes = self.total_bytes.saturating_sub(prev.size_bytes());
        }
        self.total_bytes += size;
        while self.total_bytes > self.limit_bytes {
            match self.lru.pop_lru() {
                Some((_, evicted)) => {
                    self.total_bytes = self.total_bytes.saturating_sub(evicted.size_bytes());
                }
                None => break,
            }
        }
    }
}

/// In-memory working dag over a persistent source.
///
/// Cheap to clone; clones share heads, staging, and cache.
#[derive(Clone)]
pub struct LazyStore {
    source: DagStore,
    state: Arc<RwLock<LazyState>>,
    cache: Arc<Mutex<CacheState>>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl LazyStore {
    /// Creates a lazy overlay of `source` with the given cache byte budget.
    pub fn new(source: DagStore, cache_limit_bytes: usize) -> Self {
        Self {
            source,
            state: Arc::new(RwLock::new(LazyState::default())),
            cache: Arc::new(Mutex::new(CacheState {
                lru: LruCache::unbounded(),
                total_bytes: 0,
                limit_bytes: cache_limit_bytes,
            })),
            write_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// The persistent store this overlay reads through to.
    pub fn source(&self) -> &DagStore {
        &self.source
    }

    /// Opens a read transaction: lazy heads snapshotted at open, chunk reads
    /// falling through staging → cache → source.
    pub async fn read(&self) -> DagResult<LazyRead> {
        let heads = self.state.read().await.heads.clone();
        Ok(LazyRead {
            heads,
            state: Arc::clone(&self.state),
            cache: Arc::clone(&self.cache),
            source: self.source.read().await?,
        })
    }

    /// Opens an exclusive write transaction.
    pub async fn write(&self) -> DagResult<LazyWrite> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        let read = self.read().await?;
        Ok(LazyWrite {
            read,
            pending_chunks: FxHashMap::default(),
            pending_heads: FxHashMap::default(),
            store: self.clone(),
            _guard: guard,
        })
    }

    /// Snapshot of all staged (not yet persisted) chunks.
    pub async fn mem_only_chunks(&self) -> Vec<Chunk> {
        self.state.read().await.mem_only.values().cloned().collect()
    }

    /// Returns `true` when `hash` is staged and not yet persisted.
    pub async fn is_mem_only(&self, hash: Hash) -> bool {
        self.state.read().await.mem_only.contains_key(&hash)
    }

    /// Moves staged chunks into the evictable cache after the persister has
    /// written them to the source.
    pub async fn chunks_persisted(&self, hashes: &[Hash]) {
        let mut state = self.state.write().await;
        let mut cache = lock_cache(&self.cache);
        for hash in hashes {
            if let Some(chunk) = state.mem_only.remove(hash) {
                cache.insert(chunk);
            }
        }
    }

    /// Current cache occupancy in bytes (diagnostics).
    pub fn cache_size_bytes(&self) -> usize {
        lock_cache(&self.cache).total_bytes
    }

    fn sweep(state: &mut LazyState) {
        // Drop staged chunks unreachable from every lazy head. Traversal
        // stays inside the staging set: a persisted chunk can never reference
        // a mem-only one, so paths to live staged chunks never leave staging.
        let mut live: FxHashSet<Hash> = FxHashSet::default();
        let mut stack: Vec<Hash> = state.heads.values().copied().collect();
        while let Some(hash) = stack.pop() {
            if !live.insert(hash) {
                continue;
            }
            if let Some(chunk) = state.mem_only.get(&hash) {
                stack.extend(chunk.refs().iter().copied());
            }
        }
        state.mem_only.retain(|hash, _| live.contains(hash));
    }
}

fn lock_cache(cache: &Mutex<CacheState>) -> std::sync::MutexGuard<'_, CacheState> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Read transaction over a [`LazyStore`].
pub struct LazyRead {
    heads: FxHashMap<String, Hash>,
    state: Arc<RwLock<LazyState>>,
    cache: Arc<Mutex<CacheState>>,
    source: crate::store::DagRead,
}

impl LazyRead {
    /// Returns the chunk under `hash` from staging, cache, or source.
    pub async fn get_chunk(&self, hash: Hash) -> DagResult<Option<Chunk>> {
        if let Some(chunk) = self.state.read().await.mem_only.get(&hash) {
            return Ok(Some(chunk.clone()));
        }
        if let Some(chunk) = lock_cache(&self.cache).get(hash) {
            return Ok(Some(chunk));
        }
        match self.source.get_chunk(hash).await? {
            Some(chunk) => {
                lock_cache(&self.cache).insert(chunk.clone());
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Returns the chunk under `hash` or [`DagError::ChunkNotFound`].
    pub async fn must_get_chunk(&self, hash: Hash) -> DagResult<Chunk> {
        self.get_chunk(hash)
            .await?
            .ok_or(DagError::ChunkNotFound(hash))
    }

    /// Returns the lazy head `name`, if set.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        self.heads.get(name).copied()
    }

    /// Returns the lazy head `name` or [`DagError::HeadNotFound`].
    pub fn must_get_head(&self, name: &str) -> DagResult<Hash> {
        self.get_head(name)
            .ok_or_else(|| DagError::HeadNotFound(name.to_owned()))
    }
}

/// Exclusive write transaction over a [`LazyStore`].
pub struct LazyWrite {
    read: LazyRead,
    pending_chunks: FxHashMap<Hash, Chunk>,
    pending_heads: FxHashMap<String, Option<Hash>>,
    store: LazyStore,
    _guard: OwnedMutexGuard<()>,
}

impl LazyWrite {
    /// Stages a chunk into the mem-only set.
    pub fn put_chunk(&mut self, chunk: Chunk) {
        self.pending_chunks.insert(chunk.hash(), chunk);
    }

    /// Stages a head move (in-memory only; the source is untouched).
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
        self.read.get_chunk(hash).await
    }

    /// Reads a chunk through the staged puts or fails with
    /// [`DagError::ChunkNotFound`].
    pub async fn must_get_chunk(&self, hash: Hash) -> DagResult<Chunk> {
        self.get_chunk(hash)
            .await?
            .ok_or(DagError::ChunkNotFound(hash))
    }

    /// Reads a head through the staged moves.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        match self.pending_heads.get(name) {
            Some(staged) => *staged,
            None => self.read.get_head(name),
        }
    }

    /// Reads a head through the staged moves or fails with
    /// [`DagError::HeadNotFound`].
    pub fn must_get_head(&self, name: &str) -> DagResult<Hash> {
        self.get_head(name)
            .ok_or_else(|| DagError::HeadNotFound(name.to_owned()))
    }

    /// Publishes staged chunks and head moves, then sweeps staging.
    pub async fn commit(self) -> DagResult<()> {
        let mut state = self.store.state.write().await;
        for (hash, chunk) in self.pending_chunks {
            state.mem_only.insert(hash, chunk);
        }
        for (name, staged) in self.pending_heads {
            match staged {
                Some(hash) => {
                    state.heads.insert(name, hash);
                }
                None => {
                    state.heads.remove(&name);
                }
            }
        }
        LazyStore::sweep(&mut state);
        Ok(())
    }
}
