// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Snapshot-isolated in-memory store.
//!
//! The backing map is an `Arc<BTreeMap>` swapped wholesale on commit. A read
//! transaction clones the `Arc` at open time and is thereafter immune to
//! writers; a write transaction buffers mutations and publishes them with a
//! copy-on-write swap (`Arc::make_mut` mutates in place when no snapshot is
//! outstanding).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{ReadTransaction, Store, StoreError, StoreResult, WriteTransaction};

type Snapshot = Arc<BTreeMap<String, Bytes>>;

#[derive(Debug)]
struct State {
    map: Snapshot,
    closed: bool,
}

/// In-memory [`Store`] with snapshot reads and serialized writes.
#[derive(Debug, Clone)]
pub struct MemStore {
    state: Arc<RwLock<State>>,
    write_lock: Arc<Mutex<()>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                map: Arc::new(BTreeMap::new()),
                closed: false,
            })),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn snapshot(&self) -> StoreResult<Snapshot> {
        let state = self.state.read().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(Arc::clone(&state.map))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn read(&self) -> StoreResult<Box<dyn ReadTransaction>> {
        Ok(Box::new(MemRead {
            snapshot: self.snapshot().await?,
        }))
    }

    async fn write(&self) -> StoreResult<Box<dyn WriteTransaction>> {
        let guard = Arc::clone(&self.write_lock).lock_owned().await;
        // Snapshot after acquiring the lock so the transaction sees the
        // latest committed state.
        let snapshot = self.snapshot().await?;
        Ok(Box::new(MemWrite {
            snapshot,
            pending: BTreeMap::new(),
            state: Arc::clone(&self.state),
            _guard: guard,
        }))
    }

    async fn close(&self) {
        self.state.write().await.closed = true;
    }

    fn is_closed(&self) -> bool {
        // `try_read` only fails while a writer holds the lock, and writers
        // never outlive an await point with the lock held.
        self.state.try_read().map(|s| s.closed).unwrap_or(false)
    }
}

struct MemRead {
    snapshot: Snapshot,
}

#[async_trait]
impl ReadTransaction for MemRead {
    async fn has(&self, key: &str) -> StoreResult<bool> {
        Ok(self.snapshot.contains_key(key))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.snapshot.get(key).cloned())
    }
}

struct MemWrite {
    snapshot: Snapshot,
    /// Buffered mutations; `None` marks a deletion.
    pending: BTreeMap<String, Option<Bytes>>,
    state: Arc<RwLock<State>>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl ReadTransaction for MemWrite {
    async fn has(&self, key: &str) -> StoreResult<bool> {
        match self.pending.get(key) {
            Some(slot) => Ok(slot.is_some()),
            None => Ok(self.snapshot.contains_key(key)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        match self.pending.get(key) {
            Some(slot) => Ok(slot.clone()),
            None => Ok(self.snapshot.get(key).cloned()),
        }
    }
}

#[async_trait]
impl WriteTransaction for MemWrite {
    async fn put(&mut self, key: &str, value: Bytes) -> StoreResult<()> {
        self.pending.insert(key.to_owned(), Some(value));
        Ok(())
    }

    async fn del(&mut self, key: &str) -> StoreResult<()> {
        self.pending.insert(key.to_owned(), None);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.state.write().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let map = Arc::make_mut(&mut state.map);
        for (key, slot) in pending {
            match slot {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
