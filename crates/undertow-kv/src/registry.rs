// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-wide registry of named stores.
//!
//! One [`StoreRegistry`] plays the role the browser origin plays for
//! IndexedDB: every engine instance ("tab") that opens the same name gets a
//! handle onto the same underlying [`MemStore`], sharing its write queue and
//! its data. Tests spin up several instances over one registry to exercise
//! cross-tab persist/refresh and recovery.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::{MemStore, Store, StoreProvider, StoreResult};

/// Named-store registry. Cheap to clone; clones share the same stores.
#[derive(Debug, Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<Mutex<FxHashMap<String, MemStore>>>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (creating if absent) the store named `name`.
    pub fn open_mem(&self, name: &str) -> MemStore {
        let mut stores = lock(&self.stores);
        stores
            .entry(name.to_owned())
            .or_insert_with(MemStore::new)
            .clone()
    }

    /// Returns `true` when a store named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        lock(&self.stores).contains_key(name)
    }

    /// Removes the store named `name`. Outstanding handles keep working but
    /// are detached: a later `open_mem` of the same name yields a fresh store.
    pub fn remove(&self, name: &str) -> Option<MemStore> {
        lock(&self.stores).remove(name)
    }

    /// Names of all stores, sorted for deterministic iteration.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.stores).keys().cloned().collect();
        names.sort();
        names
    }
}

fn lock(stores: &Mutex<FxHashMap<String, MemStore>>) -> std::sync::MutexGuard<'_, FxHashMap<String, MemStore>> {
    // A poisoned registry lock means a panic mid-insert; the map itself is
    // still structurally sound, so continue with the inner value.
    match stores.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl StoreProvider for StoreRegistry {
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Store>> {
        Ok(Arc::new(self.open_mem(name)))
    }

    async fn drop_store(&self, name: &str) -> StoreResult<()> {
        self.remove(name);
        Ok(())
    }

    async fn store_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.names())
    }
}
