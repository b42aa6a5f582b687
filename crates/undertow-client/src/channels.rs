// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cross-tab channels.
//!
//! Two broadcast channels per database name, mirroring the browser's
//! BroadcastChannel pair: one announcing new client groups (peers should
//! check whether they need to update) and one announcing persists (peers
//! should schedule a refresh). The hub is a process-wide service handed in
//! through the options; tabs sharing a hub see each other's events.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;

use undertow_sync::{ClientGroupId, ClientId};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
struct Pair {
    new_client: broadcast::Sender<ClientGroupId>,
    persist: broadcast::Sender<ClientId>,
}

/// Hub of per-database cross-tab channels. Cheap to clone; clones share the
/// channels.
#[derive(Clone, Default)]
pub struct Channels {
    inner: Arc<Mutex<FxHashMap<String, Pair>>>,
}

impl Channels {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    fn pair(&self, db: &str) -> Pair {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .entry(db.to_owned())
            .or_insert_with(|| Pair {
                new_client: broadcast::channel(CHANNEL_CAPACITY).0,
                persist: broadcast::channel(CHANNEL_CAPACITY).0,
            })
            .clone()
    }

    /// Announces that a new client group was created in `db`.
    pub fn announce_new_client(&self, db: &str, group: ClientGroupId) {
        // No receivers is fine; the send result only reports that.
        let _ = self.pair(db).new_client.send(group);
    }

    /// Subscribes to new-client-group announcements for `db`.
    pub fn subscribe_new_client(&self, db: &str) -> broadcast::Receiver<ClientGroupId> {
        self.pair(db).new_client.subscribe()
    }

    /// Announces that `client` persisted in `db`.
    pub fn announce_persist(&self, db: &str, client: ClientId) {
        let _ = self.pair(db).persist.send(client);
    }

    /// Subscribes to persist announcements for `db`.
    pub fn subscribe_persist(&self, db: &str) -> broadcast::Receiver<ClientId> {
        self.pair(db).persist.subscribe()
    }
}
