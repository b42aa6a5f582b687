// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription bookkeeping and diff delivery.
//!
//! Two flavors of subscriber exist:
//!
//! - **Watches** — a key prefix (optionally scoped to an index) and a
//!   callback that receives raw [`DiffOp`] deltas.
//! - **Queries** — a user body re-run by the engine whenever a commit's
//!   diffs intersect the read set its previous run recorded.
//!
//! The manager only matches and invokes; the engine serializes calls to
//! [`SubscriptionManager::fire_watches`] through one queue so delivery is
//! commit-ordered, fires strictly after the commit that produced the diffs,
//! and fires once per commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use undertow_btree::{diff, encode_index_scan_prefix, BTree, DiffOp, ScanOptions};
use undertow_dag::ChunkRead;

use crate::commit::Commit;
use crate::SyncResult;

/// Diff lists keyed by index name; [`MAIN_DIFF_KEY`] holds the primary map's
/// diff.
pub type DiffsMap = BTreeMap<String, Vec<DiffOp>>;

/// The [`DiffsMap`] key carrying the primary (non-index) diff.
pub const MAIN_DIFF_KEY: &str = "";

/// Identifier of a registered subscription.
pub type SubscriptionId = u64;

/// Watch registration options.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Key prefix to watch. For index-scoped watches this bounds the
    /// secondary key.
    pub prefix: String,
    /// Watch an index tree instead of the primary map.
    pub index_name: Option<String>,
    /// Deliver all currently-matching entries as adds in the first call.
    pub initial_values_in_first_diff: bool,
}

/// Callback receiving a non-empty batch of deltas.
pub type WatchCallback = Arc<dyn Fn(&[DiffOp]) + Send + Sync>;

/// The read set one query-subscription run touched.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    /// Keys read point-wise.
    pub keys: BTreeSet<String>,
    /// Prefix scans performed, with their index scope.
    pub scans: Vec<ScanRecord>,
}

/// One recorded scan.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    /// The scanned key prefix (secondary-key prefix for index scans).
    pub prefix: String,
    /// The scanned index, or `None` for the primary map.
    pub index_name: Option<String>,
}

struct Watcher {
    opts: WatchOptions,
    callback: WatchCallback,
}

#[derive(Default)]
struct QueryState {
    read_set: ReadSet,
}

/// Registry of watches and query read sets.
#[derive(Default)]
pub struct SubscriptionManager {
    next_id: SubscriptionId,
    watchers: BTreeMap<SubscriptionId, Watcher>,
    queries: BTreeMap<SubscriptionId, QueryState>,
}

impl SubscriptionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watch. The caller delivers initial values itself when
    /// [`WatchOptions::initial_values_in_first_diff`] is set.
    pub fn add_watch(&mut self, opts: WatchOptions, callback: WatchCallback) -> SubscriptionId {
        let id = self.bump();
        self.watchers.insert(id, Watcher { opts, callback });
        id
    }

    /// Registers a query subscription; its read set starts empty and is
    /// replaced after every run.
    pub fn add_query(&mut self) -> SubscriptionId {
        let id = self.bump();
        self.queries.insert(id, QueryState::default());
        id
    }

    /// Replaces a query's recorded read set.
    pub fn set_query_read_set(&mut self, id: SubscriptionId, read_set: ReadSet) {
        if let Some(state) = self.queries.get_mut(&id) {
            state.read_set = read_set;
        }
    }

    /// Removes a subscription of either flavor.
    pub fn remove(&mut self, id: SubscriptionId) {
        self.watchers.remove(&id);
        self.queries.remove(&id);
    }

    /// Drops every subscription without firing. Used on close.
    pub fn clear(&mut self) {
        self.watchers.clear();
        self.queries.clear();
    }

    /// Invokes every watch whose keyspace intersects `diffs`.
    pub fn fire_watches(&self, diffs: &DiffsMap) {
        for watcher in self.watchers.values() {
            let entries = match &watcher.opts.index_name {
                None => filter_prefix(diffs.get(MAIN_DIFF_KEY), &watcher.opts.prefix),
                Some(index) => filter_prefix(
                    diffs.get(index),
                    &encode_index_scan_prefix(&watcher.opts.prefix),
                ),
            };
            if !entries.is_empty() {
                (watcher.callback)(&entries);
            }
        }
    }

    /// Queries whose recorded read set intersects `diffs`, in registration
    /// order.
    pub fn affected_queries(&self, diffs: &DiffsMap) -> Vec<SubscriptionId> {
        self.queries
            .iter()
            .filter(|(_, state)| read_set_intersects(&state.read_set, diffs))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live watch subscriptions.
    pub fn watch_count(&self) -> usize {
        self.watchers.len()
    }

    fn bump(&mut self) -> SubscriptionId {
        self.next_id += 1;
        self.next_id
    }
}

fn filter_prefix(ops: Option<&Vec<DiffOp>>, prefix: &str) -> Vec<DiffOp> {
    ops.map(|ops| {
        ops.iter()
            .filter(|op| op.key().starts_with(prefix))
            .cloned()
            .collect()
    })
    .unwrap_or_default()
}

fn read_set_intersects(read_set: &ReadSet, diffs: &DiffsMap) -> bool {
    if let Some(main) = diffs.get(MAIN_DIFF_KEY) {
        for op in main {
            if read_set.keys.contains(op.key()) {
                return true;
            }
            if read_set
                .scans
                .iter()
                .any(|scan| scan.index_name.is_none() && op.key().starts_with(&scan.prefix))
            {
                return true;
            }
        }
    }
    for scan in &read_set.scans {
        let Some(index) = &scan.index_name else {
            continue;
        };
        if let Some(ops) = diffs.get(index) {
            let prefix = encode_index_scan_prefix(&scan.prefix);
            if ops.iter().any(|op| op.key().starts_with(&prefix)) {
                return true;
            }
        }
    }
    false
}

/// Computes the per-keyspace diffs between two commits: the value map under
/// [`MAIN_DIFF_KEY`] and each index under its name.
pub async fn commit_diffs(
    dag: &dyn ChunkRead,
    old: &Commit,
    new: &Commit,
) -> SyncResult<DiffsMap> {
    let mut out = DiffsMap::new();
    let value_diff = diff(dag, old.value_hash, new.value_hash).await?;
    if !value_diff.is_empty() {
        out.insert(MAIN_DIFF_KEY.to_owned(), value_diff);
    }

    let mut names: BTreeSet<&str> = BTreeSet::new();
    names.extend(old.indexes.iter().map(|idx| idx.definition.name.as_str()));
    names.extend(new.indexes.iter().map(|idx| idx.definition.name.as_str()));
    for name in names {
        let old_root = index_root(old, name);
        let new_root = index_root(new, name);
        let ops = match (old_root, new_root) {
            (Some(o), Some(n)) => diff(dag, o, n).await?,
            (None, Some(n)) => {
                let entries = BTree::at(n).scan(dag, &ScanOptions::default()).await?;
                entries
                    .into_iter()
                    .map(|(key, new_value)| DiffOp::Add { key, new_value })
                    .collect()
            }
            (Some(o), None) => {
                let entries = BTree::at(o).scan(dag, &ScanOptions::default()).await?;
                entries
                    .into_iter()
                    .map(|(key, old_value)| DiffOp::Del { key, old_value })
                    .collect()
            }
            (None, None) => Vec::new(),
        };
        if !ops.is_empty() {
            out.insert(name.to_owned(), ops);
        }
    }
    Ok(out)
}

fn index_root(commit: &Commit, name: &str) -> Option<undertow_dag::Hash> {
    commit
        .indexes
        .iter()
        .find(|idx| idx.definition.name == name)
        .map(|idx| idx.value_hash)
}
