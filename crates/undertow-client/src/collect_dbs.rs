// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Cross-database GC.
//!
//! Periodically drops whole sibling databases that no tab has opened in a
//! long time. A database survives when it was opened recently, when it was
//! written by a newer format version, or when mutation recovery is enabled
//! and it still holds unpushed mutations. Everything collected is appended
//! to every surviving database's tombstone so their tabs learn what
//! disappeared.

use std::sync::Arc;

use undertow_dag::DagStore;
use undertow_kv::StoreProvider;
use undertow_sync::{ClientGroupId, ClientId};

use crate::clients::read_clients;
use crate::dbs::{DbRegistry, FORMAT_VERSION};
use crate::deleted::{read_deleted_clients_w, write_deleted_clients};
use crate::groups::read_client_groups;
use crate::ReplicaResult;

/// Drops stale sibling databases. Returns the names dropped.
///
/// `max_inactive_ms` is the per-client horizon; a database must be idle for
/// twice that before it is considered.
pub async fn collect_databases(
    provider: &Arc<dyn StoreProvider>,
    registry: &DbRegistry,
    self_db: &str,
    now_ms: u64,
    max_inactive_ms: u64,
    enable_mutation_recovery: bool,
) -> ReplicaResult<Vec<String>> {
    let all = registry.all().await?;
    let mut dropped = Vec::new();
    let mut dead_clients: Vec<ClientId> = Vec::new();
    let mut dead_groups: Vec<ClientGroupId> = Vec::new();

    for (name, record) in &all {
        if name == self_db {
            continue;
        }
        if record.format_version > FORMAT_VERSION {
            // Written by newer code; not ours to judge.
            continue;
        }
        if now_ms.saturating_sub(record.last_opened_timestamp_ms) <= max_inactive_ms * 2 {
            continue;
        }

        let store = provider.open(name).await?;
        let dag = DagStore::new(store);
        let (clients, groups) = {
            let rt = dag.read().await?;
            (
                read_clients(&rt).await?,
                read_client_groups(&rt).await?,
            )
        };
        if enable_mutation_recovery && groups.values().any(super::ClientGroup::has_pending_mutations)
        {
            tracing::debug!(db = %name, "stale database kept: pending mutations");
            continue;
        }

        dead_clients.extend(clients.keys().cloned());
        dead_groups.extend(groups.keys().cloned());
        provider.drop_store(name).await?;
        registry.remove(name).await?;
        tracing::info!(db = %name, "dropped stale database");
        dropped.push(name.clone());
    }

    if !dropped.is_empty() && (!dead_clients.is_empty() || !dead_groups.is_empty()) {
        for name in all.keys() {
            if dropped.contains(name) {
                continue;
            }
            let store = provider.open(name).await?;
            let dag = DagStore::new(store);
            let mut wt = dag.write().await?;
            let mut deleted = read_deleted_clients_w(&wt).await?;
            deleted.merge(&dead_clients, &dead_groups);
            write_deleted_clients(&mut wt, &deleted)?;
            wt.commit().await?;
        }
    }
    Ok(dropped)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clients::{write_clients, Client, ClientMap};
    use crate::deleted::read_deleted_clients;
    use crate::groups::{write_client_groups, ClientGroup, ClientGroupMap};
    use serde_json::json;
    use std::collections::BTreeMap;
    use undertow_dag::Chunk;
    use undertow_kv::StoreRegistry;

    async fn seed_db(
        provider: &Arc<dyn StoreProvider>,
        name: &str,
        pending: bool,
    ) -> ReplicaResult<()> {
        let store = provider.open(name).await?;
        let dag = DagStore::new(store);
        let anchor = Chunk::new(json!({"db": name}), &[]);

        let mut clients = ClientMap::new();
        clients.insert(
            ClientId::from("A"),
            Client {
                heartbeat_timestamp_ms: 0,
                refresh_hashes: vec![anchor.hash()],
                persist_hash: None,
                client_group_id: ClientGroupId::from("gX"),
            },
        );
        let mut groups = ClientGroupMap::new();
        let mut group = ClientGroup {
            head_hash: anchor.hash(),
            mutator_names: ["m".to_owned()].into(),
            indexes: Vec::new(),
            mutation_ids: BTreeMap::new(),
            last_server_ackd_mutation_ids: BTreeMap::new(),
            disabled: false,
        };
        if pending {
            group.mutation_ids.insert(ClientId::from("A"), 2);
            group
                .last_server_ackd_mutation_ids
                .insert(ClientId::from("A"), 1);
        }
        groups.insert(ClientGroupId::from("gX"), group);

        let mut wt = dag.write().await?;
        wt.put_chunk(anchor);
        write_clients(&mut wt, &clients)?;
        write_client_groups(&mut wt, &groups)?;
        wt.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn pending_database_survives_under_recovery() {
        let provider: Arc<dyn StoreProvider> = Arc::new(StoreRegistry::new());
        let registry = DbRegistry::new(Arc::clone(&provider));
        registry.register("self", 5000, "1").await.unwrap();
        registry.register("X", 0, "1").await.unwrap();
        seed_db(&provider, "X", true).await.unwrap();

        let dropped =
            collect_databases(&provider, &registry, "self", 5000, 1000, true)
                .await
                .unwrap();
        assert!(dropped.is_empty(), "pending mutations protect the database");
        assert!(registry.all().await.unwrap().contains_key("X"));
    }

    #[tokio::test]
    async fn pending_database_drops_without_recovery_and_tombstones() {
        let provider: Arc<dyn StoreProvider> = Arc::new(StoreRegistry::new());
        let registry = DbRegistry::new(Arc::clone(&provider));
        registry.register("self", 5000, "1").await.unwrap();
        registry.register("X", 0, "1").await.unwrap();
        seed_db(&provider, "self", false).await.unwrap();
        seed_db(&provider, "X", true).await.unwrap();

        let dropped =
            collect_databases(&provider, &registry, "self", 5000, 1000, false)
                .await
                .unwrap();
        assert_eq!(dropped, vec!["X".to_owned()]);
        assert!(!registry.all().await.unwrap().contains_key("X"));

        // The surviving database's tombstone learned about X's ids.
        let store = provider.open("self").await.unwrap();
        let dag = DagStore::new(store);
        let rt = dag.read().await.unwrap();
        let deleted = read_deleted_clients(&rt).await.unwrap();
        assert_eq!(deleted.client_ids, vec![ClientId::from("A")]);
        assert_eq!(deleted.client_group_ids, vec![ClientGroupId::from("gX")]);
    }

    #[tokio::test]
    async fn recently_opened_database_is_kept() {
        let provider: Arc<dyn StoreProvider> = Arc::new(StoreRegistry::new());
        let registry = DbRegistry::new(Arc::clone(&provider));
        registry.register("self", 5000, "1").await.unwrap();
        registry.register("fresh", 4500, "1").await.unwrap();
        seed_db(&provider, "fresh", false).await.unwrap();

        let dropped =
            collect_databases(&provider, &registry, "self", 5000, 1000, true)
                .await
                .unwrap();
        assert!(dropped.is_empty());
    }
}
