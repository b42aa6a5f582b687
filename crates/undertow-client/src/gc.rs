// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Heartbeat and lifecycle GC over the shared persistent dag.

use undertow_dag::DagStore;
use undertow_sync::{ClientGroupId, ClientId};

use crate::clients::{expired_clients, read_clients_w, write_clients};
use crate::deleted::{read_deleted_clients_w, write_deleted_clients};
use crate::groups::{read_client_groups_w, write_client_groups};
use crate::{ReplicaError, ReplicaResult};

/// Stamps this client's heartbeat.
pub(crate) async fn write_heartbeat(
    perdag: &DagStore,
    client_id: &ClientId,
    now_ms: u64,
) -> ReplicaResult<()> {
    let mut wt = perdag.write().await?;
    let mut clients = read_clients_w(&wt).await?;
    let Some(client) = clients.get_mut(client_id) else {
        return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
    };
    client.heartbeat_timestamp_ms = now_ms;
    write_clients(&mut wt, &clients)?;
    wt.commit().await?;
    Ok(())
}

/// Removes clients whose heartbeat went stale and records them in the
/// tombstone. Returns the collected IDs.
pub async fn collect_clients(
    perdag: &DagStore,
    self_id: &ClientId,
    now_ms: u64,
    max_inactive_ms: u64,
) -> ReplicaResult<Vec<ClientId>> {
    let mut wt = perdag.write().await?;
    let mut clients = read_clients_w(&wt).await?;
    let expired = expired_clients(&clients, self_id, now_ms, max_inactive_ms);
    if expired.is_empty() {
        return Ok(expired);
    }
    for id in &expired {
        clients.remove(id);
    }
    write_clients(&mut wt, &clients)?;

    let mut deleted = read_deleted_clients_w(&wt).await?;
    deleted.merge(&expired, &[]);
    write_deleted_clients(&mut wt, &deleted)?;
    wt.commit().await?;
    tracing::info!(count = expired.len(), "collected inactive clients");
    Ok(expired)
}

/// Removes client groups with no live clients and records them in the
/// tombstone. A group with pending mutations survives while mutation
/// recovery is enabled. Returns the collected IDs.
pub async fn collect_client_groups(
    perdag: &DagStore,
    enable_mutation_recovery: bool,
) -> ReplicaResult<Vec<ClientGroupId>> {
    let mut wt = perdag.write().await?;
    let clients = read_clients_w(&wt).await?;
    let mut groups = read_client_groups_w(&wt).await?;

    let live: std::collections::BTreeSet<&ClientGroupId> =
        clients.values().map(|c| &c.client_group_id).collect();
    let removable: Vec<ClientGroupId> = groups
        .iter()
        .filter(|(id, group)| {
            !live.contains(id) && !(enable_mutation_recovery && group.has_pending_mutations())
        })
        .map(|(id, _)| id.clone())
        .collect();
    if removable.is_empty() {
        return Ok(removable);
    }
    for id in &removable {
        groups.remove(id);
    }
    write_client_groups(&mut wt, &groups)?;

    let mut deleted = read_deleted_clients_w(&wt).await?;
    deleted.merge(&[], &removable);
    write_deleted_clients(&mut wt, &deleted)?;
    wt.commit().await?;
    tracing::info!(count = removable.len(), "collected empty client groups");
    Ok(removable)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clients::{read_clients, Client, ClientMap};
    use crate::deleted::read_deleted_clients;
    use crate::groups::{read_client_groups, ClientGroup, ClientGroupMap};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use undertow_dag::Chunk;
    use undertow_kv::MemStore;

    async fn seeded_dag() -> (DagStore, Chunk) {
        let dag = DagStore::new(Arc::new(MemStore::new()));
        let anchor = Chunk::new(json!("anchor"), &[]);

        let mut clients = ClientMap::new();
        for (id, heartbeat) in [("A", 0u64), ("B", 0u64)] {
            clients.insert(
                ClientId::from(id),
                Client {
                    heartbeat_timestamp_ms: heartbeat,
                    refresh_hashes: vec![anchor.hash()],
                    persist_hash: None,
                    client_group_id: ClientGroupId::from("g1"),
                },
            );
        }
        let mut groups = ClientGroupMap::new();
        groups.insert(
            ClientGroupId::from("g1"),
            ClientGroup {
                head_hash: anchor.hash(),
                mutator_names: ["m".to_owned()].into(),
                indexes: Vec::new(),
                mutation_ids: BTreeMap::new(),
                last_server_ackd_mutation_ids: BTreeMap::new(),
                disabled: false,
            },
        );

        let mut wt = dag.write().await.unwrap();
        wt.put_chunk(anchor.clone());
        write_clients(&mut wt, &clients).unwrap();
        write_client_groups(&mut wt, &groups).unwrap();
        wt.commit().await.unwrap();
        (dag, anchor)
    }

    #[tokio::test]
    async fn heartbeat_updates_only_the_caller() {
        let (dag, _) = seeded_dag().await;
        write_heartbeat(&dag, &ClientId::from("A"), 555).await.unwrap();
        let rt = dag.read().await.unwrap();
        let clients = read_clients(&rt).await.unwrap();
        assert_eq!(clients[&ClientId::from("A")].heartbeat_timestamp_ms, 555);
        assert_eq!(clients[&ClientId::from("B")].heartbeat_timestamp_ms, 0);
    }

    #[tokio::test]
    async fn heartbeat_for_missing_client_is_state_not_found() {
        let (dag, _) = seeded_dag().await;
        let err = write_heartbeat(&dag, &ClientId::from("ghost"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::ClientStateNotFound(_)));
    }

    #[tokio::test]
    async fn stale_client_is_collected_into_tombstone() {
        let (dag, _) = seeded_dag().await;
        let collected = collect_clients(&dag, &ClientId::from("A"), 2000, 1000)
            .await
            .unwrap();
        assert_eq!(collected, vec![ClientId::from("B")]);

        let rt = dag.read().await.unwrap();
        let clients = read_clients(&rt).await.unwrap();
        assert!(clients.contains_key(&ClientId::from("A")));
        assert!(!clients.contains_key(&ClientId::from("B")));
        let deleted = read_deleted_clients(&rt).await.unwrap();
        assert_eq!(deleted.client_ids, vec![ClientId::from("B")]);
    }

    #[tokio::test]
    async fn empty_group_is_collected_unless_pending_under_recovery() {
        let (dag, anchor) = seeded_dag().await;
        // Remove both clients so g1 is empty.
        collect_clients(&dag, &ClientId::from("nobody"), 2000, 1000)
            .await
            .unwrap();

        // Pending + recovery enabled: survives.
        {
            let mut wt = dag.write().await.unwrap();
            let mut groups = read_client_groups_w(&wt).await.unwrap();
            let group = groups.get_mut(&ClientGroupId::from("g1")).unwrap();
            group.mutation_ids.insert(ClientId::from("A"), 2);
            group
                .last_server_ackd_mutation_ids
                .insert(ClientId::from("A"), 1);
            write_client_groups(&mut wt, &groups).unwrap();
            wt.commit().await.unwrap();
        }
        assert!(collect_client_groups(&dag, true).await.unwrap().is_empty());

        // Recovery disabled: collected, tombstoned, and its head released.
        let collected = collect_client_groups(&dag, false).await.unwrap();
        assert_eq!(collected, vec![ClientGroupId::from("g1")]);
        let rt = dag.read().await.unwrap();
        assert!(read_client_groups(&rt).await.unwrap().is_empty());
        assert_eq!(
            read_deleted_clients(&rt).await.unwrap().client_group_ids,
            vec![ClientGroupId::from("g1")]
        );
        assert!(!rt.has_chunk(anchor.hash()).await.unwrap());
    }
}
