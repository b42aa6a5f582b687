// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The deleted-clients tombstone.
//!
//! A sorted, de-duplicated set of client and client-group IDs collected in
//! this database, kept under the `deleted-clients` head so other databases
//! and the host can learn about collections that happened while they were
//! away.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_dag::{head, Chunk, DagRead, DagWrite};
use undertow_sync::{ClientGroupId, ClientId};

use crate::{ReplicaError, ReplicaResult};

/// Tombstone set of collected IDs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedClients {
    /// Collected client IDs, sorted unique.
    #[serde(rename = "clientIDs")]
    pub client_ids: Vec<ClientId>,
    /// Collected client-group IDs, sorted unique.
    #[serde(rename = "clientGroupIDs")]
    pub client_group_ids: Vec<ClientGroupId>,
}

impl DeletedClients {
    /// Folds more IDs in, keeping both lists sorted and unique.
    pub fn merge(&mut self, clients: &[ClientId], groups: &[ClientGroupId]) {
        self.client_ids.extend_from_slice(clients);
        self.client_ids.sort();
        self.client_ids.dedup();
        self.client_group_ids.extend_from_slice(groups);
        self.client_group_ids.sort();
        self.client_group_ids.dedup();
    }
}

/// Reads the tombstone; an absent head is an empty set.
pub async fn read_deleted_clients(dag: &DagRead) -> ReplicaResult<DeletedClients> {
    match dag.get_head(head::DELETED_CLIENTS).await? {
        None => Ok(DeletedClients::default()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Reads the tombstone through a write transaction's staged state.
pub async fn read_deleted_clients_w(dag: &DagWrite) -> ReplicaResult<DeletedClients> {
    match dag.get_head(head::DELETED_CLIENTS).await? {
        None => Ok(DeletedClients::default()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Stages the tombstone chunk and points the `deleted-clients` head at it.
pub fn write_deleted_clients(
    dag: &mut DagWrite,
    deleted: &DeletedClients,
) -> ReplicaResult<()> {
    let data = serde_json::to_value(deleted)
        .map_err(|e| ReplicaError::BadRecord(format!("tombstone encode: {e}")))?;
    let chunk = Chunk::new(data, &[]);
    let hash = chunk.hash();
    dag.put_chunk(chunk);
    dag.set_head(head::DELETED_CLIENTS, hash);
    Ok(())
}

fn decode(chunk: &Chunk) -> ReplicaResult<DeletedClients> {
    serde_json::from_value::<DeletedClients>(Value::clone(chunk.data()))
        .map_err(|e| ReplicaError::BadRecord(format!("tombstone {}: {e}", chunk.hash())))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use undertow_dag::DagStore;
    use undertow_kv::MemStore;

    #[test]
    fn merge_sorts_and_dedupes() {
        let mut deleted = DeletedClients::default();
        deleted.merge(
            &[ClientId::from("b"), ClientId::from("a")],
            &[ClientGroupId::from("g2")],
        );
        deleted.merge(&[ClientId::from("a")], &[ClientGroupId::from("g1")]);
        assert_eq!(
            deleted.client_ids,
            vec![ClientId::from("a"), ClientId::from("b")]
        );
        assert_eq!(
            deleted.client_group_ids,
            vec![ClientGroupId::from("g1"), ClientGroupId::from("g2")]
        );
    }

    #[tokio::test]
    async fn roundtrip_through_the_dag() {
        let dag = DagStore::new(Arc::new(MemStore::new()));
        let mut deleted = DeletedClients::default();
        deleted.merge(&[ClientId::from("c9")], &[]);

        let mut wt = dag.write().await.unwrap();
        write_deleted_clients(&mut wt, &deleted).unwrap();
        wt.commit().await.unwrap();

        let rt = dag.read().await.unwrap();
        assert_eq!(read_deleted_clients(&rt).await.unwrap(), deleted);
    }
}
