// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client records.
//!
//! The client map lives in one chunk under the `clients` head of the
//! persistent dag. The chunk's refs are every hash a client record pins —
//! `refresh_hashes` keep a tab's commits alive while a refresh is in flight,
//! `persist_hash` marks what the tab last persisted — so the dag GC cannot
//! collect state a living tab still needs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_dag::{head, Chunk, DagRead, DagWrite, Hash};
use undertow_sync::{ClientGroupId, ClientId};

use crate::{ReplicaError, ReplicaResult};

/// One tab-scoped participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Last liveness signal, wall-clock milliseconds.
    pub heartbeat_timestamp_ms: u64,
    /// Commits pinned for an in-flight refresh.
    pub refresh_hashes: Vec<Hash>,
    /// The commit this tab last persisted, if any.
    pub persist_hash: Option<Hash>,
    /// The group this client belongs to.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
}

/// All known clients, keyed by ID.
pub type ClientMap = BTreeMap<ClientId, Client>;

/// Reads the client map; an absent head is an empty map.
pub async fn read_clients(dag: &DagRead) -> ReplicaResult<ClientMap> {
    match dag.get_head(head::CLIENTS).await? {
        None => Ok(ClientMap::new()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Reads the client map through a write transaction's staged state.
pub async fn read_clients_w(dag: &DagWrite) -> ReplicaResult<ClientMap> {
    match dag.get_head(head::CLIENTS).await? {
        None => Ok(ClientMap::new()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Stages the client map chunk and points the `clients` head at it.
pub fn write_clients(dag: &mut DagWrite, clients: &ClientMap) -> ReplicaResult<()> {
    let data = serde_json::to_value(clients)
        .map_err(|e| ReplicaError::BadRecord(format!("client map encode: {e}")))?;
    let mut refs = Vec::new();
    for client in clients.values() {
        refs.extend(client.refresh_hashes.iter().copied());
        refs.extend(client.persist_hash);
    }
    let chunk = Chunk::new(data, &refs);
    let hash = chunk.hash();
    dag.put_chunk(chunk);
    dag.set_head(head::CLIENTS, hash);
    Ok(())
}

fn decode(chunk: &Chunk) -> ReplicaResult<ClientMap> {
    serde_json::from_value::<ClientMap>(Value::clone(chunk.data()))
        .map_err(|e| ReplicaError::BadRecord(format!("client map {}: {e}", chunk.hash())))
}

/// Clients (other than `self_id`) whose heartbeat is older than
/// `max_inactive_ms` at `now_ms`.
pub fn expired_clients(
    clients: &ClientMap,
    self_id: &ClientId,
    now_ms: u64,
    max_inactive_ms: u64,
) -> Vec<ClientId> {
    clients
        .iter()
        .filter(|(id, client)| {
            *id != self_id && now_ms.saturating_sub(client.heartbeat_timestamp_ms) > max_inactive_ms
        })
        .map(|(id, _)| id.clone())
        .collect()
}
