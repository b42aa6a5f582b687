// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Client-group records.
//!
//! A group is the unit the server tracks: clients that share mutators and
//! indexes, and therefore one commit history. The group map lives under the
//! `client-groups` head; its chunk refs are the group heads, which is what
//! keeps a group's commit chain alive in the persistent dag after every
//! member tab has closed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_dag::{head, Chunk, DagRead, DagWrite, Hash};
use undertow_sync::{ClientGroupId, ClientId, IndexDefinition};

use crate::{ReplicaError, ReplicaResult};

/// One client group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    /// Latest persisted commit of this group's history.
    pub head_hash: Hash,
    /// Mutator names the group was opened with.
    pub mutator_names: BTreeSet<String>,
    /// Index definitions the group was opened with.
    pub indexes: Vec<IndexDefinition>,
    /// Highest mutation ID ever persisted per client.
    #[serde(rename = "mutationIDs")]
    pub mutation_ids: BTreeMap<ClientId, u64>,
    /// Highest mutation ID the server has acknowledged per client.
    #[serde(rename = "lastServerAckdMutationIDs")]
    pub last_server_ackd_mutation_ids: BTreeMap<ClientId, u64>,
    /// Set when the server reported the group unusable; disables sync and
    /// recovery for it.
    pub disabled: bool,
}

impl ClientGroup {
    /// A group is pending when some client has persisted mutations the
    /// server has not acknowledged.
    pub fn has_pending_mutations(&self) -> bool {
        self.mutation_ids.iter().any(|(client, id)| {
            *id > self
                .last_server_ackd_mutation_ids
                .get(client)
                .copied()
                .unwrap_or(0)
        })
    }
}

/// All known groups, keyed by ID.
pub type ClientGroupMap = BTreeMap<ClientGroupId, ClientGroup>;

/// Reads the group map; an absent head is an empty map.
pub async fn read_client_groups(dag: &DagRead) -> ReplicaResult<ClientGroupMap> {
    match dag.get_head(head::CLIENT_GROUPS).await? {
        None => Ok(ClientGroupMap::new()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Reads the group map through a write transaction's staged state.
pub async fn read_client_groups_w(dag: &DagWrite) -> ReplicaResult<ClientGroupMap> {
    match dag.get_head(head::CLIENT_GROUPS).await? {
        None => Ok(ClientGroupMap::new()),
        Some(hash) => decode(&dag.must_get_chunk(hash).await?),
    }
}

/// Stages the group map chunk and points the `client-groups` head at it.
pub fn write_client_groups(dag: &mut DagWrite, groups: &ClientGroupMap) -> ReplicaResult<()> {
    let data = serde_json::to_value(groups)
        .map_err(|e| ReplicaError::BadRecord(format!("client group map encode: {e}")))?;
    let refs: Vec<Hash> = groups.values().map(|group| group.head_hash).collect();
    let chunk = Chunk::new(data, &refs);
    let hash = chunk.hash();
    dag.put_chunk(chunk);
    dag.set_head(head::CLIENT_GROUPS, hash);
    Ok(())
}

fn decode(chunk: &Chunk) -> ReplicaResult<ClientGroupMap> {
    serde_json::from_value::<ClientGroupMap>(Value::clone(chunk.data()))
        .map_err(|e| ReplicaError::BadRecord(format!("client group map {}: {e}", chunk.hash())))
}

/// Finds a group compatible with the given mutators and indexes: same
/// shapes, not disabled.
pub fn find_matching_group<'a>(
    groups: &'a ClientGroupMap,
    mutator_names: &BTreeSet<String>,
    indexes: &[IndexDefinition],
) -> Option<(&'a ClientGroupId, &'a ClientGroup)> {
    groups.iter().find(|(_, group)| {
        !group.disabled && group.mutator_names == *mutator_names && group.indexes == indexes
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use undertow_dag::DagStore;
    use undertow_kv::MemStore;

    fn group(head_hash: Hash, mutators: &[&str]) -> ClientGroup {
        ClientGroup {
            head_hash,
            mutator_names: mutators.iter().map(|s| (*s).to_owned()).collect(),
            indexes: Vec::new(),
            mutation_ids: BTreeMap::new(),
            last_server_ackd_mutation_ids: BTreeMap::new(),
            disabled: false,
        }
    }

    #[tokio::test]
    async fn roundtrip_pins_group_heads() {
        let dag = DagStore::new(Arc::new(MemStore::new()));
        let commit = Chunk::new(json!("group-head"), &[]);

        let mut groups = ClientGroupMap::new();
        groups.insert(ClientGroupId::from("g1"), group(commit.hash(), &["addData"]));

        let mut wt = dag.write().await.unwrap();
        wt.put_chunk(commit.clone());
        write_client_groups(&mut wt, &groups).unwrap();
        wt.commit().await.unwrap();

        let rt = dag.read().await.unwrap();
        assert_eq!(read_client_groups(&rt).await.unwrap(), groups);
        assert!(rt.has_chunk(commit.hash()).await.unwrap());
    }

    #[test]
    fn pending_iff_some_client_is_ahead_of_ack() {
        let mut g = group(undertow_dag::chunk_hash(&json!(0)), &["m"]);
        assert!(!g.has_pending_mutations());
        g.mutation_ids.insert(ClientId::from("a"), 2);
        g.last_server_ackd_mutation_ids.insert(ClientId::from("a"), 1);
        assert!(g.has_pending_mutations());
        g.last_server_ackd_mutation_ids.insert(ClientId::from("a"), 2);
        assert!(!g.has_pending_mutations());
    }

    #[test]
    fn matching_requires_same_shape_and_enabled() {
        let names: BTreeSet<String> = ["m1".to_owned()].into();
        let mut groups = ClientGroupMap::new();
        let mut g = group(undertow_dag::chunk_hash(&json!(0)), &["m1"]);
        groups.insert(ClientGroupId::from("g1"), g.clone());

        assert!(find_matching_group(&groups, &names, &[]).is_some());
        let other: BTreeSet<String> = ["m2".to_owned()].into();
        assert!(find_matching_group(&groups, &other, &[]).is_none());

        g.disabled = true;
        groups.insert(ClientGroupId::from("g1"), g);
        assert!(find_matching_group(&groups, &names, &[]).is_none());
    }
}
