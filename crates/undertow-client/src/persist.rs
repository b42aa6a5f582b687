// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persist and refresh: the two bridges between a tab's working dag and the
//! shared persistent dag.
//!
//! Persist copies everything main reaches that the source is missing, then
//! advances this client's record and its group's head. Refresh pulls the
//! group's newer head back into the working dag, replaying this tab's
//! pending local mutations on top so optimistic state survives what other
//! tabs persisted.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use undertow_dag::{head, Chunk, DagStore, Hash, LazyStore};
use undertow_sync::{
    base_snapshot, commit_diffs, compare_cookies, local_mutations, mutation_id, read_commit,
    replay_mutation, ClientId, DiffsMap, MutatorRegistry,
};

use crate::clients::{read_clients, read_clients_w, write_clients};
use crate::groups::{read_client_groups, read_client_groups_w, write_client_groups};
use crate::{ReplicaError, ReplicaResult};

/// Temporary lazy-dag head a refresh rebases onto before moving main.
const REFRESH_HEAD: &str = "refresh";

/// Persists main into the source dag and advances this client's records.
///
/// Returns the persisted main hash, or `None` when main was already
/// persisted (back-to-back persists are no-ops).
pub(crate) async fn persist(
    client_id: &ClientId,
    memdag: &LazyStore,
    perdag: &DagStore,
) -> ReplicaResult<Option<Hash>> {
    let rt = memdag.read().await?;
    let main_hash = rt.must_get_head(head::MAIN)?;

    // Per-client mutation maxima along the chain, and the server floor the
    // base snapshot proves.
    let mut chain_maxima: BTreeMap<ClientId, u64> = BTreeMap::new();
    for (_, commit) in local_mutations(&rt, main_hash).await? {
        if let Some(meta) = commit.as_local() {
            let entry = chain_maxima.entry(meta.client_id.clone()).or_default();
            *entry = (*entry).max(meta.mutation_id);
        }
    }
    let (_, base) = base_snapshot(&rt, main_hash).await?;
    let base_lmids = base
        .as_snapshot()
        .map(|meta| meta.last_mutation_ids.clone())
        .unwrap_or_default();
    drop(rt);

    // Staged chunks reachable from the captured main. Staging is swept to
    // reachability on every commit, but mutations may land mid-persist, so
    // bound the copy to the captured root.
    let staged: FxHashMap<Hash, Chunk> = memdag
        .mem_only_chunks()
        .await
        .into_iter()
        .map(|chunk| (chunk.hash(), chunk))
        .collect();
    let mut to_copy: Vec<Chunk> = Vec::new();
    let mut stack = vec![main_hash];
    let mut seen: std::collections::BTreeSet<Hash> = std::collections::BTreeSet::new();
    while let Some(hash) = stack.pop() {
        if !seen.insert(hash) {
            continue;
        }
        if let Some(chunk) = staged.get(&hash) {
            stack.extend(chunk.refs().iter().copied());
            to_copy.push(chunk.clone());
        }
    }

    let mut wt = perdag.write().await?;
    let mut clients = read_clients_w(&wt).await?;
    let Some(client) = clients.get_mut(client_id) else {
        return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
    };
    if client.persist_hash == Some(main_hash) {
        return Ok(None);
    }
    let group_id = client.client_group_id.clone();
    client.refresh_hashes = vec![main_hash];
    client.persist_hash = Some(main_hash);

    let mut groups = read_client_groups_w(&wt).await?;
    let Some(group) = groups.get_mut(&group_id) else {
        return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
    };
    if group.disabled {
        return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
    }
    group.head_hash = main_hash;
    for (cid, max_id) in &chain_maxima {
        let entry = group.mutation_ids.entry(cid.clone()).or_default();
        *entry = (*entry).max(*max_id);
    }
    for (cid, lmid) in &base_lmids {
        let entry = group
            .last_server_ackd_mutation_ids
            .entry(cid.clone())
            .or_default();
        *entry = (*entry).max(*lmid);
    }

    for chunk in &to_copy {
        wt.put_chunk(chunk.clone());
    }
    write_clients(&mut wt, &clients)?;
    write_client_groups(&mut wt, &groups)?;
    wt.commit().await?;

    let persisted: Vec<Hash> = to_copy.iter().map(Chunk::hash).collect();
    memdag.chunks_persisted(&persisted).await;
    Ok(Some(main_hash))
}

/// Pulls the group's persisted head into the working dag, rebasing this
/// tab's pending local mutations on top.
///
/// Returns the new main and the diffs against the old main, or `None` when
/// there was nothing newer to pick up.
pub(crate) async fn refresh(
    client_id: &ClientId,
    memdag: &LazyStore,
    perdag: &DagStore,
    mutators: &MutatorRegistry,
) -> ReplicaResult<Option<(Hash, DiffsMap)>> {
    let (group_head, group_disabled) = {
        let rt = perdag.read().await?;
        let clients = read_clients(&rt).await?;
        let Some(client) = clients.get(client_id) else {
            return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
        };
        let groups = read_client_groups(&rt).await?;
        let Some(group) = groups.get(&client.client_group_id) else {
            return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
        };
        (group.head_hash, group.disabled)
    };
    if group_disabled {
        return Ok(None);
    }

    let old_main = {
        let rt = memdag.read().await?;
        rt.must_get_head(head::MAIN)?
    };
    if group_head == old_main {
        return Ok(None);
    }

    // Never step back: if the shared head's snapshot is older than ours,
    // there is nothing to gain.
    {
        let rt = memdag.read().await?;
        let (_, shared_base) = base_snapshot(&rt, group_head).await?;
        let (_, own_base) = base_snapshot(&rt, old_main).await?;
        let (Some(shared), Some(own)) = (shared_base.as_snapshot(), own_base.as_snapshot())
        else {
            return Err(ReplicaError::BadRecord("base is not a snapshot".into()));
        };
        if compare_cookies(&shared.cookie, &own.cookie) == std::cmp::Ordering::Less {
            return Ok(None);
        }
    }

    // Pin the shared head while the rebase runs. Only persisted hashes may
    // be pinned here — the record's refs are dag refs, and the rebased main
    // exists only in this tab's staging until the next persist. The old
    // main's persisted ancestry stays pinned through `persist_hash`.
    pin_refresh_hashes(perdag, client_id, vec![group_head]).await?;

    // Rebase pending local mutations onto the shared head under a scratch
    // head, then swing main.
    {
        let mut wt = memdag.write().await?;
        wt.set_head(REFRESH_HEAD, group_head);
        wt.commit().await?;
    }

    let pending = {
        let rt = memdag.read().await?;
        let mut pending = Vec::new();
        for (hash, commit) in local_mutations(&rt, old_main).await? {
            let Some(meta) = commit.as_local() else {
                continue;
            };
            let covered = mutation_id(&rt, &meta.client_id, group_head).await?;
            if meta.mutation_id > covered {
                pending.push(undertow_sync::ReplayCommit { hash, commit });
            }
        }
        pending.reverse();
        pending
    };
    for original in &pending {
        replay_mutation(memdag, mutators, REFRESH_HEAD, original).await?;
    }

    let (new_main, diffs) = {
        let rt = memdag.read().await?;
        let new_main = rt.must_get_head(REFRESH_HEAD)?;
        let old_commit = read_commit(&rt, old_main).await?;
        let new_commit = read_commit(&rt, new_main).await?;
        (new_main, commit_diffs(&rt, &old_commit, &new_commit).await?)
    };

    {
        let mut wt = memdag.write().await?;
        wt.set_head(head::MAIN, new_main);
        wt.remove_head(REFRESH_HEAD);
        wt.commit().await?;
    }

    Ok(Some((new_main, diffs)))
}

async fn pin_refresh_hashes(
    perdag: &DagStore,
    client_id: &ClientId,
    hashes: Vec<Hash>,
) -> ReplicaResult<()> {
    let mut wt = perdag.write().await?;
    let mut clients = read_clients_w(&wt).await?;
    let Some(client) = clients.get_mut(client_id) else {
        return Err(ReplicaError::ClientStateNotFound(client_id.clone()));
    };
    client.refresh_hashes = hashes;
    write_clients(&mut wt, &clients)?;
    wt.commit().await?;
    Ok(())
}
