// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mutation recovery.
//!
//! Tabs die with mutations pushed nowhere. This task walks every sibling
//! database, and for each enabled client group with pending mutations spins
//! up a throwaway lazy dag at the group's head, pushes the pending
//! mutations with this client's pusher, then asks the puller what the
//! server has acknowledged. It only ever advances a group's
//! `last_server_ackd_mutation_ids` (never `mutation_ids`), and disables
//! groups the server disowns.

use std::sync::Arc;

use undertow_dag::{head, DagStore, LazyStore};
use undertow_kv::StoreProvider;
use undertow_sync::{
    base_snapshot, push, ClientGroupId, PullError, PullRequest, PullResponse, Puller,
    PushDescription, PushOutcome, Pusher, SyncError,
};

use crate::dbs::{DbRegistry, FORMAT_VERSION};
use crate::groups::{read_client_groups, read_client_groups_w, write_client_groups};
use crate::options::RECOVERY_CACHE_LIMIT_BYTES;
use crate::ReplicaResult;

/// One recovery sweep. Returns how many groups had mutations pushed.
#[allow(clippy::too_many_arguments)]
pub async fn recover_mutations(
    provider: &Arc<dyn StoreProvider>,
    registry: &DbRegistry,
    self_db: &str,
    profile_id: &str,
    pusher: Option<&Arc<dyn Pusher>>,
    puller: Option<&Arc<dyn Puller>>,
    request_id: &str,
) -> ReplicaResult<usize> {
    let Some(pusher) = pusher else {
        return Ok(0);
    };
    let mut recovered = 0usize;

    for (name, record) in registry.all().await? {
        if name == self_db || record.format_version > FORMAT_VERSION {
            continue;
        }
        let store = provider.open(&name).await?;
        let dag = DagStore::new(store);
        let groups = {
            let rt = dag.read().await?;
            read_client_groups(&rt).await?
        };

        for (group_id, group) in groups {
            if group.disabled || !group.has_pending_mutations() {
                continue;
            }
            match recover_group(
                &dag,
                &group_id,
                &group,
                profile_id,
                &record.schema_version,
                pusher.as_ref(),
                puller.map(Arc::as_ref),
                request_id,
            )
            .await
            {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(db = %name, group = %group_id, %err, "mutation recovery failed");
                }
            }
        }
    }
    Ok(recovered)
}

#[allow(clippy::too_many_arguments)]
async fn recover_group(
    perdag: &DagStore,
    group_id: &ClientGroupId,
    group: &crate::groups::ClientGroup,
    profile_id: &str,
    schema_version: &str,
    pusher: &dyn Pusher,
    puller: Option<&dyn Puller>,
    request_id: &str,
) -> ReplicaResult<bool> {
    // Throwaway working dag pointed at the abandoned group's head.
    let scratch = LazyStore::new(perdag.clone(), RECOVERY_CACHE_LIMIT_BYTES);
    {
        let mut wt = scratch.write().await?;
        wt.set_head(head::MAIN, group.head_hash);
        wt.commit().await?;
    }

    let desc = PushDescription {
        profile_id: profile_id.to_owned(),
        client_group_id: group_id.clone(),
        schema_version: schema_version.to_owned(),
    };
    let (outcome, _) = push(
        &scratch,
        pusher,
        &desc,
        &group.last_server_ackd_mutation_ids,
        request_id,
    )
    .await?;
    match outcome {
        PushOutcome::ClientStateNotFound | PushOutcome::VersionNotSupported { .. } => {
            disable_group(perdag, group_id).await?;
            return Ok(false);
        }
        PushOutcome::NoResponse => return Ok(false),
        PushOutcome::NothingToPush | PushOutcome::Success => {}
    }

    // Ask the server what it has confirmed now; only the acknowledgement
    // floor is written back.
    if let Some(puller) = puller {
        let cookie = {
            let rt = scratch.read().await?;
            let (_, base) = base_snapshot(&rt, group.head_hash).await?;
            base.as_snapshot()
                .ok_or_else(|| SyncError::BadCommit("group base is not a snapshot".into()))?
                .cookie
                .clone()
        };
        let request = PullRequest {
            pull_version: 1,
            profile_id: profile_id.to_owned(),
            client_group_id: group_id.clone(),
            cookie,
            schema_version: schema_version.to_owned(),
        };
        match puller.pull(&request, request_id).await {
            Err(PullError(message)) => {
                tracing::debug!(group = %group_id, %message, "recovery pull failed");
            }
            Ok(result) => match result.response {
                Some(PullResponse::Ok(body)) => {
                    let mut wt = perdag.write().await?;
                    let mut groups = read_client_groups_w(&wt).await?;
                    if let Some(stored) = groups.get_mut(group_id) {
                        let mut advanced = false;
                        for (client, lmid) in &body.last_mutation_id_changes {
                            let entry = stored
                                .last_server_ackd_mutation_ids
                                .entry(client.clone())
                                .or_default();
                            if *lmid > *entry {
                                *entry = *lmid;
                                advanced = true;
                            }
                        }
                        if advanced {
                            write_client_groups(&mut wt, &groups)?;
                            wt.commit().await?;
                        }
                    }
                }
                Some(PullResponse::Error(_)) => {
                    disable_group(perdag, group_id).await?;
                    return Ok(false);
                }
                None => {}
            },
        }
    }
    Ok(true)
}

async fn disable_group(perdag: &DagStore, group_id: &ClientGroupId) -> ReplicaResult<()> {
    let mut wt = perdag.write().await?;
    let mut groups = read_client_groups_w(&wt).await?;
    if let Some(group) = groups.get_mut(group_id) {
        if !group.disabled {
            group.disabled = true;
            write_client_groups(&mut wt, &groups)?;
            wt.commit().await?;
            tracing::warn!(group = %group_id, "client group disabled by server response");
        }
    }
    Ok(())
}
