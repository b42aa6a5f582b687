// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Push: deliver pending local mutations to the server.
//!
//! Push never touches local state — acknowledgement arrives indirectly via
//! the next pull's `lastMutationIDChanges`. The only state the caller reacts
//! to is a distinguished error body, which disables the client group.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use undertow_dag::{head, LazyStore};

use crate::commit::local_mutations;
use crate::ids::{ClientGroupId, ClientId};
use crate::{HttpRequestInfo, SyncResult, VersionType};

/// One mutation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// The client that created the mutation.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    /// The client's mutation counter value.
    pub id: u64,
    /// Mutator name.
    pub name: String,
    /// Mutator arguments.
    pub args: Value,
    /// Client wall-clock milliseconds at creation.
    pub timestamp: u64,
}

/// Wire request for the push endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Push protocol version; currently always 1.
    pub push_version: u32,
    /// Identifies the browser profile across databases.
    #[serde(rename = "profileID")]
    pub profile_id: String,
    /// The pushing client group.
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    /// Application schema version.
    pub schema_version: String,
    /// Pending mutations, oldest first.
    pub mutations: Vec<Mutation>,
}

/// Distinguished error bodies a push response may carry (with HTTP 200).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error")]
pub enum PushResponse {
    /// The server no longer knows this client group.
    ClientStateNotFound,
    /// The server cannot speak this protocol or schema version.
    VersionNotSupported {
        /// Which version surface was rejected.
        #[serde(rename = "versionType")]
        version_type: VersionType,
    },
}

/// What a [`Pusher`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PusherResult {
    /// Parsed error body, when the response carried one.
    pub response: Option<PushResponse>,
    /// Request metadata for logging and online-state tracking.
    pub http_request_info: HttpRequestInfo,
}

/// Transport-level push failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[PUSH_TRANSPORT] {0}")]
pub struct PushError(pub String);

/// The push transport seam.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Executes one push request.
    async fn push(
        &self,
        request: &PushRequest,
        request_id: &str,
    ) -> Result<PusherResult, PushError>;
}

/// How a push ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// No pending mutations; no request was sent.
    NothingToPush,
    /// The request completed without a distinguished error body.
    Success,
    /// Transport failure or unusable response.
    NoResponse,
    /// The server no longer knows this client group.
    ClientStateNotFound,
    /// The server rejected a protocol or schema version.
    VersionNotSupported {
        /// Which version surface was rejected.
        version_type: VersionType,
    },
}

/// Arguments identifying the pusher's client group.
#[derive(Debug, Clone)]
pub struct PushDescription {
    /// Profile identifier sent to the server.
    pub profile_id: String,
    /// The pushing client group.
    pub client_group_id: ClientGroupId,
    /// Application schema version.
    pub schema_version: String,
}

/// Collects the local commits on `main` the server has not acknowledged,
/// oldest first, as wire mutations.
pub async fn collect_pending_mutations(
    lazy: &LazyStore,
    last_ackd: &BTreeMap<ClientId, u64>,
) -> SyncResult<Vec<Mutation>> {
    let dag = lazy.read().await?;
    let main_head = dag.must_get_head(head::MAIN)?;
    let mut pending = Vec::new();
    for (_, commit) in local_mutations(&dag, main_head).await? {
        let Some(meta) = commit.as_local() else {
            continue;
        };
        let floor = last_ackd.get(&meta.client_id).copied().unwrap_or(0);
        if meta.mutation_id > floor {
            pending.push(Mutation {
                client_id: meta.client_id.clone(),
                id: meta.mutation_id,
                name: meta.mutator_name.clone(),
                args: meta.mutator_args.clone(),
                timestamp: meta.timestamp,
            });
        }
    }
    pending.reverse();
    Ok(pending)
}

/// Pushes pending mutations, if any.
pub async fn push(
    lazy: &LazyStore,
    pusher: &dyn Pusher,
    desc: &PushDescription,
    last_ackd: &BTreeMap<ClientId, u64>,
    request_id: &str,
) -> SyncResult<(PushOutcome, HttpRequestInfo)> {
    let mutations = collect_pending_mutations(lazy, last_ackd).await?;
    if mutations.is_empty() {
        return Ok((PushOutcome::NothingToPush, HttpRequestInfo::ok()));
    }

    let request = PushRequest {
        push_version: 1,
        profile_id: desc.profile_id.clone(),
        client_group_id: desc.client_group_id.clone(),
        schema_version: desc.schema_version.clone(),
        mutations,
    };

    match pusher.push(&request, request_id).await {
        Err(err) => Ok((
            PushOutcome::NoResponse,
            HttpRequestInfo {
                http_status_code: 0,
                error_message: err.to_string(),
            },
        )),
        Ok(result) => {
            let outcome = match result.response {
                Some(PushResponse::ClientStateNotFound) => PushOutcome::ClientStateNotFound,
                Some(PushResponse::VersionNotSupported { version_type }) => {
                    PushOutcome::VersionNotSupported { version_type }
                }
                None if result.http_request_info.http_status_code == 200 => PushOutcome::Success,
                None => PushOutcome::NoResponse,
            };
            Ok((outcome, result.http_request_info))
        }
    }
}
