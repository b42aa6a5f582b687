// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replica configuration and host callbacks.

use std::sync::Arc;
use std::time::Duration;

use undertow_kv::StoreProvider;
use undertow_sync::{ClientGroupId, ClientId, IndexDefinition, MutatorRegistry, Puller, Pusher, VersionType};

use crate::channels::Channels;
use crate::{ReplicaError, ReplicaResult};

/// Wall-clock source, milliseconds since the epoch. Injected so lifecycle
/// tests can drive time by hand.
pub type NowFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// The default clock.
pub fn system_now() -> NowFn {
    Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    })
}

/// Liveness and GC timing defaults.
pub mod intervals {
    use std::time::Duration;

    /// How often a client refreshes its heartbeat.
    pub const HEARTBEAT: Duration = Duration::from_secs(60);
    /// How often dead clients are collected.
    pub const CLIENT_GC: Duration = Duration::from_secs(5 * 60);
    /// How often empty client groups are collected.
    pub const CLIENT_GROUP_GC: Duration = Duration::from_secs(5 * 60);
    /// How often stale sibling databases are collected.
    pub const DB_COLLECT: Duration = Duration::from_secs(12 * 60 * 60);
    /// Delay before the first database-collect run.
    pub const DB_COLLECT_INITIAL_DELAY: Duration = Duration::from_secs(5 * 60);
    /// How often mutation recovery scans sibling databases.
    pub const MUTATION_RECOVERY: Duration = Duration::from_secs(5 * 60);
    /// Default interval between scheduled pulls.
    pub const DEFAULT_PULL: Duration = Duration::from_secs(60);
    /// Default debounce before a push fires.
    pub const DEFAULT_PUSH_DELAY: Duration = Duration::from_millis(10);
    /// Default scheduled-persist cadence.
    pub const SCHEDULED_PERSIST: Duration = Duration::from_secs(30);
}

/// Default inactivity horizon before a client is collectable.
pub const DEFAULT_CLIENT_MAX_INACTIVE_MS: u64 = 24 * 60 * 60 * 1000;
/// Working-store lazy-cache budget.
pub const DEFAULT_CACHE_LIMIT_BYTES: usize = 100 * 1024 * 1024;
/// Recovery-scratch lazy-cache budget.
pub const RECOVERY_CACHE_LIMIT_BYTES: usize = 10 * 1024 * 1024;
/// Re-auth attempts before an auth failure is surfaced.
pub const MAX_REAUTH_TRIES: u32 = 8;

/// Retry bounds for pull/push backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOptions {
    /// Smallest retry delay.
    pub min_delay_ms: u64,
    /// Largest retry delay.
    pub max_delay_ms: u64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Which kv realization backs the persistent store.
#[derive(Clone, Default)]
pub enum KvStore {
    /// Private in-memory store (no cross-tab sharing, no persistence).
    #[default]
    Mem,
    /// A named-store provider — the process-wide registry, or a
    /// host-supplied persistent backend. If opening fails, the memory
    /// variant is silently substituted.
    Provider(Arc<dyn StoreProvider>),
}

/// Why the host should reload or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateNeededReason {
    /// Another tab created a newer client group.
    NewClientGroup,
    /// The server rejected a protocol or schema version.
    VersionNotSupported {
        /// Which version surface was rejected.
        version_type: VersionType,
    },
}

/// Host integration points. Every callback is optional; absent callbacks
/// are skipped.
#[derive(Clone, Default)]
pub struct HostCallbacks {
    /// Fired with `true` when a sync begins and `false` when it settles.
    pub on_sync: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    /// Fired on every online⇄offline transition, once per edge.
    pub on_online_change: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    /// Fired when this client's state is gone; hosts usually reload.
    pub on_client_state_not_found: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Fired when the host should update (new group, version rejection).
    pub on_update_needed: Option<Arc<dyn Fn(UpdateNeededReason) + Send + Sync>>,
    /// Supplies fresh credentials after a 401; `None` gives up.
    pub get_auth: Option<Arc<dyn Fn() -> Option<String> + Send + Sync>>,
    /// Reports client and client-group IDs collected by GC.
    pub on_clients_deleted:
        Option<Arc<dyn Fn(&[ClientId], &[ClientGroupId]) + Send + Sync>>,
}

impl std::fmt::Debug for HostCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallbacks").finish_non_exhaustive()
    }
}

/// Configuration for [`crate::Replica::open`].
#[derive(Clone)]
pub struct ReplicaOptions {
    /// Database name; required, non-empty. Tabs sharing a name share state.
    pub name: String,
    /// Pull transport; `None` disables pulling.
    pub puller: Option<Arc<dyn Puller>>,
    /// Push transport; `None` disables pushing.
    pub pusher: Option<Arc<dyn Pusher>>,
    /// Initial auth token, consulted by transports.
    pub auth: String,
    /// Interval between scheduled pulls; `None` disables the timer (manual
    /// pulls still work).
    pub pull_interval: Option<Duration>,
    /// Debounce between a mutation and the push it triggers.
    pub push_delay: Duration,
    /// Retry bounds for transport backoff.
    pub request_options: RequestOptions,
    /// Application schema version, sent on pull and push.
    pub schema_version: String,
    /// Indexes over the value map.
    pub indexes: Vec<IndexDefinition>,
    /// Inactivity horizon before another tab may collect this client.
    pub client_max_inactive_ms: u64,
    /// Persistent-store realization.
    pub kv_store: KvStore,
    /// Registered mutators.
    pub mutators: MutatorRegistry,
    /// Clock.
    pub now: NowFn,
    /// Host callbacks.
    pub callbacks: HostCallbacks,
    /// Cross-tab channel hub; share one across tabs of a process.
    pub channels: Channels,
    /// Recover pending mutations from abandoned client groups.
    pub enable_mutation_recovery: bool,
    /// Run the scheduled persist loop.
    pub enable_scheduled_persist: bool,
    /// Refresh when another tab announces a persist.
    pub enable_scheduled_refresh: bool,
    /// Fork a new client group from the best available snapshot instead of
    /// starting empty.
    pub enable_client_group_forking: bool,
    /// Lazy-cache byte budget for the working dag.
    pub cache_limit_bytes: usize,
}

impl ReplicaOptions {
    /// Options with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            puller: None,
            pusher: None,
            auth: String::new(),
            pull_interval: Some(intervals::DEFAULT_PULL),
            push_delay: intervals::DEFAULT_PUSH_DELAY,
            request_options: RequestOptions::default(),
            schema_version: String::new(),
            indexes: Vec::new(),
            client_max_inactive_ms: DEFAULT_CLIENT_MAX_INACTIVE_MS,
            kv_store: KvStore::Mem,
            mutators: MutatorRegistry::new(),
            now: system_now(),
            callbacks: HostCallbacks::default(),
            channels: Channels::new(),
            enable_mutation_recovery: true,
            enable_scheduled_persist: true,
            enable_scheduled_refresh: true,
            enable_client_group_forking: true,
            cache_limit_bytes: DEFAULT_CACHE_LIMIT_BYTES,
        }
    }

    pub(crate) fn validate(&self) -> ReplicaResult<()> {
        if self.name.is_empty() {
            return Err(ReplicaError::BadOptions("name must be non-empty".into()));
        }
        let floor = intervals::HEARTBEAT.max(intervals::CLIENT_GC);
        let floor_ms = u64::try_from(floor.as_millis()).unwrap_or(u64::MAX);
        if self.client_max_inactive_ms < floor_ms {
            return Err(ReplicaError::BadOptions(format!(
                "client_max_inactive_ms must be at least {floor_ms}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ReplicaOptions::new("app").validate().is_ok());
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(matches!(
            ReplicaOptions::new("").validate(),
            Err(ReplicaError::BadOptions(_))
        ));
    }

    #[test]
    fn too_small_inactivity_horizon_is_rejected() {
        let mut opts = ReplicaOptions::new("app");
        opts.client_max_inactive_ms = 10;
        assert!(matches!(
            opts.validate(),
            Err(ReplicaError::BadOptions(_))
        ));
    }
}
