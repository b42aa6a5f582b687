// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `Replica` facade.
//!
//! One `Replica` is one tab: a client record in the shared store, a lazy
//! working dag, registered mutators, subscriptions, and the background
//! loops (heartbeat, GC, persist, refresh, recovery, pull, push). All
//! public operations check the closed flag and fail with
//! [`ReplicaError::Closed`] afterwards; close clears subscriptions without
//! firing them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use undertow_btree::{encode_index_scan_prefix, index_keys, BTree, DiffOp, ScanOptions};
use undertow_dag::{head, DagError, DagStore, DagWrite, Hash, LazyStore};
use undertow_kv::{MemStore, Store, StoreProvider, StoreRegistry};
use undertow_sync::{
    base_snapshot, begin_pull, commit_diffs, compare_cookies, genesis_commit,
    handle_pull_response, maybe_end_pull, next_mutation_id, read_commit, replay_mutation,
    BeginPullResult, ClientGroupId, ClientId, Commit, CommitMeta, Cookie, DiffsMap,
    HandlePullResponse, IndexDefinition, IndexRecord, LocalCommitArgs, MutatorRegistry,
    PullDescription, PullResponseOk, Puller, PushDescription, PushOutcome, Pusher, ReadSet,
    ReadTx, ScanRecord, SnapshotMeta, SubscriptionId, SubscriptionManager, SyncError,
    WatchCallback, WatchOptions, Whence, WriteTx,
};

use crate::clients::{read_clients, read_clients_w, write_clients, Client};
use crate::collect_dbs::collect_databases;
use crate::connection::{OnlineTracker, RetryBackoff};
use crate::dbs::{DbRegistry, FORMAT_VERSION};
use crate::gc::{collect_client_groups, collect_clients, write_heartbeat};
use crate::groups::{find_matching_group, read_client_groups_w, write_client_groups, ClientGroup};
use crate::options::{
    intervals, HostCallbacks, KvStore, NowFn, ReplicaOptions, UpdateNeededReason,
    MAX_REAUTH_TRIES,
};
use crate::persist::{persist, refresh};
use crate::recovery::recover_mutations;
use crate::{ReplicaError, ReplicaResult};

/// Read transaction handed to query-subscription bodies; records the read
/// set so later commits can be intersected against it.
pub struct QueryTx<'a> {
    tx: &'a ReadTx,
    read_set: std::sync::Mutex<ReadSet>,
}

impl<'a> QueryTx<'a> {
    fn new(tx: &'a ReadTx) -> Self {
        Self {
            tx,
            read_set: std::sync::Mutex::new(ReadSet::default()),
        }
    }

    fn take_read_set(&self) -> ReadSet {
        std::mem::take(&mut *lock(&self.read_set))
    }

    /// Returns the value under `key`, recording the read.
    pub async fn get(&self, key: &str) -> ReplicaResult<Option<Value>> {
        lock(&self.read_set).keys.insert(key.to_owned());
        Ok(self.tx.get(key).await?)
    }

    /// Returns `true` when `key` is present, recording the read.
    pub async fn has(&self, key: &str) -> ReplicaResult<bool> {
        lock(&self.read_set).keys.insert(key.to_owned());
        Ok(self.tx.has(key).await?)
    }

    /// Scans the value map, recording the scanned prefix.
    pub async fn scan(&self, opts: &ScanOptions) -> ReplicaResult<Vec<(String, Value)>> {
        lock(&self.read_set).scans.push(ScanRecord {
            prefix: opts.prefix.clone(),
            index_name: None,
        });
        Ok(self.tx.scan(opts).await?)
    }

    /// Scans an index by secondary-key prefix, recording the scan.
    pub async fn scan_index(
        &self,
        index_name: &str,
        secondary_prefix: &str,
        limit: Option<usize>,
    ) -> ReplicaResult<Vec<(String, Value)>> {
        lock(&self.read_set).scans.push(ScanRecord {
            prefix: secondary_prefix.to_owned(),
            index_name: Some(index_name.to_owned()),
        });
        let opts = ScanOptions {
            prefix: encode_index_scan_prefix(secondary_prefix),
            start_key: None,
            start_exclusive: false,
            limit,
        };
        Ok(self.tx.scan_index(index_name, &opts).await?)
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A query-subscription body: async over a recording read transaction.
pub type QueryBody = Arc<
    dyn for<'a> Fn(
            &'a QueryTx<'a>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>>
        + Send
        + Sync,
>;

struct QueryEntry {
    body: QueryBody,
    on_data: Arc<dyn Fn(&Value) + Send + Sync>,
    last: Option<Value>,
}

struct Inner {
    db_name: String,
    profile_id: String,
    session_id: String,
    client_id: ClientId,
    client_group_id: ClientGroupId,
    schema_version: String,
    mutators: MutatorRegistry,
    callbacks: HostCallbacks,
    now: NowFn,
    memdag: LazyStore,
    perdag: DagStore,
    kv: Arc<dyn Store>,
    own_store: bool,
    provider: Arc<dyn StoreProvider>,
    registry: DbRegistry,
    channels: crate::Channels,
    puller: Option<Arc<dyn Puller>>,
    pusher: Option<Arc<dyn Pusher>>,
    auth: std::sync::Mutex<String>,
    request_options: crate::RequestOptions,
    enable_mutation_recovery: bool,
    client_max_inactive_ms: u64,
    subscriptions: std::sync::Mutex<SubscriptionManager>,
    queries: AsyncMutex<BTreeMap<SubscriptionId, QueryEntry>>,
    persist_lock: AsyncMutex<()>,
    fire_lock: AsyncMutex<()>,
    online: OnlineTracker,
    closed: AtomicBool,
    /// Set when the server rejects a protocol or schema version; pulls and
    /// pushes stop until the host decides what to do.
    halted: AtomicBool,
    close_tx: watch::Sender<bool>,
    push_tx: mpsc::Sender<()>,
    request_counter: AtomicU64,
}

/// A client handle onto one undertow database.
pub struct Replica {
    inner: Arc<Inner>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 12]>())
}

impl Replica {
    /// Opens (creating if needed) the database `options.name` and registers
    /// this instance as a client in it.
    pub async fn open(options: ReplicaOptions) -> ReplicaResult<Replica> {
        options.validate()?;
        let ReplicaOptions {
            name,
            puller,
            pusher,
            auth,
            pull_interval,
            push_delay,
            request_options,
            schema_version,
            indexes,
            client_max_inactive_ms,
            kv_store,
            mutators,
            now,
            callbacks,
            channels,
            enable_mutation_recovery,
            enable_scheduled_persist,
            enable_scheduled_refresh,
            enable_client_group_forking,
            cache_limit_bytes,
        } = options;

        let (provider, own_store): (Arc<dyn StoreProvider>, bool) = match kv_store {
            KvStore::Mem => (Arc::new(StoreRegistry::new()), true),
            KvStore::Provider(provider) => (provider, false),
        };
        let db_name = format!("{name}-{FORMAT_VERSION}");
        let registry = DbRegistry::new(Arc::clone(&provider));
        registry.register(&db_name, (now)(), &schema_version).await?;
        let profile_id = registry.profile_id().await?;

        let kv: Arc<dyn Store> = match provider.open(&db_name).await {
            Ok(store) => store,
            Err(err) => {
                // No persistent backend; substitute a private in-memory
                // store and keep going.
                tracing::warn!(%err, "store provider failed; using memory store");
                Arc::new(MemStore::new())
            }
        };
        let perdag = DagStore::new(Arc::clone(&kv));
        let client_id = ClientId(random_id());

        // Register this client, reusing or creating its group.
        let (client_group_id, group_head, created_group) = {
            let mut wt = perdag.write().await?;
            let mut clients = read_clients_w(&wt).await?;
            let mut groups = read_client_groups_w(&wt).await?;
            let mutator_names: std::collections::BTreeSet<String> =
                mutators.keys().cloned().collect();

            let (group_id, group_head, created) =
                match find_matching_group(&groups, &mutator_names, &indexes) {
                    Some((id, group)) => (id.clone(), group.head_hash, false),
                    None => {
                        let id = ClientGroupId(random_id());
                        let head_hash = new_group_head(
                            &mut wt,
                            &groups,
                            &indexes,
                            enable_client_group_forking,
                        )
                        .await?;
                        groups.insert(
                            id.clone(),
                            ClientGroup {
                                head_hash,
                                mutator_names,
                                indexes: indexes.clone(),
                                mutation_ids: BTreeMap::new(),
                                last_server_ackd_mutation_ids: BTreeMap::new(),
                                disabled: false,
                            },
                        );
                        (id, head_hash, true)
                    }
                };

            clients.insert(
                client_id.clone(),
                Client {
                    heartbeat_timestamp_ms: (now)(),
                    refresh_hashes: vec![group_head],
                    persist_hash: None,
                    client_group_id: group_id.clone(),
                },
            );
            write_clients(&mut wt, &clients)?;
            write_client_groups(&mut wt, &groups)?;
            wt.commit().await?;
            (group_id, group_head, created)
        };

        // Working dag starts at the group's persisted head.
        let memdag = LazyStore::new(perdag.clone(), cache_limit_bytes);
        {
            let mut wt = memdag.write().await?;
            wt.set_head(head::MAIN, group_head);
            wt.commit().await?;
        }

        let online = OnlineTracker::new(callbacks.on_online_change.clone());
        let (close_tx, _) = watch::channel(false);
        let (push_tx, push_rx) = mpsc::channel(8);
        let inner = Arc::new(Inner {
            db_name: db_name.clone(),
            profile_id,
            session_id: hex::encode(rand::random::<[u8; 4]>()),
            client_id,
            client_group_id: client_group_id.clone(),
            schema_version,
            mutators,
            callbacks,
            now,
            memdag,
            perdag,
            kv,
            own_store,
            provider,
            registry,
            channels,
            puller,
            pusher,
            auth: std::sync::Mutex::new(auth),
            request_options,
            enable_mutation_recovery,
            client_max_inactive_ms,
            subscriptions: std::sync::Mutex::new(SubscriptionManager::new()),
            queries: AsyncMutex::new(BTreeMap::new()),
            persist_lock: AsyncMutex::new(()),
            fire_lock: AsyncMutex::new(()),
            online,
            closed: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            close_tx,
            push_tx,
            request_counter: AtomicU64::new(0),
        });

        if created_group {
            inner.channels.announce_new_client(&db_name, client_group_id);
        }

        let replica = Replica {
            inner: Arc::clone(&inner),
            tasks: std::sync::Mutex::new(Vec::new()),
        };
        replica.spawn_loops(
            pull_interval,
            push_delay,
            push_rx,
            enable_scheduled_persist,
            enable_scheduled_refresh,
        );
        Ok(replica)
    }

    /// This instance's client ID.
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// This instance's client-group ID.
    pub fn client_group_id(&self) -> &ClientGroupId {
        &self.inner.client_group_id
    }

    /// The per-provider profile ID.
    pub fn profile_id(&self) -> &str {
        &self.inner.profile_id
    }

    /// Current connectivity estimate.
    pub fn is_online(&self) -> bool {
        self.inner.online.is_online()
    }

    /// Runs a registered mutator and commits its writes as a local
    /// mutation on main.
    pub async fn mutate(&self, mutator_name: &str, args: Value) -> ReplicaResult<()> {
        self.inner.mutate(mutator_name, args).await
    }

    /// Reads one key from main.
    pub async fn get(&self, key: &str) -> ReplicaResult<Option<Value>> {
        self.inner.check_open()?;
        let tx = self.inner.read_main().await?;
        let got = tx.get(key).await;
        self.inner.upgrade_sync_result(got).await
    }

    /// Returns `true` when `key` is present on main.
    pub async fn has(&self, key: &str) -> ReplicaResult<bool> {
        self.inner.check_open()?;
        let tx = self.inner.read_main().await?;
        let got = tx.has(key).await;
        self.inner.upgrade_sync_result(got).await
    }

    /// Scans main's value map.
    pub async fn scan(&self, opts: &ScanOptions) -> ReplicaResult<Vec<(String, Value)>> {
        self.inner.check_open()?;
        let tx = self.inner.read_main().await?;
        let got = tx.scan(opts).await;
        self.inner.upgrade_sync_result(got).await
    }

    /// Registers a query subscription; `body` runs now and again whenever a
    /// commit touches its recorded read set, invoking `on_data` when the
    /// result changes.
    pub async fn subscribe(
        &self,
        body: QueryBody,
        on_data: Arc<dyn Fn(&Value) + Send + Sync>,
    ) -> ReplicaResult<SubscriptionId> {
        self.inner.check_open()?;
        let id = lock(&self.inner.subscriptions).add_query();
        self.inner.queries.lock().await.insert(
            id,
            QueryEntry {
                body,
                on_data,
                last: None,
            },
        );
        self.inner.rerun_query(id).await?;
        Ok(id)
    }

    /// Registers a watch over a key prefix (optionally index-scoped).
    pub async fn watch(
        &self,
        opts: WatchOptions,
        callback: WatchCallback,
    ) -> ReplicaResult<SubscriptionId> {
        self.inner.check_open()?;
        let initial = opts.initial_values_in_first_diff;
        let id = lock(&self.inner.subscriptions).add_watch(opts.clone(), Arc::clone(&callback));
        if initial {
            // Deliver existing entries as adds, ordered with other fires.
            let _guard = self.inner.fire_lock.lock().await;
            let entries = self.inner.initial_watch_entries(&opts).await?;
            callback(&entries);
        }
        Ok(id)
    }

    /// Removes a subscription of either flavor.
    pub async fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.inner.subscriptions).remove(id);
        self.inner.queries.lock().await.remove(&id);
    }

    /// Runs one pull cycle now (independent of the scheduled loop).
    pub async fn pull_now(&self) -> ReplicaResult<()> {
        self.inner.check_open()?;
        self.inner.perform_pull().await.map(|_| ())
    }

    /// Runs one push cycle now (independent of the debounce).
    pub async fn push_now(&self) -> ReplicaResult<()> {
        self.inner.check_open()?;
        self.inner.perform_push().await.map(|_| ())
    }

    /// Applies a server-initiated pull response.
    ///
    /// Fails with [`ReplicaError::PokeOutOfDate`] when the poke's base
    /// cookie no longer matches; the host should resynchronize its poke
    /// stream.
    pub async fn poke(
        &self,
        base_cookie: &Cookie,
        response: &PullResponseOk,
    ) -> ReplicaResult<()> {
        self.inner.check_open()?;
        match handle_pull_response(&self.inner.memdag, base_cookie, response).await? {
            HandlePullResponse::Applied { sync_head } => {
                self.inner.finish_pull(sync_head).await
            }
            HandlePullResponse::NoOp => Ok(()),
            HandlePullResponse::CookieMismatch => Err(ReplicaError::PokeOutOfDate),
        }
    }

    /// Persists the working dag into the shared store now.
    pub async fn persist_now(&self) -> ReplicaResult<()> {
        self.inner.check_open()?;
        self.inner.run_persist().await
    }

    /// Picks up other tabs' persisted state now.
    pub async fn refresh_now(&self) -> ReplicaResult<()> {
        self.inner.check_open()?;
        self.inner.run_refresh().await
    }

    /// Stops background work, clears subscriptions without firing, and —
    /// for a private store — closes it.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.close_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.abort();
        }
        lock(&self.inner.subscriptions).clear();
        self.inner.queries.lock().await.clear();
        if self.inner.own_store {
            self.inner.kv.close().await;
        }
    }

    fn spawn_loops(
        &self,
        pull_interval: Option<Duration>,
        push_delay: Duration,
        push_rx: mpsc::Receiver<()>,
        enable_scheduled_persist: bool,
        enable_scheduled_refresh: bool,
    ) {
        let mut tasks = Vec::new();

        // Heartbeat.
        tasks.push(spawn_interval(
            &self.inner,
            intervals::HEARTBEAT,
            None,
            |inner| async move {
                let now = (inner.now)();
                match write_heartbeat(&inner.perdag, &inner.client_id, now).await {
                    Err(ReplicaError::ClientStateNotFound(_)) => {
                        inner.notify_client_state_not_found();
                    }
                    Err(err) => tracing::error!(%err, "heartbeat failed"),
                    Ok(()) => {}
                }
            },
        ));

        // Client GC.
        tasks.push(spawn_interval(
            &self.inner,
            intervals::CLIENT_GC,
            None,
            |inner| async move {
                match collect_clients(
                    &inner.perdag,
                    &inner.client_id,
                    (inner.now)(),
                    inner.client_max_inactive_ms,
                )
                .await
                {
                    Ok(collected) if !collected.is_empty() => {
                        if let Some(cb) = &inner.callbacks.on_clients_deleted {
                            cb(&collected, &[]);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(%err, "client gc failed"),
                }
            },
        ));

        // Client-group GC.
        tasks.push(spawn_interval(
            &self.inner,
            intervals::CLIENT_GROUP_GC,
            None,
            |inner| async move {
                match collect_client_groups(&inner.perdag, inner.enable_mutation_recovery).await {
                    Ok(collected) if !collected.is_empty() => {
                        if let Some(cb) = &inner.callbacks.on_clients_deleted {
                            cb(&[], &collected);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(%err, "client group gc failed"),
                }
            },
        ));

        // Cross-database GC.
        tasks.push(spawn_interval(
            &self.inner,
            intervals::DB_COLLECT,
            Some(intervals::DB_COLLECT_INITIAL_DELAY),
            |inner| async move {
                if let Err(err) = collect_databases(
                    &inner.provider,
                    &inner.registry,
                    &inner.db_name,
                    (inner.now)(),
                    inner.client_max_inactive_ms,
                    inner.enable_mutation_recovery,
                )
                .await
                {
                    tracing::error!(%err, "database collect failed");
                }
            },
        ));

        // Mutation recovery.
        if self.inner.enable_mutation_recovery {
            tasks.push(spawn_interval(
                &self.inner,
                intervals::MUTATION_RECOVERY,
                None,
                |inner| async move {
                    let request_id = inner.request_id();
                    if let Err(err) = recover_mutations(
                        &inner.provider,
                        &inner.registry,
                        &inner.db_name,
                        &inner.profile_id,
                        inner.pusher.as_ref(),
                        inner.puller.as_ref(),
                        &request_id,
                    )
                    .await
                    {
                        tracing::error!(%err, "mutation recovery failed");
                    }
                },
            ));
        }

        // Scheduled persist.
        if enable_scheduled_persist {
            tasks.push(spawn_interval(
                &self.inner,
                intervals::SCHEDULED_PERSIST,
                None,
                |inner| async move {
                    if let Err(err) = inner.run_persist().await {
                        tracing::error!(%err, "scheduled persist failed");
                    }
                },
            ));
        }

        // Refresh on peer persists.
        if enable_scheduled_refresh {
            let inner = Arc::clone(&self.inner);
            let mut close_rx = self.inner.close_tx.subscribe();
            let mut persist_rx = self.inner.channels.subscribe_persist(&self.inner.db_name);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => break,
                        event = persist_rx.recv() => match event {
                            Ok(client) if client != inner.client_id => {
                                if let Err(err) = inner.run_refresh().await {
                                    tracing::error!(%err, "refresh failed");
                                }
                            }
                            Ok(_) => {}
                            Err(_) => {}
                        },
                    }
                }
            }));
        }

        // Update-needed on peer group creation.
        {
            let inner = Arc::clone(&self.inner);
            let mut close_rx = self.inner.close_tx.subscribe();
            let mut new_client_rx = self.inner.channels.subscribe_new_client(&self.inner.db_name);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => break,
                        event = new_client_rx.recv() => match event {
                            Ok(group) if group != inner.client_group_id => {
                                if let Some(cb) = &inner.callbacks.on_update_needed {
                                    cb(UpdateNeededReason::NewClientGroup);
                                }
                            }
                            Ok(_) => {}
                            Err(_) => {}
                        },
                    }
                }
            }));
        }

        // Pull loop: interval-driven, with bounded-backoff retries on
        // transport failure.
        if let (Some(interval), true) = (pull_interval, self.inner.puller.is_some()) {
            let inner = Arc::clone(&self.inner);
            let mut close_rx = self.inner.close_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut backoff = RetryBackoff::new(inner.request_options);
                let mut delay = interval;
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    match inner.perform_pull().await {
                        Ok(true) => {
                            backoff.reset();
                            delay = interval;
                        }
                        Ok(false) => {
                            delay = backoff.next_delay();
                        }
                        Err(err) => {
                            tracing::error!(%err, "pull failed");
                            delay = backoff.next_delay();
                        }
                    }
                }
            }));
        }

        // Push loop: debounced trigger queue.
        if self.inner.pusher.is_some() {
            let inner = Arc::clone(&self.inner);
            let mut close_rx = self.inner.close_tx.subscribe();
            let mut push_rx = push_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => break,
                        trigger = push_rx.recv() => {
                            if trigger.is_none() {
                                break;
                            }
                            tokio::time::sleep(push_delay).await;
                            while push_rx.try_recv().is_ok() {}
                            match inner.perform_push().await {
                                Ok(_) => {}
                                Err(err) => tracing::error!(%err, "push failed"),
                            }
                        }
                    }
                }
            }));
        }

        *lock(&self.tasks) = tasks;
    }
}

fn spawn_interval<F, Fut>(
    inner: &Arc<Inner>,
    every: Duration,
    initial_delay: Option<Duration>,
    body: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let inner = Arc::clone(inner);
    let mut close_rx = inner.close_tx.subscribe();
    tokio::spawn(async move {
        if let Some(delay) = initial_delay {
            tokio::select! {
                _ = close_rx.changed() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                () = tokio::time::sleep(every) => body(Arc::clone(&inner)).await,
            }
        }
    })
}

impl Inner {
    fn check_open(&self) -> ReplicaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicaError::Closed);
        }
        Ok(())
    }

    fn request_id(&self) -> String {
        let count = self.request_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}-{}", self.client_id, self.session_id, count)
    }

    async fn read_main(&self) -> ReplicaResult<ReadTx> {
        let opened = ReadTx::open(&self.memdag, Whence::Head(head::MAIN.to_owned())).await;
        self.upgrade_sync_result(opened).await
    }

    /// Converts a missing-chunk failure into `ClientStateNotFound` when
    /// this client has been collected out of the shared store.
    async fn upgrade_sync_result<T>(
        &self,
        result: Result<T, SyncError>,
    ) -> ReplicaResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(SyncError::Dag(DagError::ChunkNotFound(hash))) => {
                if self.client_exists().await {
                    Err(SyncError::Dag(DagError::ChunkNotFound(hash)).into())
                } else {
                    self.notify_client_state_not_found();
                    Err(ReplicaError::ClientStateNotFound(self.client_id.clone()))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn client_exists(&self) -> bool {
        let Ok(rt) = self.perdag.read().await else {
            return true;
        };
        match read_clients(&rt).await {
            Ok(clients) => clients.contains_key(&self.client_id),
            Err(_) => true,
        }
    }

    fn notify_client_state_not_found(&self) {
        if let Some(cb) = &self.callbacks.on_client_state_not_found {
            cb();
        }
    }

    async fn mutate(&self, mutator_name: &str, args: Value) -> ReplicaResult<()> {
        self.check_open()?;
        let Some(mutator) = self.mutators.get(mutator_name).cloned() else {
            return Err(ReplicaError::UnknownMutator(mutator_name.to_owned()));
        };

        let opened = WriteTx::open(&self.memdag, Whence::Head(head::MAIN.to_owned())).await;
        let mut wt = self.upgrade_sync_result(opened).await?;
        let old_main = wt.basis_hash();
        if let Err(source) = mutator(&mut wt, args.clone()).await {
            return Err(ReplicaError::MutatorFailed {
                name: mutator_name.to_owned(),
                source,
            });
        }
        let mutation_id =
            next_mutation_id(wt.dag(), &self.client_id, wt.basis_hash(), 0).await?;
        let new_main = wt
            .commit_local(
                head::MAIN,
                LocalCommitArgs {
                    client_id: self.client_id.clone(),
                    mutation_id,
                    mutator_name: mutator_name.to_owned(),
                    mutator_args: args,
                    original_hash: None,
                    timestamp: (self.now)(),
                },
            )
            .await?;

        let diffs = {
            let rt = self.memdag.read().await?;
            let old_commit = read_commit(&rt, old_main).await?;
            let new_commit = read_commit(&rt, new_main).await?;
            commit_diffs(&rt, &old_commit, &new_commit).await?
        };
        self.fire_subscriptions(&diffs).await?;
        let _ = self.push_tx.try_send(());
        Ok(())
    }

    /// One pull attempt. `Ok(true)` means the transport worked (whatever
    /// the outcome); `Ok(false)` means it did not and the caller should
    /// back off.
    async fn perform_pull(&self) -> ReplicaResult<bool> {
        let Some(puller) = self.puller.clone() else {
            return Ok(true);
        };
        if self.halted.load(Ordering::SeqCst) {
            return Ok(true);
        }
        if let Some(cb) = &self.callbacks.on_sync {
            cb(true);
        }
        let result = self.perform_pull_inner(puller.as_ref()).await;
        if let Some(cb) = &self.callbacks.on_sync {
            cb(false);
        }
        result
    }

    async fn perform_pull_inner(&self, puller: &dyn Puller) -> ReplicaResult<bool> {
        let desc = PullDescription {
            profile_id: self.profile_id.clone(),
            client_group_id: self.client_group_id.clone(),
            schema_version: self.schema_version.clone(),
        };

        let mut reauth_attempts = 0u32;
        loop {
            let request_id = self.request_id();
            let begin = begin_pull(&self.memdag, puller, &desc, &request_id).await?;

            if begin.http_info.http_status_code == 401 {
                let Some(get_auth) = &self.callbacks.get_auth else {
                    tracing::error!("pull unauthorized and no auth provider");
                    return Ok(false);
                };
                reauth_attempts += 1;
                if reauth_attempts > MAX_REAUTH_TRIES {
                    tracing::error!("giving up on re-auth after {MAX_REAUTH_TRIES} tries");
                    return Ok(false);
                }
                match get_auth() {
                    Some(fresh) => {
                        *lock(&self.auth) = fresh;
                        continue;
                    }
                    None => return Ok(false),
                }
            }

            return match begin.result {
                BeginPullResult::Applied { sync_head } => {
                    self.finish_pull(sync_head).await?;
                    self.online.set(true);
                    Ok(true)
                }
                BeginPullResult::NoOp | BeginPullResult::CookieMismatch => {
                    self.online.set(true);
                    Ok(true)
                }
                BeginPullResult::NoResponse => {
                    tracing::warn!(
                        error = %begin.http_info.error_message,
                        "pull got no usable response"
                    );
                    self.online.set(false);
                    Ok(false)
                }
                BeginPullResult::ClientStateNotFound => {
                    self.disable_own_group().await?;
                    self.notify_client_state_not_found();
                    Ok(true)
                }
                BeginPullResult::VersionNotSupported { version_type } => {
                    self.halted.store(true, Ordering::SeqCst);
                    if let Some(cb) = &self.callbacks.on_update_needed {
                        cb(UpdateNeededReason::VersionNotSupported { version_type });
                    }
                    Ok(true)
                }
            };
        }
    }

    /// Replays pending mutations onto the sync chain, then finalizes and
    /// fires the resulting diffs. Conflict outcomes abort quietly: the
    /// racing flow owns the state now.
    async fn finish_pull(&self, sync_head: Hash) -> ReplicaResult<()> {
        let mut expected = sync_head;
        loop {
            let result = match maybe_end_pull(&self.memdag, expected).await {
                Ok(result) => result,
                Err(SyncError::WrongSyncHead { .. } | SyncError::OverlappingSyncs) => {
                    tracing::debug!("pull lost a race during finalization");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if result.replay_mutations.is_empty() {
                self.fire_subscriptions(&result.diffs).await?;
                return Ok(());
            }
            for original in &result.replay_mutations {
                expected =
                    replay_mutation(&self.memdag, &self.mutators, head::SYNC, original).await?;
            }
        }
    }

    async fn perform_push(&self) -> ReplicaResult<bool> {
        let Some(pusher) = self.pusher.clone() else {
            return Ok(true);
        };
        if self.halted.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let desc = PushDescription {
            profile_id: self.profile_id.clone(),
            client_group_id: self.client_group_id.clone(),
            schema_version: self.schema_version.clone(),
        };
        let last_ackd = {
            let rt = self.perdag.read().await?;
            let groups = crate::groups::read_client_groups(&rt).await?;
            groups
                .get(&self.client_group_id)
                .map(|g| g.last_server_ackd_mutation_ids.clone())
                .unwrap_or_default()
        };
        let request_id = self.request_id();
        let (outcome, info) = undertow_sync::push(
            &self.memdag,
            pusher.as_ref(),
            &desc,
            &last_ackd,
            &request_id,
        )
        .await?;
        match outcome {
            PushOutcome::NothingToPush | PushOutcome::Success => {
                self.online.set(true);
                Ok(true)
            }
            PushOutcome::NoResponse => {
                tracing::warn!(error = %info.error_message, "push got no usable response");
                self.online.set(false);
                Ok(false)
            }
            PushOutcome::ClientStateNotFound => {
                self.disable_own_group().await?;
                self.notify_client_state_not_found();
                Ok(true)
            }
            PushOutcome::VersionNotSupported { version_type } => {
                self.halted.store(true, Ordering::SeqCst);
                self.disable_own_group().await?;
                if let Some(cb) = &self.callbacks.on_update_needed {
                    cb(UpdateNeededReason::VersionNotSupported { version_type });
                }
                Ok(true)
            }
        }
    }

    async fn disable_own_group(&self) -> ReplicaResult<()> {
        let mut wt = self.perdag.write().await?;
        let mut groups = read_client_groups_w(&wt).await?;
        if let Some(group) = groups.get_mut(&self.client_group_id) {
            if !group.disabled {
                group.disabled = true;
                write_client_groups(&mut wt, &groups)?;
                wt.commit().await?;
                tracing::warn!(group = %self.client_group_id, "own client group disabled");
            }
        }
        Ok(())
    }

    async fn run_persist(&self) -> ReplicaResult<()> {
        let _guard = self.persist_lock.lock().await;
        let persisted = persist(&self.client_id, &self.memdag, &self.perdag).await;
        match persisted {
            Ok(Some(_)) => {
                self.channels
                    .announce_persist(&self.db_name, self.client_id.clone());
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(ReplicaError::ClientStateNotFound(id)) => {
                self.notify_client_state_not_found();
                Err(ReplicaError::ClientStateNotFound(id))
            }
            Err(err) => Err(err),
        }
    }

    async fn run_refresh(&self) -> ReplicaResult<()> {
        let _guard = self.persist_lock.lock().await;
        match refresh(&self.client_id, &self.memdag, &self.perdag, &self.mutators).await? {
            Some((_, diffs)) => self.fire_subscriptions(&diffs).await,
            None => Ok(()),
        }
    }

    /// Delivers diffs to watches and re-runs affected queries, serialized
    /// through one queue so subscribers observe commits in commit order.
    async fn fire_subscriptions(&self, diffs: &DiffsMap) -> ReplicaResult<()> {
        if diffs.is_empty() {
            return Ok(());
        }
        let _guard = self.fire_lock.lock().await;
        let affected = {
            let subs = lock(&self.subscriptions);
            subs.fire_watches(diffs);
            subs.affected_queries(diffs)
        };
        for id in affected {
            self.rerun_query(id).await?;
        }
        Ok(())
    }

    async fn rerun_query(&self, id: SubscriptionId) -> ReplicaResult<()> {
        let mut queries = self.queries.lock().await;
        let Some(entry) = queries.get_mut(&id) else {
            return Ok(());
        };
        let tx = ReadTx::open(&self.memdag, Whence::Head(head::MAIN.to_owned())).await?;
        let qtx = QueryTx::new(&tx);
        let value = match (entry.body)(&qtx).await {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(%err, "query subscription body failed");
                return Ok(());
            }
        };
        lock(&self.subscriptions).set_query_read_set(id, qtx.take_read_set());
        if entry.last.as_ref() != Some(&value) {
            entry.last = Some(value.clone());
            (entry.on_data)(&value);
        }
        Ok(())
    }

    async fn initial_watch_entries(&self, opts: &WatchOptions) -> ReplicaResult<Vec<DiffOp>> {
        let tx = ReadTx::open(&self.memdag, Whence::Head(head::MAIN.to_owned())).await?;
        let entries = match &opts.index_name {
            None => {
                tx.scan(&ScanOptions {
                    prefix: opts.prefix.clone(),
                    ..ScanOptions::default()
                })
                .await?
            }
            Some(index) => {
                tx.scan_index(
                    index,
                    &ScanOptions {
                        prefix: encode_index_scan_prefix(&opts.prefix),
                        ..ScanOptions::default()
                    },
                )
                .await?
            }
        };
        Ok(entries
            .into_iter()
            .map(|(key, new_value)| DiffOp::Add { key, new_value })
            .collect())
    }
}

/// Creates the head for a brand-new client group: a fork of the freshest
/// available snapshot when forking is enabled and a candidate exists, the
/// genesis snapshot otherwise.
async fn new_group_head(
    wt: &mut DagWrite,
    groups: &crate::ClientGroupMap,
    indexes: &[IndexDefinition],
    enable_forking: bool,
) -> ReplicaResult<Hash> {
    if enable_forking {
        // The enabled group whose base snapshot carries the greatest cookie.
        let mut best: Option<(Cookie, Hash)> = None;
        for group in groups.values().filter(|g| !g.disabled) {
            let (_, base) = base_snapshot(wt, group.head_hash).await?;
            let Some(meta) = base.as_snapshot() else {
                continue;
            };
            let better = best.as_ref().map_or(true, |(cookie, _)| {
                compare_cookies(&meta.cookie, cookie) == std::cmp::Ordering::Greater
            });
            if better {
                best = Some((meta.cookie.clone(), base.value_hash));
            }
        }
        if let Some((cookie, value_hash)) = best {
            let index_records = build_indexes(wt, value_hash, indexes).await?;
            let commit = Commit {
                meta: CommitMeta::Snapshot(SnapshotMeta {
                    basis_hash: None,
                    last_mutation_ids: BTreeMap::new(),
                    cookie,
                }),
                value_hash,
                indexes: index_records,
            };
            let chunk = commit.chunk().map_err(ReplicaError::Sync)?;
            let hash = chunk.hash();
            wt.put_chunk(chunk);
            return Ok(hash);
        }
    }
    let (hash, _) = genesis_commit(wt, indexes).map_err(ReplicaError::Sync)?;
    Ok(hash)
}

/// Builds fresh index trees over an existing value tree.
async fn build_indexes(
    wt: &mut DagWrite,
    value_hash: Hash,
    definitions: &[IndexDefinition],
) -> ReplicaResult<Vec<IndexRecord>> {
    let mut records = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let mut tree = BTree::init(wt);
        let entries = BTree::at(value_hash)
            .scan(
                wt,
                &ScanOptions {
                    prefix: definition.key_prefix.clone(),
                    ..ScanOptions::default()
                },
            )
            .await?;
        for (key, value) in entries {
            match index_keys(
                &key,
                &value,
                &definition.json_pointer,
                definition.allow_empty,
            ) {
                Ok(keys) => {
                    for index_key in keys {
                        tree.put(wt, &index_key, value.clone()).await?;
                    }
                }
                Err(err) => {
                    tracing::warn!(index = %definition.name, %err, "entry not indexed");
                }
            }
        }
        records.push(IndexRecord {
            definition: definition.clone(),
            value_hash: tree.root(),
        });
    }
    Ok(records)
}
