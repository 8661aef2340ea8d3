//! The sync coordinator: drains the operation log and refreshes stale cache
//! entries, on a timer and on demand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::refresh::{plan_refresh, reconcile, RefreshGroup};
use super::{
    Connectivity, CycleOutcome, ReadOutcome, ReadSource, SyncReport, SyncStatus, WriteOutcome,
};
use crate::cache::ReadCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::models::{
    row_id, ConflictResolution, OperationKind, Priority, SyncConfig, SyncConfigPatch,
};
use crate::oplog::{DrainReport, OperationLog};
use crate::remote::{Filter, RemoteError, RemoteResult, RemoteStore};
use crate::state::SyncHealth;
use crate::storage::{load_json, save_json, KeyValueStore};

/// Default key under which the sync configuration is persisted
pub const DEFAULT_CONFIG_KEY: &str = "wellsync.sync_config";
/// Suffix of the key holding the last cycle's outcome, next to the config
const LAST_CYCLE_SUFFIX: &str = ".last_cycle";

/// Builder for [`SyncCoordinator`]
pub struct SyncCoordinatorBuilder {
    log: Arc<OperationLog>,
    cache: Arc<ReadCache>,
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config_key: String,
    connectivity: Connectivity,
}

impl SyncCoordinatorBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config_key(mut self, key: impl Into<String>) -> Self {
        self.config_key = key.into();
        self
    }

    /// Share a connectivity flag with the host
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Initial connectivity, when no shared flag is supplied
    #[must_use]
    pub fn online(self, online: bool) -> Self {
        self.connectivity.set_online(online);
        self
    }

    /// Build the coordinator, loading the persisted configuration.
    pub fn build(self) -> SyncCoordinator {
        let config = match load_json::<SyncConfig>(self.store.as_ref(), &self.config_key) {
            Ok(Some(config)) => config.normalized(),
            Ok(None) => SyncConfig::default(),
            Err(error) => {
                tracing::warn!(
                    "Ignoring unreadable sync config at '{}': {}",
                    self.config_key,
                    error
                );
                SyncConfig::default()
            }
        };

        let last_cycle_key = format!("{}{LAST_CYCLE_SUFFIX}", self.config_key);
        let last_cycle = load_json::<LastCycle>(self.store.as_ref(), &last_cycle_key)
            .unwrap_or_else(|error| {
                tracing::warn!("Ignoring unreadable last sync record: {}", error);
                None
            })
            .unwrap_or_default();

        SyncCoordinator {
            inner: Arc::new(Inner {
                log: self.log,
                cache: self.cache,
                remote: self.remote,
                store: self.store,
                clock: self.clock,
                config_key: self.config_key,
                last_cycle_key,
                config: Mutex::new(config),
                connectivity: self.connectivity,
                in_flight: AtomicBool::new(false),
                active_timers: Arc::new(AtomicUsize::new(0)),
                timer: Mutex::new(None),
                last_cycle: Mutex::new(last_cycle),
            }),
        }
    }
}

/// Coordinates the operation log, the read cache and the remote store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<OperationLog>,
    cache: Arc<ReadCache>,
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config_key: String,
    last_cycle_key: String,
    config: Mutex<SyncConfig>,
    connectivity: Connectivity,
    in_flight: AtomicBool,
    active_timers: Arc<AtomicUsize>,
    timer: Mutex<Option<TimerHandle>>,
    last_cycle: Mutex<LastCycle>,
}

/// Outcome of the most recent cycle, persisted so other processes see it
#[derive(Debug, Default, Serialize, Deserialize)]
struct LastCycle {
    finished_at: Option<i64>,
    error: Option<String>,
}

struct TimerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    runtime: Handle,
}

impl TimerHandle {
    fn stop(self) {
        // The loop also exits when the sender is dropped
        let _ = self.shutdown.send(true);
    }
}

/// Holds the in-flight flag for the duration of one cycle
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Counts live timer loops
struct TimerLease(Arc<AtomicUsize>);

impl TimerLease {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TimerLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn builder(
        log: Arc<OperationLog>,
        cache: Arc<ReadCache>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            log,
            cache,
            remote,
            store,
            clock: Arc::new(SystemClock),
            config_key: DEFAULT_CONFIG_KEY.to_string(),
            connectivity: Connectivity::default(),
        }
    }

    pub fn log(&self) -> &Arc<OperationLog> {
        &self.inner.log
    }

    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.inner.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    /// Current configuration
    pub fn config(&self) -> SyncConfig {
        lock(&self.inner.config).clone()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Flip connectivity. Returns true when this moved offline to online.
    ///
    /// No cycle is triggered; see [`Self::on_connectivity_restored`].
    pub fn set_online(&self, online: bool) -> bool {
        let restored = self.inner.connectivity.set_online(online);
        tracing::debug!("Connectivity set to {}", if online { "online" } else { "offline" });
        restored
    }

    /// Mark the coordinator online and run a cycle immediately.
    pub async fn on_connectivity_restored(&self) -> CycleOutcome {
        self.set_online(true);
        tracing::info!("Connectivity restored; starting sync");
        self.run_once().await
    }

    /// Start the periodic timer, persisting `config` first when given.
    ///
    /// A running timer is replaced, never duplicated. The first cycle runs
    /// one interval after this call. Must be called within a Tokio runtime.
    pub fn start(&self, config: Option<SyncConfig>) -> Result<()> {
        let runtime = Handle::try_current().map_err(|error| {
            Error::InvalidInput(format!("Sync timer needs a Tokio runtime: {error}"))
        })?;

        if let Some(config) = config {
            self.replace_config(config.normalized());
        }

        self.restart_timer(&runtime);
        Ok(())
    }

    /// Stop the periodic timer. A cycle already in flight runs to completion.
    pub fn stop(&self) {
        let timer = lock(&self.inner.timer).take();
        if let Some(timer) = timer {
            timer.stop();
            tracing::info!("Stopped sync timer");
        }
    }

    /// Whether the periodic timer is active
    pub fn is_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .is_some_and(|timer| !timer.task.is_finished())
    }

    /// Merge `patch` into the configuration, persist it, and restart the
    /// timer if it is running.
    pub fn update_config(&self, patch: &SyncConfigPatch) -> SyncConfig {
        let config = self.config().merged(patch);
        self.replace_config(config.clone());

        let runtime = lock(&self.inner.timer)
            .as_ref()
            .map(|timer| timer.runtime.clone());
        if let Some(runtime) = runtime {
            self.restart_timer(&runtime);
        }
        config
    }

    fn replace_config(&self, config: SyncConfig) {
        if let Err(error) = save_json(self.inner.store.as_ref(), &self.inner.config_key, &config) {
            tracing::warn!("Failed to persist sync config: {}", error);
        }
        *lock(&self.inner.config) = config;
    }

    fn restart_timer(&self, runtime: &Handle) {
        let interval = self.config().sync_interval;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let lease = TimerLease::new(Arc::clone(&self.inner.active_timers));
        let task = runtime.spawn(timer_loop(
            Arc::downgrade(&self.inner),
            interval,
            shutdown_rx,
            lease,
        ));

        let previous = lock(&self.inner.timer).replace(TimerHandle {
            shutdown,
            task,
            runtime: runtime.clone(),
        });
        if let Some(previous) = previous {
            previous.stop();
        }
        tracing::info!("Sync timer running every {:?}", interval);
    }

    /// Run one sync cycle: drain the log, then refresh stale cache entries.
    ///
    /// Skipped while offline or while another cycle is in flight. Failures
    /// are collected in the report and never returned as errors.
    pub async fn run_once(&self) -> CycleOutcome {
        if !self.is_online() {
            tracing::debug!("Skipping sync cycle while offline");
            return CycleOutcome::Offline;
        }
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight) else {
            tracing::debug!("Sync cycle already in flight; skipping trigger");
            return CycleOutcome::AlreadyRunning;
        };

        let config = self.config();
        let started_at = self.inner.clock.now_millis();
        let drained = if self.inner.log.pending_count() == 0 {
            DrainReport::default()
        } else {
            self.inner.log.drain(self.inner.remote.as_ref()).await
        };
        let mut report = SyncReport {
            drained,
            started_at,
            ..SyncReport::default()
        };

        if self.is_online() {
            self.refresh(&config, &mut report).await;
        } else {
            tracing::debug!("Went offline after draining; skipping cache refresh");
        }
        report.finished_at = self.inner.clock.now_millis();

        let last = LastCycle {
            finished_at: Some(report.finished_at),
            error: report.first_error().map(str::to_string),
        };
        let store = self.inner.store.as_ref();
        if let Err(error) = save_json(store, &self.inner.last_cycle_key, &last) {
            tracing::warn!("Failed to persist last sync record: {}", error);
        }
        *lock(&self.inner.last_cycle) = last;

        tracing::info!(
            "Sync cycle finished: {} operation(s) synced, {} failed, {} table(s) refreshed, {} refresh error(s)",
            report.drained.synced,
            report.drained.failed(),
            report.refreshed_tables.len(),
            report.refresh_errors.len()
        );
        CycleOutcome::Completed(report)
    }

    async fn refresh(&self, config: &SyncConfig, report: &mut SyncReport) {
        let candidates = self.inner.cache.refresh_candidates();
        if candidates.is_empty() {
            return;
        }

        let id_column = self.inner.cache.config().id_column.clone();
        let groups = plan_refresh(&candidates, config.priority_sync, config.batch_size);
        tracing::debug!(
            "Refreshing {} table group(s) from {} candidate(s)",
            groups.len(),
            candidates.len()
        );

        for mut group in groups {
            // The put below replaces the table, so every cached row must be fetched
            let cached_ids = self
                .inner
                .cache
                .get_entries(&group.table, true)
                .into_iter()
                .filter_map(|entry| entry.row_id);
            group.include_ids(cached_ids);

            match self
                .refresh_group(&group, config.conflict_resolution, &id_column)
                .await
            {
                Ok(rows) => {
                    report.refreshed_rows += rows;
                    report.refreshed_tables.push(group.table);
                }
                Err(error) => {
                    tracing::warn!("Failed to refresh '{}': {}", group.table, error);
                    report.refresh_errors.push(format!("{}: {error}", group.table));
                }
            }
        }
    }

    async fn refresh_group(
        &self,
        group: &RefreshGroup,
        mode: ConflictResolution,
        id_column: &str,
    ) -> RemoteResult<usize> {
        let rows = self
            .inner
            .remote
            .fetch(&group.table, &group.filter(id_column))
            .await?;
        let pending = self.inner.log.pending_for(&group.table);
        let rows = reconcile(rows, &pending, mode, id_column);
        let count = rows.len();

        let ttl = Duration::from_millis(u64::try_from(group.ttl_millis).unwrap_or(1));
        self.inner.cache.put(&group.table, rows, Priority::High, ttl);
        Ok(count)
    }

    /// Snapshot for sync indicators
    pub fn status(&self) -> SyncStatus {
        let online = self.is_online();
        let in_flight = self.inner.in_flight.load(Ordering::Acquire);
        let pending_operations = self.inner.log.pending_count();
        let (last_sync_at, last_error) = {
            let last = lock(&self.inner.last_cycle);
            (last.finished_at, last.error.clone())
        };

        SyncStatus {
            health: SyncHealth::derive(online, in_flight, pending_operations, last_error.is_some()),
            online,
            running: self.is_running(),
            pending_operations,
            last_sync_at,
            last_error,
            config: self.config(),
        }
    }

    /// Apply an application write.
    ///
    /// The cache is updated optimistically. While online the remote store is
    /// tried directly, unless the log still holds operations for the same
    /// row. Otherwise the write is queued behind them.
    pub async fn write(
        &self,
        table: &str,
        kind: OperationKind,
        payload: Value,
        priority: Priority,
    ) -> Result<WriteOutcome> {
        let id_column = self.inner.cache.config().id_column.clone();
        let id = row_id(&payload, &id_column);
        if kind != OperationKind::Insert && id.is_none() {
            return Err(Error::InvalidInput(format!(
                "{kind} on '{table}' needs a row id in column '{id_column}'"
            )));
        }

        self.apply_locally(table, kind, &payload, id.as_deref(), priority);

        // Queued entries for the same row replay first, so this one must too
        let queued_ahead = id.as_deref().is_some_and(|id| {
            self.inner
                .log
                .pending_for(table)
                .iter()
                .any(|entry| entry.row_id(&id_column).as_deref() == Some(id))
        });
        if queued_ahead {
            tracing::debug!("Queueing {} on '{}' behind pending operations", kind, table);
        } else if self.is_online() {
            match self.apply_remote(table, kind, &payload, id.as_deref()).await {
                Ok(()) => return Ok(WriteOutcome::Applied),
                Err(error) => {
                    tracing::warn!("Direct {} on '{}' failed; queueing: {}", kind, table, error);
                }
            }
        }

        Ok(WriteOutcome::Queued(self.inner.log.record(table, payload, kind)))
    }

    fn apply_locally(
        &self,
        table: &str,
        kind: OperationKind,
        payload: &Value,
        id: Option<&str>,
        priority: Priority,
    ) {
        let cache = &self.inner.cache;
        let ttl = cache.config().default_ttl;
        match (kind, id) {
            (OperationKind::Delete, Some(id)) => {
                cache.remove_row(table, id);
            }
            (OperationKind::Update, Some(id)) => {
                let existing = cache
                    .get_entries(table, true)
                    .into_iter()
                    .find(|entry| entry.row_id.as_deref() == Some(id));
                let row = match existing {
                    Some(entry) => ConflictResolution::Merge
                        .resolve(kind, payload, entry.data)
                        .unwrap_or_else(|| payload.clone()),
                    None => payload.clone(),
                };
                cache.upsert_row(table, row, priority, ttl);
            }
            (OperationKind::Delete, None) => {}
            (_, _) => cache.upsert_row(table, payload.clone(), priority, ttl),
        }
    }

    async fn apply_remote(
        &self,
        table: &str,
        kind: OperationKind,
        payload: &Value,
        id: Option<&str>,
    ) -> RemoteResult<()> {
        let remote = self.inner.remote.as_ref();
        match (kind, id) {
            (OperationKind::Insert, _) => remote.insert(table, payload).await,
            (OperationKind::Update, Some(id)) => remote.update(table, payload, id).await,
            (OperationKind::Delete, Some(id)) => remote.delete(table, id).await,
            (_, None) => Err(RemoteError::MissingRowId(
                self.inner.cache.config().id_column.clone(),
            )),
        }
    }

    /// Serve rows from the cache, falling back to the remote store.
    ///
    /// Unexpired cached rows matching `filter` are returned as is. Otherwise
    /// the rows are fetched while online and cached. When the remote can't
    /// be reached, expired cached rows are served instead.
    pub async fn read_through(
        &self,
        table: &str,
        filter: &Filter,
        priority: Priority,
        ttl: Duration,
    ) -> Result<ReadOutcome> {
        let cached = self.cached_rows(table, filter, false);
        if !cached.is_empty() {
            return Ok(ReadOutcome {
                rows: cached,
                source: ReadSource::Cache,
            });
        }

        if !self.is_online() {
            return Ok(ReadOutcome {
                rows: self.cached_rows(table, filter, true),
                source: ReadSource::StaleCache,
            });
        }

        match self.fetch_into_cache(table, filter, priority, ttl).await {
            Ok(rows) => Ok(ReadOutcome {
                rows,
                source: ReadSource::Remote,
            }),
            Err(error) => {
                let stale = self.cached_rows(table, filter, true);
                if stale.is_empty() {
                    return Err(error.into());
                }
                tracing::warn!("Serving stale '{}' rows; remote failed: {}", table, error);
                Ok(ReadOutcome {
                    rows: stale,
                    source: ReadSource::StaleCache,
                })
            }
        }
    }

    /// Fetch rows into the cache regardless of what is cached.
    /// Returns the number of rows cached.
    pub async fn prefetch(
        &self,
        table: &str,
        filter: &Filter,
        priority: Priority,
        ttl: Duration,
    ) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::Remote(RemoteError::Unavailable(
                "offline".to_string(),
            )));
        }
        let rows = self.fetch_into_cache(table, filter, priority, ttl).await?;
        Ok(rows.len())
    }

    async fn fetch_into_cache(
        &self,
        table: &str,
        filter: &Filter,
        priority: Priority,
        ttl: Duration,
    ) -> RemoteResult<Vec<Value>> {
        let rows = self.inner.remote.fetch(table, filter).await?;
        let cache = &self.inner.cache;
        if *filter == Filter::All {
            cache.put(table, rows.clone(), priority, ttl);
        } else {
            for row in &rows {
                cache.upsert_row(table, row.clone(), priority, ttl);
            }
        }
        Ok(rows)
    }

    fn cached_rows(&self, table: &str, filter: &Filter, include_stale: bool) -> Vec<Value> {
        self.inner
            .cache
            .get(table, include_stale)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect()
    }
}

async fn timer_loop(
    inner: Weak<Inner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    _lease: TimerLease,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let coordinator = SyncCoordinator { inner };
                let cycle = tokio::spawn(async move { coordinator.run_once().await });
                if let Err(error) = cycle.await {
                    tracing::error!("Sync cycle aborted: {}", error);
                }
            }
        }
    }
    tracing::debug!("Sync timer loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::models::OperationKind;
    use crate::oplog::OperationLogConfig;
    use crate::remote::MemoryRemote;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TTL: Duration = Duration::from_millis(1_000);

    struct Harness {
        coordinator: SyncCoordinator,
        remote: Arc<MemoryRemote>,
        store: MemoryStore,
        clock: ManualClock,
    }

    fn harness(online: bool) -> Harness {
        let store = MemoryStore::new();
        let clock = ManualClock::new(50_000);
        let remote = Arc::new(MemoryRemote::new());
        let coordinator = build(&store, &clock, remote.clone(), online);
        Harness {
            coordinator,
            remote,
            store,
            clock,
        }
    }

    fn build(
        store: &MemoryStore,
        clock: &ManualClock,
        remote: Arc<dyn RemoteStore>,
        online: bool,
    ) -> SyncCoordinator {
        let shared_store: Arc<dyn KeyValueStore> = Arc::new(store.clone());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let log = OperationLog::new(
            Arc::clone(&shared_store),
            Arc::clone(&shared_clock),
            OperationLogConfig::default(),
        );
        let cache = ReadCache::new(
            Arc::clone(&shared_store),
            Arc::clone(&shared_clock),
            CacheConfig::default(),
        );
        SyncCoordinator::builder(Arc::new(log), Arc::new(cache), remote, shared_store)
            .clock(shared_clock)
            .online(online)
            .build()
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    /// Panics on the first insert, then delegates
    struct PanicOnce {
        inner: MemoryRemote,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl RemoteStore for PanicOnce {
        async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
            self.inner.fetch(table, filter).await
        }

        async fn insert(&self, table: &str, row: &Value) -> RemoteResult<()> {
            assert!(
                self.panicked.swap(true, Ordering::SeqCst),
                "remote client crashed"
            );
            self.inner.insert(table, row).await
        }

        async fn update(&self, table: &str, row: &Value, match_id: &str) -> RemoteResult<()> {
            self.inner.update(table, row, match_id).await
        }

        async fn delete(&self, table: &str, id: &str) -> RemoteResult<()> {
            self.inner.delete(table, id).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_cycle_is_noop() {
        let h = harness(false);
        h.coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);

        assert_eq!(h.coordinator.run_once().await, CycleOutcome::Offline);
        assert_eq!(h.remote.call_count(), 0);
        assert_eq!(h.coordinator.log().pending_count(), 1);
        assert_eq!(h.coordinator.status().health, SyncHealth::Offline);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_idle_cycle_makes_no_remote_calls() {
        let h = harness(true);

        let outcome = h.coordinator.run_once().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.drained, DrainReport::default());
        assert!(report.refreshed_tables.is_empty());
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_trigger_is_skipped() {
        let h = harness(true);
        h.remote.set_latency(Some(Duration::from_millis(150)));
        h.coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);

        let first = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(h.coordinator.run_once().await, CycleOutcome::AlreadyRunning);
        assert_eq!(h.coordinator.status().health, SyncHealth::Syncing);

        let outcome = first.await.unwrap();
        assert_eq!(outcome.report().unwrap().drained.synced, 1);
        assert_eq!(h.remote.calls(), vec!["insert feedback f1".to_string()]);
        assert_eq!(h.coordinator.status().health, SyncHealth::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_rewrites_stale_rows_at_high_priority() {
        let h = harness(true);
        h.remote.seed(
            "students",
            vec![json!({"id": 1, "name": "Ada"}), json!({"id": 2, "name": "Lin"})],
        );
        h.coordinator.cache().put(
            "students",
            vec![json!({"id": 1, "name": "ada"}), json!({"id": 2, "name": "lin"})],
            Priority::Low,
            TTL,
        );
        h.clock.advance(Duration::from_millis(600));

        let outcome = h.coordinator.run_once().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.refreshed_tables, vec!["students".to_string()]);
        assert_eq!(report.refreshed_rows, 2);

        let entries = h.coordinator.cache().get_entries("students", false);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.priority == Priority::High));
        assert!(entries.iter().all(|entry| entry.captured_at == 50_600));
        assert!(entries.iter().all(|entry| entry.ttl_millis() == 1_000));
        assert!(h
            .coordinator
            .cache()
            .get("students", false)
            .contains(&json!({"id": 1, "name": "Ada"})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fresh_entries_are_not_refreshed() {
        let h = harness(true);
        h.coordinator
            .cache()
            .put("students", vec![json!({"id": 1})], Priority::Low, TTL);
        h.clock.advance(Duration::from_millis(400));

        let outcome = h.coordinator.run_once().await;
        assert!(outcome.report().unwrap().refreshed_tables.is_empty());
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_failure_is_isolated_per_table() {
        let h = harness(true);
        h.remote.seed("students", vec![json!({"id": 1})]);
        h.remote.fail_table("classes");
        let cache = h.coordinator.cache();
        cache.put("students", vec![json!({"id": 1})], Priority::Low, TTL);
        cache.put("classes", vec![json!({"id": "c1"})], Priority::High, TTL);
        h.clock.advance(Duration::from_millis(700));

        let outcome = h.coordinator.run_once().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.refreshed_tables, vec!["students".to_string()]);
        assert_eq!(report.refresh_errors.len(), 1);
        assert!(report.refresh_errors[0].starts_with("classes: "));
        assert_eq!(cache.get("classes", true), vec![json!({"id": "c1"})]);

        let status = h.coordinator.status();
        assert_eq!(status.health, SyncHealth::Error);
        assert!(status.last_error.unwrap().starts_with("classes: "));
        assert_eq!(status.last_sync_at, Some(50_700));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_size_and_priority_order_bound_refresh() {
        let h = harness(true);
        h.remote.seed("alpha", vec![json!({"id": "a"})]);
        h.remote.seed("beta", vec![json!({"id": "b"})]);
        h.coordinator.update_config(&SyncConfigPatch {
            batch_size: Some(1),
            ..SyncConfigPatch::default()
        });
        h.coordinator
            .cache()
            .put("alpha", vec![json!({"id": "a"})], Priority::Low, TTL);
        h.coordinator
            .cache()
            .put("beta", vec![json!({"id": "b"})], Priority::High, TTL);
        h.clock.advance(Duration::from_millis(800));

        let outcome = h.coordinator.run_once().await;
        assert_eq!(
            outcome.report().unwrap().refreshed_tables,
            vec!["beta".to_string()]
        );
        assert_eq!(h.remote.calls(), vec!["fetch beta".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_merges_pending_updates() {
        let h = harness(false);
        h.remote
            .seed("checkins", vec![json!({"id": "c1", "mood": 1, "note": "remote"})]);
        h.coordinator.update_config(&SyncConfigPatch {
            conflict_resolution: Some(ConflictResolution::Merge),
            ..SyncConfigPatch::default()
        });
        h.coordinator.cache().put(
            "checkins",
            vec![json!({"id": "c1", "mood": 1, "note": "remote"})],
            Priority::Medium,
            TTL,
        );
        h.coordinator
            .write(
                "checkins",
                OperationKind::Update,
                json!({"id": "c1", "mood": 5}),
                Priority::Medium,
            )
            .await
            .unwrap();
        h.remote.fail_row("c1");
        // Past half of the default TTL the upserted row is stale
        h.clock.advance(Duration::from_secs(200));

        assert!(h.coordinator.set_online(true));
        let outcome = h.coordinator.run_once().await;
        let report = outcome.report().unwrap();
        assert_eq!(report.drained.failed(), 1);
        assert_eq!(
            h.coordinator.cache().get("checkins", false),
            vec![json!({"id": "c1", "mood": 5, "note": "remote"})]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_config_persists_across_instances() {
        let h = harness(true);
        let updated = h.coordinator.update_config(&SyncConfigPatch {
            batch_size: Some(7),
            sync_interval: Some(Duration::from_secs(5)),
            ..SyncConfigPatch::default()
        });
        assert_eq!(updated.batch_size, 7);
        assert!(!h.coordinator.is_running());

        let reopened = build(&h.store, &h.clock, Arc::new(MemoryRemote::new()), true);
        assert_eq!(reopened.config(), updated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_config_restarts_running_timer() {
        let h = harness(true);
        h.coordinator
            .start(Some(SyncConfig {
                sync_interval: Duration::from_secs(3600),
                ..SyncConfig::default()
            }))
            .unwrap();
        h.coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);

        h.coordinator.update_config(&SyncConfigPatch {
            sync_interval: Some(Duration::from_millis(20)),
            ..SyncConfigPatch::default()
        });
        assert!(h.coordinator.is_running());

        let log = Arc::clone(h.coordinator.log());
        assert!(wait_until(|| log.pending_count() == 0).await);
        let timers = Arc::clone(&h.coordinator.inner.active_timers);
        assert!(wait_until(|| timers.load(Ordering::SeqCst) == 1).await);
        h.coordinator.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_last_cycle_survives_restart() {
        let h = harness(true);
        assert_eq!(h.coordinator.status().last_sync_at, None);

        h.remote.fail_row("f1");
        h.coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);
        h.coordinator.run_once().await;

        let reopened = build(&h.store, &h.clock, h.remote.clone(), true);
        let status = reopened.status();
        assert_eq!(status.last_sync_at, Some(50_000));
        assert!(status.last_error.is_some());
        assert_eq!(status.health, SyncHealth::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_keeps_single_timer() {
        let h = harness(true);
        let config = SyncConfig {
            sync_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        };
        h.coordinator.start(Some(config.clone())).unwrap();
        h.coordinator.start(None).unwrap();
        assert!(h.coordinator.is_running());
        assert_eq!(h.coordinator.config(), config);

        let timers = Arc::clone(&h.coordinator.inner.active_timers);
        assert!(wait_until(|| timers.load(Ordering::SeqCst) == 1).await);

        h.coordinator.stop();
        h.coordinator.stop();
        assert!(!h.coordinator.is_running());
        assert!(wait_until(|| timers.load(Ordering::SeqCst) == 0).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timer_drains_log() {
        let h = harness(true);
        h.coordinator
            .start(Some(SyncConfig {
                sync_interval: Duration::from_millis(20),
                ..SyncConfig::default()
            }))
            .unwrap();
        h.coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);

        let log = Arc::clone(h.coordinator.log());
        assert!(wait_until(|| log.pending_count() == 0).await);
        assert_eq!(h.remote.rows("feedback"), vec![json!({"id": "f1"})]);
        h.coordinator.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_cycle_keeps_timer_alive() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(0);
        let remote = Arc::new(PanicOnce {
            inner: MemoryRemote::new(),
            panicked: AtomicBool::new(false),
        });
        let coordinator = build(&store, &clock, remote.clone(), true);
        coordinator
            .log()
            .record("feedback", json!({"id": "f1"}), OperationKind::Insert);

        coordinator
            .start(Some(SyncConfig {
                sync_interval: Duration::from_millis(20),
                ..SyncConfig::default()
            }))
            .unwrap();

        let log = Arc::clone(coordinator.log());
        assert!(wait_until(|| log.pending_count() == 0).await);
        assert!(remote.panicked.load(Ordering::SeqCst));
        assert!(coordinator.is_running());
        coordinator.stop();
    }

    #[test]
    fn test_start_requires_runtime() {
        let h = harness(true);
        assert!(matches!(h.coordinator.start(None), Err(Error::InvalidInput(_))));
        assert!(!h.coordinator.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_offline_queues_and_updates_cache() {
        let h = harness(false);
        let outcome = h
            .coordinator
            .write(
                "feedback",
                OperationKind::Insert,
                json!({"id": "f1", "text": "hi"}),
                Priority::High,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Queued(ref entry) if !entry.synced));
        assert_eq!(h.coordinator.log().pending_count(), 1);
        assert_eq!(
            h.coordinator.cache().get("feedback", false),
            vec![json!({"id": "f1", "text": "hi"})]
        );
        assert_eq!(h.remote.call_count(), 0);

        h.coordinator
            .write("feedback", OperationKind::Delete, json!("f1"), Priority::High)
            .await
            .unwrap();
        assert!(h.coordinator.cache().get("feedback", true).is_empty());
        assert_eq!(h.coordinator.log().pending_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_online_applies_directly() {
        let h = harness(true);
        let outcome = h
            .coordinator
            .write(
                "feedback",
                OperationKind::Insert,
                json!({"id": "f1"}),
                Priority::Medium,
            )
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(h.coordinator.log().pending_count(), 0);
        assert_eq!(h.remote.rows("feedback"), vec![json!({"id": "f1"})]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_online_write_queues_behind_pending_update() {
        let h = harness(false);
        h.remote.seed("checkins", vec![json!({"id": "s1", "mood": 0})]);

        let offline = h
            .coordinator
            .write(
                "checkins",
                OperationKind::Update,
                json!({"id": "s1", "mood": 1}),
                Priority::Medium,
            )
            .await
            .unwrap();
        assert!(matches!(offline, WriteOutcome::Queued(_)));

        h.coordinator.set_online(true);
        let online = h
            .coordinator
            .write(
                "checkins",
                OperationKind::Update,
                json!({"id": "s1", "mood": 2}),
                Priority::Medium,
            )
            .await
            .unwrap();
        assert!(matches!(online, WriteOutcome::Queued(_)));
        assert_eq!(h.remote.call_count(), 0);

        let report = h.coordinator.run_once().await;
        assert_eq!(report.report().unwrap().drained.synced, 2);
        assert_eq!(h.remote.rows("checkins"), vec![json!({"id": "s1", "mood": 2})]);
        assert_eq!(
            h.coordinator.cache().get("checkins", true),
            vec![json!({"id": "s1", "mood": 2})]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_to_other_row_skips_queue() {
        let h = harness(false);
        h.coordinator
            .write(
                "checkins",
                OperationKind::Insert,
                json!({"id": "s1", "mood": 1}),
                Priority::Medium,
            )
            .await
            .unwrap();

        h.coordinator.set_online(true);
        let outcome = h
            .coordinator
            .write(
                "checkins",
                OperationKind::Insert,
                json!({"id": "s2", "mood": 3}),
                Priority::Medium,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(h.coordinator.log().pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_falls_back_to_log_on_remote_failure() {
        let h = harness(true);
        h.remote.set_unavailable(true);
        let outcome = h
            .coordinator
            .write(
                "feedback",
                OperationKind::Insert,
                json!({"id": "f1"}),
                Priority::Medium,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(h.coordinator.log().pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_update_without_row_id_is_rejected() {
        let h = harness(true);
        let result = h
            .coordinator
            .write(
                "feedback",
                OperationKind::Update,
                json!({"text": "orphan"}),
                Priority::Medium,
            )
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(h.coordinator.log().pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_through_sources() {
        let h = harness(true);
        h.remote
            .seed("classes", vec![json!({"id": "c1"}), json!({"id": "c2"})]);

        let first = h
            .coordinator
            .read_through("classes", &Filter::All, Priority::Medium, TTL)
            .await
            .unwrap();
        assert_eq!(first.source, ReadSource::Remote);
        assert_eq!(first.rows.len(), 2);

        let second = h
            .coordinator
            .read_through("classes", &Filter::All, Priority::Medium, TTL)
            .await
            .unwrap();
        assert_eq!(second.source, ReadSource::Cache);
        assert_eq!(h.remote.call_count(), 1);

        let narrowed = h
            .coordinator
            .read_through(
                "classes",
                &Filter::Eq {
                    column: "id".to_string(),
                    value: "c2".to_string(),
                },
                Priority::Medium,
                TTL,
            )
            .await
            .unwrap();
        assert_eq!(narrowed.rows, vec![json!({"id": "c2"})]);

        h.clock.advance(Duration::from_millis(1_500));
        h.remote.set_unavailable(true);
        let stale = h
            .coordinator
            .read_through("classes", &Filter::All, Priority::Medium, TTL)
            .await
            .unwrap();
        assert_eq!(stale.source, ReadSource::StaleCache);
        assert_eq!(stale.rows.len(), 2);

        h.coordinator.set_online(false);
        let offline = h
            .coordinator
            .read_through("students", &Filter::All, Priority::Low, TTL)
            .await
            .unwrap();
        assert_eq!(offline.source, ReadSource::StaleCache);
        assert!(offline.rows.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_through_surfaces_error_without_cached_rows() {
        let h = harness(true);
        h.remote.set_unavailable(true);
        let result = h
            .coordinator
            .read_through("classes", &Filter::All, Priority::Medium, TTL)
            .await;
        assert!(matches!(result, Err(Error::Remote(RemoteError::Unavailable(_)))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_populates_cache() {
        let h = harness(true);
        h.remote
            .seed("students", vec![json!({"id": 1}), json!({"id": 2})]);
        let cached = h
            .coordinator
            .prefetch("students", &Filter::All, Priority::High, TTL)
            .await
            .unwrap();
        assert_eq!(cached, 2);
        assert_eq!(h.coordinator.cache().len(), 2);

        h.coordinator.set_online(false);
        assert!(h
            .coordinator
            .prefetch("students", &Filter::All, Priority::High, TTL)
            .await
            .is_err());
    }
}
