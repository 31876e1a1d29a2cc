//! The supervisor: owns the engines, their timers, their mutual exclusion,
//! and the shutdown sequence.
//!
//! Each timer tick tries to claim the engine's cycle slot and skips the tick
//! when the previous run still holds it. Cycles run on their own tasks; a
//! panicking cycle is contained, logged and counted as failed while the
//! process keeps going.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bacnet::BacnetClient;
use crate::cache::{MeterCache, RegisterCache};
use crate::collect::{BatchSizeManager, CollectionCycle};
use crate::config::AgentConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, CatalogStore, ReadingStore};
use crate::diagnostics::Diagnostics;
use crate::error::{AgentError, CycleError, DbError};
use crate::model::{
    CollectionError, ConnectivityStatus, CycleResult, ErrorOperation, SyncResult, Tenant,
    UploadResult,
};
use crate::outbox::ReadingBatcher;
use crate::remote::sync::SyncAgent;
use crate::remote::RemoteClient;
use crate::upload::UploadManager;

/// Why a manual trigger was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    AlreadyRunning(&'static str),
    Disconnected,
}

impl From<CycleError> for TriggerError {
    fn from(e: CycleError) -> Self {
        let CycleError::AlreadyRunning(cycle) = e;
        TriggerError::AlreadyRunning(cycle)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport<T> {
    pub running: bool,
    pub last_started: Option<DateTime<Utc>>,
    pub last_result: Option<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorsReport {
    pub collection: Vec<CollectionError>,
    pub outbox: Vec<CollectionError>,
    pub upload: Vec<CollectionError>,
    pub sync: Vec<CollectionError>,
}

/// Everything `GET /status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub connectivity: ConnectivityStatus,
    pub collection: EngineReport<CycleResult>,
    pub upload: EngineReport<UploadResult>,
    pub sync: EngineReport<SyncResult>,
    pub errors: ErrorsReport,
}

#[derive(Default)]
struct LastResults {
    collection: Option<(DateTime<Utc>, CycleResult)>,
    upload: Option<(DateTime<Utc>, UploadResult)>,
    sync: Option<(DateTime<Utc>, SyncResult)>,
}

pub struct Supervisor {
    config: Arc<AgentConfig>,
    pool: Option<Pool>,
    collector: Arc<CollectionCycle>,
    uploader: Arc<UploadManager>,
    sync_agent: Arc<SyncAgent>,
    catalog: Arc<dyn CatalogStore>,
    reading_store: Arc<dyn ReadingStore>,
    connectivity: watch::Receiver<ConnectivityStatus>,
    diagnostics: Arc<Diagnostics>,
    last: Mutex<LastResults>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Wire everything up and start the long-running tasks.
    ///
    /// Startup order: caches from the local DB, then the connectivity
    /// monitor and outbox drain, then one initial sync, then the timers.
    /// `pool` is owned here for the shutdown sequence; tests pass `None` and
    /// in-memory stores.
    pub async fn start(
        config: Arc<AgentConfig>,
        pool: Option<Pool>,
        reading_store: Arc<dyn ReadingStore>,
        catalog: Arc<dyn CatalogStore>,
        remote: Arc<dyn RemoteClient>,
        bacnet: Arc<dyn BacnetClient>,
    ) -> Result<Arc<Self>, AgentError> {
        let diagnostics = Arc::new(Diagnostics::default());
        let registers = Arc::new(RegisterCache::empty());
        let meters = Arc::new(MeterCache::empty());
        registers.reload(&*catalog).await?;
        meters.reload(&*catalog, &registers).await?;

        let cancel = CancellationToken::new();
        let (pending_tx, pending_rx) = mpsc::channel(config.pending_high_water);
        let batcher = Arc::new(ReadingBatcher::new(
            reading_store.clone(),
            config.insert_batch_size,
            diagnostics.outbox.clone(),
        ));
        let (monitor, connectivity, edge_rx) =
            ConnectivityMonitor::new(remote.clone(), config.connectivity_interval);

        let collector = Arc::new(CollectionCycle::new(
            config.clone(),
            bacnet,
            meters.clone(),
            Arc::new(BatchSizeManager::new()),
            pending_tx,
            diagnostics.collection.clone(),
        ));
        let uploader = Arc::new(UploadManager::new(
            config.clone(),
            reading_store.clone(),
            remote.clone(),
            connectivity.clone(),
            diagnostics.upload.clone(),
        ));
        let sync_agent = Arc::new(SyncAgent::new(
            remote,
            catalog.clone(),
            registers,
            meters,
            diagnostics.sync.clone(),
        ));

        let supervisor = Arc::new(Self {
            config,
            pool,
            collector,
            uploader,
            sync_agent,
            catalog,
            reading_store,
            connectivity,
            diagnostics,
            last: Mutex::new(LastResults::default()),
            cancel,
            tasks: Mutex::new(Vec::new()),
        });

        supervisor.track(tokio::spawn(monitor.run(supervisor.cancel.child_token())));
        supervisor.track(tokio::spawn(
            batcher.run_drain(pending_rx, supervisor.cancel.child_token()),
        ));

        // Initial sync, so the first collection sees current configuration.
        match supervisor
            .sync_agent
            .perform_sync(supervisor.cancel.child_token())
            .await
        {
            Ok(result) => {
                if !result.success {
                    tracing::warn!("initial sync incomplete, continuing with local mirror");
                }
                supervisor.last.lock().sync = Some((Utc::now(), result));
            }
            Err(CycleError::AlreadyRunning(_)) => unreachable!("no timers running yet"),
        }

        let timers = supervisor.clone();
        supervisor.track(tokio::spawn(timers.run_timers(edge_rx)));
        Ok(supervisor)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    async fn run_timers(self: Arc<Self>, mut edge_rx: mpsc::Receiver<()>) {
        use tokio::time::{interval_at, MissedTickBehavior};

        let now = Instant::now();
        let mut collection = interval_at(now + self.config.collection_interval, self.config.collection_interval);
        let mut upload = interval_at(now + self.config.upload_interval, self.config.upload_interval);
        let mut sync = interval_at(now + self.config.sync_interval, self.config.sync_interval);
        for timer in [&mut collection, &mut upload, &mut sync] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = collection.tick() => {
                    if let Err(CycleError::AlreadyRunning(_)) = self.spawn_collection() {
                        tracing::debug!("collection tick skipped, previous cycle still running");
                    }
                }
                _ = upload.tick() => {
                    if let Err(CycleError::AlreadyRunning(_)) = self.spawn_upload() {
                        tracing::debug!("upload tick skipped, previous cycle still running");
                    }
                }
                _ = sync.tick() => {
                    if let Err(CycleError::AlreadyRunning(_)) = self.spawn_sync() {
                        tracing::debug!("sync tick skipped, previous cycle still running");
                    }
                }
                Some(()) = edge_rx.recv() => self.on_connected_edge(),
            }
        }
        tracing::debug!("supervisor timers stopped");
    }

    /// After a reconnect, drain promptly when a real backlog built up.
    fn on_connected_edge(self: &Arc<Self>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let pending = match supervisor
                .reading_store
                .count_pending(supervisor.config.max_retries)
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(error = %e, "could not size the backlog after reconnect");
                    return;
                }
            };
            if pending > supervisor.config.edge_trigger_min {
                tracing::info!(pending, "reconnected with backlog, uploading now");
                if supervisor.spawn_upload().is_err() {
                    tracing::debug!("upload already running after reconnect");
                }
            }
        });
    }

    /// Start a collection cycle on its own task. `Err` when one is running.
    pub fn spawn_collection(self: &Arc<Self>) -> Result<(), CycleError> {
        let permit = self.collector.try_begin()?;
        let supervisor = self.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let started = Utc::now();
            let run = std::panic::AssertUnwindSafe(supervisor.collector.run(permit, cancel))
                .catch_unwind()
                .await;
            match run {
                Ok(result) => supervisor.last.lock().collection = Some((started, result)),
                Err(_) => supervisor.cycle_panicked("collection"),
            }
        });
        self.track(handle);
        Ok(())
    }

    pub fn spawn_upload(self: &Arc<Self>) -> Result<(), CycleError> {
        let permit = self.uploader.try_begin()?;
        let supervisor = self.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let started = Utc::now();
            let run = std::panic::AssertUnwindSafe(supervisor.uploader.run(permit, cancel))
                .catch_unwind()
                .await;
            match run {
                Ok(result) => supervisor.last.lock().upload = Some((started, result)),
                Err(_) => supervisor.cycle_panicked("upload"),
            }
        });
        self.track(handle);
        Ok(())
    }

    pub fn spawn_sync(self: &Arc<Self>) -> Result<(), CycleError> {
        let permit = self.sync_agent.try_begin()?;
        let supervisor = self.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let started = Utc::now();
            let run = std::panic::AssertUnwindSafe(supervisor.sync_agent.run(permit, cancel))
                .catch_unwind()
                .await;
            match run {
                Ok(result) => supervisor.last.lock().sync = Some((started, result)),
                Err(_) => supervisor.cycle_panicked("sync"),
            }
        });
        self.track(handle);
        Ok(())
    }

    fn cycle_panicked(&self, cycle: &'static str) {
        tracing::error!(cycle, "cycle panicked; marked failed, process continues");
        let ring = match cycle {
            "collection" => &self.diagnostics.collection,
            "upload" => &self.diagnostics.upload,
            _ => &self.diagnostics.sync,
        };
        ring.push(CollectionError::new(
            match cycle {
                "collection" => ErrorOperation::Read,
                "upload" => ErrorOperation::Upload,
                _ => ErrorOperation::Sync,
            },
            format!("{cycle} cycle panicked"),
        ));
    }

    // Manual triggers for the local API.

    pub fn trigger_collection(self: &Arc<Self>) -> Result<(), TriggerError> {
        self.spawn_collection().map_err(Into::into)
    }

    pub fn trigger_upload(self: &Arc<Self>) -> Result<(), TriggerError> {
        if !self.connectivity.borrow().is_connected {
            return Err(TriggerError::Disconnected);
        }
        self.spawn_upload().map_err(Into::into)
    }

    pub fn trigger_sync(self: &Arc<Self>) -> Result<(), TriggerError> {
        self.spawn_sync().map_err(Into::into)
    }

    // Read side for the local API.

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.connectivity.borrow().clone()
    }

    pub async fn tenant(&self) -> Result<Option<Tenant>, DbError> {
        self.catalog.tenant().await
    }

    pub async fn db_ok(&self) -> bool {
        match &self.pool {
            Some(pool) => db::ping(pool).await,
            None => true,
        }
    }

    pub fn status_snapshot(&self) -> StatusReport {
        let last = self.last.lock();
        StatusReport {
            connectivity: self.connectivity.borrow().clone(),
            collection: engine_report(self.collector.guard().is_busy(), &last.collection),
            upload: engine_report(self.uploader.guard().is_busy(), &last.upload),
            sync: engine_report(self.sync_agent.guard().is_busy(), &last.sync),
            errors: ErrorsReport {
                collection: self.diagnostics.collection.snapshot(),
                outbox: self.diagnostics.outbox.snapshot(),
                upload: self.diagnostics.upload.snapshot(),
                sync: self.diagnostics.sync.snapshot(),
            },
        }
    }

    /// Stop timers, cancel in-flight cycles, and wait out the grace period.
    /// Tasks still running after the grace are aborted. Closes the pool last.
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + self.config.shutdown_grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!("task panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!("task exceeded the shutdown grace, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(pool) = &self.pool {
            pool.close();
        }
        tracing::info!("supervisor stopped");
    }
}

fn engine_report<T: Clone>(running: bool, last: &Option<(DateTime<Utc>, T)>) -> EngineReport<T> {
    EngineReport {
        running,
        last_started: last.as_ref().map(|(started, _)| *started),
        last_result: last.as_ref().map(|(_, result)| result.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;
    use crate::test_support::{meter, register, FixedStore, MemReadingStore, MockRemote, ScriptedBacnet};
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    /// End to end on fakes: collect, persist through the drain, upload.
    #[tokio::test]
    async fn collect_persist_upload_roundtrip() {
        let store = MemReadingStore::new();
        let catalog = Arc::new(FixedStore::with_meters(
            vec![register("r1", "dm-1", 1, "V"), register("r2", "dm-1", 2, "A")],
            vec![meter("10", 1, "dm-1")],
        ));
        let remote = Arc::new(MockRemote::default());
        let bacnet = Arc::new(ScriptedBacnet::serving([(1, 230.1), (2, 5.2)]));

        // Long timer periods keep the periodic cycles out of this test; only
        // the manual triggers and the connectivity monitor run.
        let mut config = AgentConfig::for_testing();
        config.collection_interval = Duration::from_secs(3600);
        config.upload_interval = Duration::from_secs(3600);
        config.sync_interval = Duration::from_secs(3600);
        config.cycle_deadline = Duration::from_secs(5);

        let supervisor = Supervisor::start(
            Arc::new(config),
            None,
            store.clone(),
            catalog,
            remote.clone(),
            bacnet,
        )
        .await
        .unwrap();

        supervisor.trigger_collection().unwrap();
        let probe = store.clone();
        wait_until(move || probe.rows().len() == 2).await;

        // The monitor flips to connected after two probes.
        let sup = supervisor.clone();
        wait_until(move || sup.connectivity().is_connected).await;
        supervisor.trigger_upload().unwrap();
        let probe = store.clone();
        wait_until(move || {
            probe
                .rows()
                .iter()
                .all(|row| row.sync_status == SyncStatus::Done && row.is_synchronized)
        })
        .await;

        let status = supervisor.status_snapshot();
        assert_eq!(status.collection.last_result.unwrap().readings_produced, 2);
        assert_eq!(status.upload.last_result.unwrap().uploaded, 2);
        assert!(!status.collection.running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn upload_trigger_requires_connectivity() {
        let store = MemReadingStore::new();
        let catalog = Arc::new(FixedStore::default());
        let remote = Arc::new(MockRemote::default());
        // Stretch the probe interval so the state is still Unknown when the
        // trigger lands.
        let mut config = AgentConfig::for_testing();
        config.connectivity_interval = Duration::from_secs(3600);

        let supervisor = Supervisor::start(
            Arc::new(config),
            None,
            store,
            catalog,
            remote,
            Arc::new(ScriptedBacnet::empty()),
        )
        .await
        .unwrap();

        assert_eq!(
            supervisor.trigger_upload().unwrap_err(),
            TriggerError::Disconnected
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_every_task() {
        let supervisor = Supervisor::start(
            Arc::new(AgentConfig::for_testing()),
            None,
            MemReadingStore::new(),
            Arc::new(FixedStore::default()),
            Arc::new(MockRemote::default()),
            Arc::new(ScriptedBacnet::empty()),
        )
        .await
        .unwrap();

        supervisor.shutdown().await;
        assert!(supervisor.tasks.lock().is_empty());
    }
}
