//! The upload manager: drains unsynchronized readings from the outbox and
//! posts them to the Client System in bulk.
//!
//! Delivery is at-least-once. A batch is claimed (`pending` → `in_flight`),
//! posted under an idempotency key derived from the claimed row ids, then
//! resolved: acknowledged rows become `done` and are never touched again,
//! rejected rows become `failed` and wait for an operator, transient failures
//! return to `pending` with the retry counted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::db::ReadingStore;
use crate::diagnostics::ErrorRing;
use crate::error::{CycleError, RemoteError};
use crate::guard::{CycleGuard, CyclePermit};
use crate::model::{CollectionError, ConnectivityStatus, ErrorOperation, MeterReading, UploadResult};
use crate::remote::{idempotency_key, ReadingUpload, RemoteClient};
use crate::worker_metrics::WORKER_METRICS;

/// Backoff after a transient failure, doubling per failed attempt within one
/// upload cycle.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct UploadManager {
    config: Arc<AgentConfig>,
    store: Arc<dyn ReadingStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: watch::Receiver<ConnectivityStatus>,
    guard: CycleGuard,
    errors: Arc<ErrorRing>,
}

impl UploadManager {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<dyn ReadingStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: watch::Receiver<ConnectivityStatus>,
        errors: Arc<ErrorRing>,
    ) -> Self {
        Self {
            config,
            store,
            remote,
            connectivity,
            guard: CycleGuard::new("upload"),
            errors,
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity.borrow().is_connected
    }

    pub fn try_begin(&self) -> Result<CyclePermit, CycleError> {
        self.guard.try_acquire()
    }

    pub async fn perform_upload(
        &self,
        cancel: CancellationToken,
    ) -> Result<UploadResult, CycleError> {
        let permit = self.try_begin()?;
        Ok(self.run(permit, cancel).await)
    }

    /// One upload cycle: claim, post, resolve, repeat until the outbox is
    /// nearly drained or the cycle deadline passes.
    pub async fn run(&self, permit: CyclePermit, cancel: CancellationToken) -> UploadResult {
        let _permit = permit;
        let mut result = UploadResult::default();

        if !self.is_connected() {
            result.remaining = self.pending_count().await;
            tracing::debug!(remaining = result.remaining, "upload skipped, disconnected");
            return result;
        }

        let timer = WORKER_METRICS
            .cycle_seconds
            .with_label_values(&["upload"])
            .start_timer();
        let deadline = Instant::now() + self.config.upload_deadline;
        let mut failed_attempts = 0u32;

        loop {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }

            let batch = match self
                .store
                .claim_pending(self.config.upload_batch_size, self.config.max_retries)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.record(format!("claiming pending readings: {e}"));
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            let claimed = batch.len();
            let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
            let key = idempotency_key(&ids);
            let payload: Vec<ReadingUpload> = batch.iter().map(to_upload).collect();

            let posted = tokio::select! {
                _ = cancel.cancelled() => {
                    // A canceled cycle leaves nothing in flight.
                    if let Err(e) = self.store.release_claimed(&ids).await {
                        self.record(format!("releasing claimed readings: {e}"));
                    }
                    break;
                }
                posted = self.remote.upload_readings(&payload, &key) => posted,
            };

            match posted {
                Ok(()) => {
                    if let Err(e) = self.store.mark_done(&ids).await {
                        self.record(format!("marking readings done: {e}"));
                        break;
                    }
                    result.uploaded += claimed;
                    failed_attempts = 0;
                    WORKER_METRICS.readings_uploaded.inc_by(claimed as u64);
                    if claimed < self.config.upload_batch_size as usize {
                        break;
                    }
                }
                Err(e) if e.is_retriable() => {
                    if let Err(store_err) = self.store.release_to_pending(&ids, &e.to_string()).await
                    {
                        self.record(format!("releasing readings after failure: {store_err}"));
                        break;
                    }
                    WORKER_METRICS.upload_retries.inc();
                    self.record(format!("bulk upload failed: {e}"));
                    failed_attempts += 1;
                    let backoff = backoff_for(failed_attempts);
                    tracing::warn!(
                        rows = claimed,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "transient upload failure, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    if matches!(e, RemoteError::Unauthorized) {
                        tracing::error!("remote rejected the API key, operator action required");
                    }
                    if let Err(store_err) = self.store.mark_failed(&ids, &e.to_string()).await {
                        self.record(format!("marking readings failed: {store_err}"));
                        break;
                    }
                    result.failed += claimed;
                    self.record(format!("bulk upload rejected: {e}"));
                }
            }
        }

        result.remaining = self.pending_count().await;
        WORKER_METRICS.outbox_pending.set(result.remaining);
        timer.observe_duration();
        tracing::info!(
            uploaded = result.uploaded,
            failed = result.failed,
            remaining = result.remaining,
            "upload cycle finished"
        );
        result
    }

    async fn pending_count(&self) -> i64 {
        match self.store.count_pending(self.config.max_retries).await {
            Ok(count) => count,
            Err(e) => {
                self.record(format!("counting pending readings: {e}"));
                0
            }
        }
    }

    fn record(&self, error: String) {
        tracing::error!(error = %error, "upload engine error");
        self.errors
            .push(CollectionError::new(ErrorOperation::Upload, error));
    }
}

fn to_upload(reading: &MeterReading) -> ReadingUpload {
    ReadingUpload {
        meter_id: reading.meter_id.clone(),
        element_id: reading.element_id,
        timestamp: reading.timestamp,
        data_point: reading.data_point.clone(),
        value: reading.value,
        unit: reading.unit.clone(),
    }
}

fn backoff_for(failed_attempts: u32) -> Duration {
    let exp = failed_attempts.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;
    use crate::test_support::{connected_watch, disconnected_watch, pending, MemReadingStore, MockRemote};

    fn uploader(
        store: Arc<MemReadingStore>,
        remote: Arc<MockRemote>,
        connectivity: watch::Receiver<ConnectivityStatus>,
    ) -> UploadManager {
        UploadManager::new(
            Arc::new(AgentConfig::for_testing()),
            store,
            remote,
            connectivity,
            Arc::new(ErrorRing::default()),
        )
    }

    async fn seed(store: &MemReadingStore, n: usize) {
        let readings: Vec<_> = (0..n)
            .map(|i| crate::model::PendingReading {
                timestamp: chrono::Utc::now(),
                ..pending("m1", 1, &format!("p{i}"), i as f64)
            })
            .collect();
        store.insert_batch(&readings).await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_upload_reports_remaining_only() {
        let store = MemReadingStore::new();
        seed(&store, 3).await;
        let remote = Arc::new(MockRemote::default());
        let uploader = uploader(store.clone(), remote.clone(), disconnected_watch());

        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            UploadResult {
                uploaded: 0,
                failed: 0,
                remaining: 3
            }
        );
        assert!(remote.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn happy_path_marks_everything_done() {
        let store = MemReadingStore::new();
        seed(&store, 3).await;
        let remote = Arc::new(MockRemote::default());
        let uploader = uploader(store.clone(), remote.clone(), connected_watch());

        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.uploaded, 3);
        assert_eq!(result.remaining, 0);

        for row in store.rows() {
            assert_eq!(row.sync_status, SyncStatus::Done);
            assert!(row.is_synchronized);
            assert_eq!(row.last_error, None);
        }
        // One bulk POST with a stable idempotency key.
        let uploads = remote.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_return_rows_to_pending_until_success() {
        let store = MemReadingStore::new();
        seed(&store, 2).await;
        let remote = Arc::new(MockRemote::default());
        remote.set_default_upload_error(Some(RemoteError::Transport("connection refused".into())));

        // A deadline shorter than the first backoff limits each cycle to one
        // attempt.
        let mut config = AgentConfig::for_testing();
        config.upload_deadline = Duration::from_millis(500);
        let uploader = UploadManager::new(
            Arc::new(config),
            store.clone(),
            remote.clone(),
            connected_watch(),
            Arc::new(ErrorRing::default()),
        );

        for expected_retries in [1, 2] {
            let result = uploader
                .perform_upload(CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.uploaded, 0);
            assert_eq!(result.remaining, 2);
            for row in store.rows() {
                assert_eq!(row.sync_status, SyncStatus::Pending);
                assert_eq!(row.retry_count, expected_retries);
                assert!(row.last_error.as_deref().unwrap().contains("connection refused"));
            }
        }

        // Connectivity restored.
        remote.set_default_upload_error(None);
        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.uploaded, 2);
        assert_eq!(result.remaining, 0);
        for row in store.rows() {
            assert_eq!(row.sync_status, SyncStatus::Done);
            assert!(row.is_synchronized);
        }
    }

    #[tokio::test]
    async fn rejected_batches_are_failed_and_not_retried() {
        let store = MemReadingStore::new();
        seed(&store, 2).await;
        let remote = Arc::new(MockRemote::default());
        remote.script_uploads([Err(RemoteError::Status {
            status: 422,
            body: "bad payload".into(),
        })]);
        let uploader = uploader(store.clone(), remote.clone(), connected_watch());

        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.failed, 2);
        assert_eq!(result.uploaded, 0);
        for row in store.rows() {
            assert_eq!(row.sync_status, SyncStatus::Failed);
            assert_eq!(row.retry_count, 1);
            assert!(row.last_error.as_deref().unwrap().contains("422"));
        }

        // Failed rows are invisible to the next cycle.
        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.remaining, 0);
        assert_eq!(remote.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn retry_exhausted_rows_are_excluded_from_claims() {
        let store = MemReadingStore::new();
        seed(&store, 1).await;
        let id = store.rows()[0].id;
        for _ in 0..5 {
            store.release_to_pending(&[id], "remote down").await.unwrap();
        }
        let remote = Arc::new(MockRemote::default());
        let uploader = uploader(store.clone(), remote.clone(), connected_watch());

        let result = uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.uploaded, 0);
        assert_eq!(result.remaining, 0);
        assert!(remote.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn no_rows_stay_in_flight_after_a_cycle() {
        let store = MemReadingStore::new();
        seed(&store, 4).await;
        let remote = Arc::new(MockRemote::default());
        remote.script_uploads([Err(RemoteError::Timeout), Ok(())]);
        let uploader = uploader(store.clone(), remote.clone(), connected_watch());

        uploader
            .perform_upload(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.count_in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mutual_exclusion_rejects_a_second_cycle() {
        let store = MemReadingStore::new();
        let remote = Arc::new(MockRemote::default());
        let uploader = uploader(store, remote, connected_watch());

        let _held = uploader.try_begin().unwrap();
        assert!(matches!(
            uploader.perform_upload(CancellationToken::new()).await,
            Err(CycleError::AlreadyRunning("upload"))
        ));
    }
}
