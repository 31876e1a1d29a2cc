//! The reading batcher: validates pending readings and writes them to the
//! outbox in bounded, individually retried transactions.
//!
//! Persisting is idempotent over any prefix of history: the outbox unique
//! constraint turns replays into skips, so feeding the same readings twice
//! leaves the table unchanged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::ReadingStore;
use crate::diagnostics::ErrorRing;
use crate::model::{CollectionError, ErrorOperation, PendingReading, PersistResult};
use crate::worker_metrics::WORKER_METRICS;

/// Attempts per batch: one insert plus three retries.
const INSERT_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);
/// Readings older than this are stale.
const MAX_READING_AGE_HOURS: i64 = 24;
/// Slightly-future timestamps tolerate clock skew with the meters.
const MAX_READING_SKEW_HOURS: i64 = 1;

pub struct ReadingBatcher {
    store: Arc<dyn ReadingStore>,
    insert_batch_size: usize,
    errors: Arc<ErrorRing>,
}

impl ReadingBatcher {
    pub fn new(store: Arc<dyn ReadingStore>, insert_batch_size: usize, errors: Arc<ErrorRing>) -> Self {
        Self {
            store,
            insert_batch_size: insert_batch_size.max(1),
            errors,
        }
    }

    /// Validate, chunk and insert. Each chunk commits on its own, so a batch
    /// that fails late does not take earlier chunks down with it.
    pub async fn persist(&self, readings: &[PendingReading]) -> PersistResult {
        let mut result = PersistResult::default();

        let now = Utc::now();
        let mut valid = Vec::with_capacity(readings.len());
        for reading in readings {
            match validate(reading, now) {
                Ok(()) => valid.push(reading.clone()),
                Err(reason) => {
                    result.skipped += 1;
                    tracing::debug!(
                        meter_id = %reading.meter_id,
                        data_point = %reading.data_point,
                        reason,
                        "reading skipped"
                    );
                }
            }
        }

        for chunk in valid.chunks(self.insert_batch_size) {
            match self.insert_with_retries(chunk).await {
                Ok(inserted) => {
                    let inserted = inserted as usize;
                    result.inserted += inserted;
                    // Conflict-swallowed rows were already present.
                    result.skipped += chunk.len() - inserted;
                    WORKER_METRICS.readings_persisted.inc_by(inserted as u64);
                }
                Err(error) => {
                    result.failed += chunk.len();
                    self.errors.push(
                        CollectionError::new(ErrorOperation::Persist, error.clone())
                            .with_meter(&chunk[0].meter_id),
                    );
                    tracing::error!(rows = chunk.len(), error = %error, "outbox insert batch failed");
                }
            }
        }

        WORKER_METRICS
            .readings_skipped
            .inc_by(result.skipped as u64);
        result
    }

    async fn insert_with_retries(&self, chunk: &[PendingReading]) -> Result<u64, String> {
        let mut attempt = 0u32;
        loop {
            let timer = WORKER_METRICS.insert_batch_seconds.start_timer();
            match self.store.insert_batch(chunk).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt < INSERT_RETRIES => {
                    drop(timer);
                    let backoff = retry_backoff(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "outbox insert failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Long-running consumer of the pending-readings channel. Batches up to
    /// `insert_batch_size` readings per insert. On shutdown it drains what is
    /// already queued before returning, so a canceled collection still gets
    /// its produced readings persisted.
    pub async fn run_drain(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<PendingReading>,
        cancel: CancellationToken,
    ) {
        let mut buf: Vec<PendingReading> = Vec::with_capacity(self.insert_batch_size);
        loop {
            buf.clear();
            tokio::select! {
                _ = cancel.cancelled() => {
                    rx.close();
                    while rx.recv_many(&mut buf, self.insert_batch_size).await > 0 {
                        self.persist(&buf).await;
                        buf.clear();
                    }
                    break;
                }
                received = rx.recv_many(&mut buf, self.insert_batch_size) => {
                    if received == 0 {
                        break;
                    }
                    let result = self.persist(&buf).await;
                    tracing::debug!(
                        inserted = result.inserted,
                        skipped = result.skipped,
                        failed = result.failed,
                        "outbox batch persisted"
                    );
                }
            }
        }
        tracing::debug!("outbox drain stopped");
    }
}

fn validate(reading: &PendingReading, now: chrono::DateTime<Utc>) -> Result<(), &'static str> {
    if !reading.value.is_finite() {
        return Err("non-finite value");
    }
    if reading.meter_id.is_empty() {
        return Err("missing meter id");
    }
    if reading.timestamp < now - chrono::Duration::hours(MAX_READING_AGE_HOURS) {
        return Err("timestamp too old");
    }
    if reading.timestamp > now + chrono::Duration::hours(MAX_READING_SKEW_HOURS) {
        return Err("timestamp in the future");
    }
    Ok(())
}

/// 100 ms doubling per attempt, with 25% jitter either way.
fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BASE.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((base * jitter) as u64)
}
