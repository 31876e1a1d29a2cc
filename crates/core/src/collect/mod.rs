//! The collection cycle: one pass across every active meter, reading its
//! configured registers over BACnet and handing the readings to the outbox
//! writer.
//!
//! All readings of one cycle share the cycle-start timestamp, which keeps
//! cycles aligned even though individual properties are read at slightly
//! different moments.

pub mod batch_size;

pub use batch_size::BatchSizeManager;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bacnet::{BacnetClient, PropertyRef};
use crate::cache::{MeterCache, MeterEntry};
use crate::config::AgentConfig;
use crate::diagnostics::ErrorRing;
use crate::error::{BacnetError, CycleError};
use crate::guard::{CycleGuard, CyclePermit};
use crate::model::{CollectionError, CycleResult, ErrorOperation, PendingReading};
use crate::worker_metrics::WORKER_METRICS;

pub struct CollectionCycle {
    config: Arc<AgentConfig>,
    bacnet: Arc<dyn BacnetClient>,
    meters: Arc<MeterCache>,
    batch_sizes: Arc<BatchSizeManager>,
    pending_tx: mpsc::Sender<PendingReading>,
    guard: CycleGuard,
    errors: Arc<ErrorRing>,
}

/// What one meter contributed to the cycle.
struct MeterOutcome {
    readings: Vec<PendingReading>,
    errors: Vec<CollectionError>,
}

impl CollectionCycle {
    pub fn new(
        config: Arc<AgentConfig>,
        bacnet: Arc<dyn BacnetClient>,
        meters: Arc<MeterCache>,
        batch_sizes: Arc<BatchSizeManager>,
        pending_tx: mpsc::Sender<PendingReading>,
        errors: Arc<ErrorRing>,
    ) -> Self {
        Self {
            config,
            bacnet,
            meters,
            batch_sizes,
            pending_tx,
            guard: CycleGuard::new("collection"),
            errors,
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// Claim the cycle slot, or reject with `AlreadyRunning`. Never queues.
    pub fn try_begin(&self) -> Result<CyclePermit, CycleError> {
        self.guard.try_acquire()
    }

    pub async fn execute_cycle(&self, cancel: CancellationToken) -> Result<CycleResult, CycleError> {
        let permit = self.try_begin()?;
        Ok(self.run(permit, cancel).await)
    }

    /// One collection pass. The permit is held for the duration and released
    /// on return or unwind.
    pub async fn run(&self, permit: CyclePermit, cancel: CancellationToken) -> CycleResult {
        let _permit = permit;
        let cycle_start = Utc::now();
        let deadline = Instant::now() + self.config.cycle_deadline;
        let timer = WORKER_METRICS
            .cycle_seconds
            .with_label_values(&["collection"])
            .start_timer();

        let snapshot = self.meters.snapshot();
        let active: Vec<Arc<MeterEntry>> = snapshot.active().to_vec();
        let mut result = CycleResult {
            total_meters: active.len(),
            ..Default::default()
        };
        tracing::info!(meters = active.len(), "collection cycle started");

        let mut queue = active.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for entry in queue.by_ref().take(self.config.max_concurrent_meters) {
            in_flight.push(self.collect_meter(entry, cycle_start, cancel.clone()));
        }

        let mut deadline_hit = false;
        while !in_flight.is_empty() {
            let outcome = tokio::select! {
                Some(outcome) = in_flight.next() => outcome,
                _ = tokio::time::sleep_until(deadline) => {
                    deadline_hit = true;
                    break;
                }
                _ = cancel.cancelled() => break,
            };
            self.absorb(outcome, &mut result);
            if let Some(entry) = queue.next() {
                in_flight.push(self.collect_meter(entry, cycle_start, cancel.clone()));
            }
        }
        if deadline_hit {
            let remaining = queue.count() + in_flight.len();
            tracing::warn!(
                remaining,
                deadline_secs = self.config.cycle_deadline.as_secs(),
                "collection deadline reached, aborting remaining meters"
            );
            result.errors.push(CollectionError::new(
                ErrorOperation::Read,
                format!("cycle deadline reached with {remaining} meters unread"),
            ));
        }

        self.errors.extend(result.errors.iter().cloned());
        WORKER_METRICS
            .readings_produced
            .inc_by(result.readings_produced as u64);
        timer.observe_duration();
        tracing::info!(
            total = result.total_meters,
            ok = result.success_meters,
            readings = result.readings_produced,
            errors = result.errors.len(),
            "collection cycle finished"
        );
        result
    }

    fn absorb(&self, outcome: MeterOutcome, result: &mut CycleResult) {
        if outcome.errors.is_empty() {
            result.success_meters += 1;
        }
        result.readings_produced += outcome.readings.len();
        result.errors.extend(outcome.errors);
        for reading in outcome.readings {
            match self.pending_tx.try_send(reading) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(reading)) => {
                    WORKER_METRICS.readings_dropped.inc();
                    result.errors.push(
                        CollectionError::new(
                            ErrorOperation::Persist,
                            "pending channel at high-water mark, reading dropped",
                        )
                        .with_meter(reading.meter_id),
                    );
                }
                Err(mpsc::error::TrySendError::Closed(reading)) => {
                    result.errors.push(
                        CollectionError::new(ErrorOperation::Persist, "outbox writer stopped")
                            .with_meter(reading.meter_id),
                    );
                }
            }
        }
    }

    /// Read every register of one meter element. Batches shrink on timeout,
    /// retry once at the smaller size, then degrade to sequential reads.
    async fn collect_meter(
        &self,
        entry: Arc<MeterEntry>,
        cycle_start: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> MeterOutcome {
        let meter = &entry.meter;
        let mut outcome = MeterOutcome {
            readings: Vec::new(),
            errors: Vec::new(),
        };

        if entry.registers.is_empty() {
            outcome.errors.push(
                CollectionError::new(ErrorOperation::Read, "no registers configured")
                    .with_meter(&meter.meter_id),
            );
            return outcome;
        }
        let target: SocketAddr = match format!("{}:{}", meter.ip, meter.port).parse() {
            Ok(addr) => addr,
            Err(_) => {
                outcome.errors.push(
                    CollectionError::new(
                        ErrorOperation::Read,
                        format!("invalid meter address {}:{}", meter.ip, meter.port),
                    )
                    .with_meter(&meter.meter_id),
                );
                return outcome;
            }
        };

        let total = entry.registers.len();
        // Later writers win on a duplicated data point; misconfiguration, not
        // an error.
        let mut by_data_point: HashMap<String, PendingReading> = HashMap::with_capacity(total);
        let mut record = |register: &crate::model::RegisterDef, value: f64| {
            let reading = PendingReading {
                meter_id: meter.meter_id.clone(),
                element_id: meter.element_id,
                timestamp: cycle_start,
                data_point: register.field_name.clone(),
                value,
                unit: register.unit.clone(),
                register_id: register.id.clone(),
            };
            if by_data_point.insert(register.field_name.clone(), reading).is_some() {
                tracing::warn!(
                    meter_id = %meter.meter_id,
                    data_point = %register.field_name,
                    "duplicate data point in register map, keeping the later register"
                );
            }
        };

        let mut remaining: &[Arc<crate::model::RegisterDef>] = &entry.registers;
        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            let batch_size = self.batch_sizes.get(&meter.meter_id, total);
            let (batch, rest) = remaining.split_at(batch_size.min(remaining.len()));
            remaining = rest;

            match self.read_batch(target, &meter.meter_id, total, batch).await {
                Ok(reads) => {
                    for (register, read) in reads {
                        match read {
                            Ok(value) => record(&register, value),
                            Err(e) => {
                                WORKER_METRICS
                                    .read_errors
                                    .with_label_values(&[meter.meter_id.as_str()])
                                    .inc();
                                outcome.errors.push(
                                    CollectionError::new(ErrorOperation::Read, e.to_string())
                                        .with_meter(&meter.meter_id)
                                        .with_register(&register.id),
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    // The device is gone; one meter-level error, no point
                    // hammering the remaining batches.
                    WORKER_METRICS
                        .read_errors
                        .with_label_values(&[meter.meter_id.as_str()])
                        .inc();
                    outcome.errors.push(
                        CollectionError::new(ErrorOperation::Read, e.to_string())
                            .with_meter(&meter.meter_id),
                    );
                    break;
                }
            }
        }

        outcome.readings = by_data_point.into_values().collect();
        outcome
    }

    /// One batch, with the shrink-retry-sequential ladder. `Err` means the
    /// device is unreachable and the meter should be abandoned for this
    /// cycle.
    async fn read_batch(
        &self,
        target: SocketAddr,
        meter_id: &str,
        total: usize,
        batch: &[Arc<crate::model::RegisterDef>],
    ) -> Result<Vec<(Arc<crate::model::RegisterDef>, Result<f64, BacnetError>)>, BacnetError> {
        match self.read_multiple(target, batch).await {
            Ok(reads) => {
                self.batch_sizes.record_success(meter_id, total);
                return Ok(reads);
            }
            Err(BacnetError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }

        let shrunk = self.batch_sizes.record_timeout(meter_id, batch.len());
        tracing::debug!(meter_id, shrunk, "batch timed out, retrying at reduced size");

        let mut out = Vec::with_capacity(batch.len());
        let mut sequential = false;
        for sub in batch.chunks(shrunk) {
            if !sequential {
                match self.read_multiple(target, sub).await {
                    Ok(reads) => {
                        self.batch_sizes.record_success(meter_id, total);
                        out.extend(reads);
                        continue;
                    }
                    Err(BacnetError::Timeout(_)) => {
                        self.batch_sizes.record_timeout(meter_id, sub.len());
                        tracing::debug!(meter_id, "retry timed out, reading sequentially");
                        sequential = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            for register in sub {
                let read = self
                    .bacnet
                    .read_property(
                        target,
                        property_ref(register),
                        self.config.bacnet_read_timeout,
                    )
                    .await;
                out.push((register.clone(), read));
            }
        }
        Ok(out)
    }

    async fn read_multiple(
        &self,
        target: SocketAddr,
        batch: &[Arc<crate::model::RegisterDef>],
    ) -> Result<Vec<(Arc<crate::model::RegisterDef>, Result<f64, BacnetError>)>, BacnetError> {
        let props: Vec<PropertyRef> = batch.iter().map(|r| property_ref(r)).collect();
        let reads = self
            .bacnet
            .read_property_multiple(target, &props, self.config.bacnet_read_timeout)
            .await?;
        Ok(batch.iter().cloned().zip(reads).collect())
    }
}

fn property_ref(register: &crate::model::RegisterDef) -> PropertyRef {
    PropertyRef {
        object_type: register.object_type,
        instance: register.instance,
        property: register.property,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RegisterCache;
    use crate::test_support::{meter, register, FixedStore, ScriptedBacnet};

    async fn cache_with(
        registers: Vec<crate::model::RegisterDef>,
        meters: Vec<crate::model::Meter>,
    ) -> Arc<MeterCache> {
        let register_cache = RegisterCache::empty();
        let store = FixedStore::with_meters(registers, meters);
        register_cache.reload(&store).await.unwrap();
        let cache = MeterCache::empty();
        cache.reload(&store, &register_cache).await.unwrap();
        Arc::new(cache)
    }

    fn cycle(
        bacnet: ScriptedBacnet,
        meters: Arc<MeterCache>,
    ) -> (CollectionCycle, mpsc::Receiver<PendingReading>, Arc<BatchSizeManager>) {
        let (tx, rx) = mpsc::channel(1024);
        let batch_sizes = Arc::new(BatchSizeManager::new());
        let cycle = CollectionCycle::new(
            Arc::new(AgentConfig::for_testing()),
            Arc::new(bacnet),
            meters,
            batch_sizes.clone(),
            tx,
            Arc::new(ErrorRing::default()),
        );
        (cycle, rx, batch_sizes)
    }

    fn drain(rx: &mut mpsc::Receiver<PendingReading>) -> Vec<PendingReading> {
        let mut readings = Vec::new();
        while let Ok(reading) = rx.try_recv() {
            readings.push(reading);
        }
        readings
    }

    #[tokio::test]
    async fn happy_path_reads_every_register_once() {
        let meters = cache_with(
            vec![register("r1", "dm-1", 1, "V"), register("r2", "dm-1", 2, "A")],
            vec![meter("10", 1, "dm-1")],
        )
        .await;
        let bacnet = ScriptedBacnet::serving([(1, 230.1), (2, 5.2)]);
        let (cycle, mut rx, _) = cycle(bacnet, meters);

        let result = cycle.execute_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(result.total_meters, 1);
        assert_eq!(result.success_meters, 1);
        assert_eq!(result.readings_produced, 2);
        assert!(result.errors.is_empty());

        let readings = drain(&mut rx);
        assert_eq!(readings.len(), 2);
        // One shared cycle timestamp.
        assert_eq!(readings[0].timestamp, readings[1].timestamp);
        let volts = readings.iter().find(|r| r.data_point == "V").unwrap();
        assert_eq!(volts.value, 230.1);
        assert_eq!(volts.unit, "V");
    }

    #[tokio::test]
    async fn batch_shrinks_on_timeout_and_still_reads_everything() {
        let registers: Vec<_> = (1..=20)
            .map(|i| register(&format!("r{i}"), "dm-1", i, &format!("p{i}")))
            .collect();
        let meters = cache_with(registers, vec![meter("10", 1, "dm-1")]).await;
        let mut bacnet = ScriptedBacnet::serving((1..=20).map(|i| (i as u32, i as f64)));
        bacnet.max_batch = 10;
        let (cycle, mut rx, batch_sizes) = cycle(bacnet, meters);

        let result = cycle.execute_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(result.readings_produced, 20);
        assert!(result.errors.is_empty());
        assert_eq!(drain(&mut rx).len(), 20);
        // The shrink stuck: next cycle reads in batches of 10.
        assert_eq!(batch_sizes.get("10", 20), 10);
    }

    #[tokio::test]
    async fn unreachable_meter_is_one_error_and_zero_readings() {
        let meters = cache_with(
            vec![register("r1", "dm-1", 1, "V"), register("r2", "dm-1", 2, "A")],
            vec![meter("10", 1, "dm-1"), meter("11", 1, "dm-1")],
        )
        .await;
        let mut bacnet = ScriptedBacnet::serving([(1, 230.1), (2, 5.2)]);
        bacnet.unreachable = true;
        let (cycle, mut rx, _) = cycle(bacnet, meters);

        let result = cycle.execute_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(result.total_meters, 2);
        assert_eq!(result.success_meters, 0);
        assert_eq!(result.readings_produced, 0);
        // One error per meter, not per register.
        assert_eq!(result.errors.len(), 2);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn duplicate_data_points_keep_the_later_register() {
        let meters = cache_with(
            vec![register("r1", "dm-1", 1, "V"), register("r2", "dm-1", 2, "V")],
            vec![meter("10", 1, "dm-1")],
        )
        .await;
        let bacnet = ScriptedBacnet::serving([(1, 1.0), (2, 2.0)]);
        let (cycle, mut rx, _) = cycle(bacnet, meters);

        let result = cycle.execute_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(result.readings_produced, 1);
        let readings = drain(&mut rx);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 2.0);
        assert_eq!(readings[0].register_id, "r2");
    }

    #[tokio::test]
    async fn meter_without_registers_is_skipped_with_an_error() {
        let meters = cache_with(vec![], vec![meter("10", 1, "dm-1")]).await;
        let bacnet = ScriptedBacnet::empty();
        let (cycle, _rx, _) = cycle(bacnet, meters);

        let result = cycle.execute_cycle(CancellationToken::new()).await.unwrap();
        assert_eq!(result.readings_produced, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].error.contains("no registers"));
    }

    #[tokio::test]
    async fn second_invocation_is_rejected_not_queued() {
        let meters = cache_with(
            vec![register("r1", "dm-1", 1, "V")],
            vec![meter("10", 1, "dm-1")],
        )
        .await;
        let bacnet = ScriptedBacnet::serving([(1, 1.0)]);
        let (cycle, _rx, _) = cycle(bacnet, meters);

        let _held = cycle.try_begin().unwrap();
        assert!(matches!(
            cycle.execute_cycle(CancellationToken::new()).await,
            Err(CycleError::AlreadyRunning("collection"))
        ));
    }
}
