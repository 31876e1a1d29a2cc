use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Process-wide metric group for the agent's engines.
///
/// Everything registers into one private [`Registry`]; the local API's
/// `/metrics` route encodes exactly this registry.
pub struct WorkerMetrics {
    pub registry: Registry,

    pub readings_produced: IntCounter,
    pub readings_persisted: IntCounter,
    pub readings_skipped: IntCounter,
    pub readings_dropped: IntCounter,
    pub readings_uploaded: IntCounter,
    pub upload_retries: IntCounter,
    pub read_errors: IntCounterVec,
    pub outbox_pending: IntGauge,
    pub connectivity_connected: IntGauge,
    pub cycle_seconds: HistogramVec,
    pub insert_batch_seconds: Histogram,
}

impl WorkerMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let readings_produced = IntCounter::with_opts(Opts::new(
            "metersync_readings_produced_total",
            "Readings produced by collection cycles",
        ))
        .unwrap();
        let readings_persisted = IntCounter::with_opts(Opts::new(
            "metersync_readings_persisted_total",
            "Readings inserted into the local outbox",
        ))
        .unwrap();
        let readings_skipped = IntCounter::with_opts(Opts::new(
            "metersync_readings_skipped_total",
            "Readings rejected by outbox validation or deduplicated on insert",
        ))
        .unwrap();
        let readings_dropped = IntCounter::with_opts(Opts::new(
            "metersync_readings_dropped_total",
            "Readings dropped because the pending channel hit its high-water mark",
        ))
        .unwrap();
        let readings_uploaded = IntCounter::with_opts(Opts::new(
            "metersync_readings_uploaded_total",
            "Readings acknowledged by the remote bulk endpoint",
        ))
        .unwrap();
        let upload_retries = IntCounter::with_opts(Opts::new(
            "metersync_upload_retries_total",
            "Upload batches that failed transiently and were returned to pending",
        ))
        .unwrap();
        let read_errors = IntCounterVec::new(
            Opts::new(
                "metersync_read_errors_total",
                "Per-meter BACnet read failures",
            ),
            &["meter_id"],
        )
        .unwrap();
        let outbox_pending = IntGauge::with_opts(Opts::new(
            "metersync_outbox_pending",
            "Unsynchronized readings waiting in the outbox",
        ))
        .unwrap();
        let connectivity_connected = IntGauge::with_opts(Opts::new(
            "metersync_connectivity_connected",
            "1 while the remote Client System is reachable",
        ))
        .unwrap();
        let cycle_seconds = HistogramVec::new(
            HistogramOpts::new("metersync_cycle_seconds", "Wall-clock duration of one cycle")
                .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["cycle"],
        )
        .unwrap();
        let insert_batch_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "metersync_insert_batch_seconds",
                "Duration of one outbox insert transaction",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        for c in [
            &readings_produced,
            &readings_persisted,
            &readings_skipped,
            &readings_dropped,
            &readings_uploaded,
            &upload_retries,
        ] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        registry.register(Box::new(read_errors.clone())).unwrap();
        registry.register(Box::new(outbox_pending.clone())).unwrap();
        registry
            .register(Box::new(connectivity_connected.clone()))
            .unwrap();
        registry.register(Box::new(cycle_seconds.clone())).unwrap();
        registry
            .register(Box::new(insert_batch_seconds.clone()))
            .unwrap();

        Self {
            registry,
            readings_produced,
            readings_persisted,
            readings_skipped,
            readings_dropped,
            readings_uploaded,
            upload_retries,
            read_errors,
            outbox_pending,
            connectivity_connected,
            cycle_seconds,
            insert_batch_seconds,
        }
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

pub static WORKER_METRICS: Lazy<WorkerMetrics> = Lazy::new(WorkerMetrics::new);
