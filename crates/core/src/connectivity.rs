//! Reachability of the remote Client System.
//!
//! One task probes `GET /health` on a timer and owns every transition of the
//! process-wide [`ConnectivityStatus`]. Consumers watch snapshots; the upload
//! engine additionally receives an event on each transition into
//! `Connected` so it can drain the outbox immediately after an outage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::model::{ConnState, ConnectivityStatus};
use crate::remote::RemoteClient;
use crate::worker_metrics::WORKER_METRICS;

/// Consecutive successes before `Connected`.
pub const REQUIRED_SUCCESSES: u32 = 2;
/// Consecutive failures before `Disconnected`.
pub const REQUIRED_FAILURES: u32 = 3;

/// Fold one probe outcome into the status. Returns the new state when the
/// probe caused a transition.
fn transition(status: &mut ConnectivityStatus, ok: bool, now: DateTime<Utc>) -> Option<ConnState> {
    status.last_check_time = Some(now);
    if ok {
        status.consecutive_successes += 1;
        status.consecutive_failures = 0;
        status.last_successful_connection = Some(now);
    } else {
        status.consecutive_failures += 1;
        status.consecutive_successes = 0;
        status.last_failed_connection = Some(now);
    }

    let next = if ok && status.consecutive_successes >= REQUIRED_SUCCESSES {
        ConnState::Connected
    } else if !ok && status.consecutive_failures >= REQUIRED_FAILURES {
        ConnState::Disconnected
    } else {
        return None;
    };
    if next == status.state {
        return None;
    }
    status.state = next;
    status.is_connected = next == ConnState::Connected;
    Some(next)
}

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteClient>,
    interval: Duration,
    status_tx: watch::Sender<ConnectivityStatus>,
    edge_tx: mpsc::Sender<()>,
}

impl ConnectivityMonitor {
    /// Returns the monitor plus the read side of its status and the
    /// connected-edge channel for the upload engine.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        interval: Duration,
    ) -> (Self, watch::Receiver<ConnectivityStatus>, mpsc::Receiver<()>) {
        let (status_tx, status_rx) = watch::channel(ConnectivityStatus::default());
        let (edge_tx, edge_rx) = mpsc::channel(1);
        (
            Self {
                remote,
                interval,
                status_tx,
                edge_tx,
            },
            status_rx,
            edge_rx,
        )
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.probe().await,
            }
        }
        tracing::debug!("connectivity monitor stopped");
    }

    async fn probe(&self) {
        let ok = match self.remote.health().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "health probe failed");
                false
            }
        };

        let mut edge = None;
        self.status_tx.send_modify(|status| {
            edge = transition(status, ok, Utc::now());
        });

        match edge {
            Some(ConnState::Connected) => {
                tracing::info!("remote connection established");
                WORKER_METRICS.connectivity_connected.set(1);
                // A full trigger channel already guarantees a wakeup.
                let _ = self.edge_tx.try_send(());
            }
            Some(ConnState::Disconnected) => {
                tracing::warn!("remote connection lost");
                WORKER_METRICS.connectivity_connected.set(0);
            }
            _ => {}
        }
    }
}
