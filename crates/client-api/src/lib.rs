//! The agent's local HTTP surface: status, manual cycle triggers, tenant
//! info, and metrics for a UI running next to the agent.
//!
//! Route handlers are generic over [`AgentCtx`]; the standalone binary plugs
//! the supervisor in, tests plug in a fake.

pub mod routes;

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use metersync::error::DbError;
use metersync::model::{ConnectivityStatus, Tenant};
use metersync::supervisor::{StatusReport, Supervisor, TriggerError};
use metersync::worker_metrics::WORKER_METRICS;

#[async_trait]
pub trait AgentCtx: Clone + Send + Sync + 'static {
    /// Kick off a collection cycle in the background.
    fn trigger_collection(&self) -> Result<(), TriggerError>;

    /// Kick off an upload cycle in the background.
    fn trigger_upload(&self) -> Result<(), TriggerError>;

    /// Kick off a config sync in the background.
    fn trigger_sync(&self) -> Result<(), TriggerError>;

    fn status(&self) -> StatusReport;

    fn connectivity(&self) -> ConnectivityStatus;

    async fn tenant(&self) -> Result<Option<Tenant>, DbError>;

    async fn db_ok(&self) -> bool;

    fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily>;
}

#[async_trait]
impl AgentCtx for Arc<Supervisor> {
    fn trigger_collection(&self) -> Result<(), TriggerError> {
        Supervisor::trigger_collection(self)
    }

    fn trigger_upload(&self) -> Result<(), TriggerError> {
        Supervisor::trigger_upload(self)
    }

    fn trigger_sync(&self) -> Result<(), TriggerError> {
        Supervisor::trigger_sync(self)
    }

    fn status(&self) -> StatusReport {
        self.status_snapshot()
    }

    fn connectivity(&self) -> ConnectivityStatus {
        Supervisor::connectivity(self)
    }

    async fn tenant(&self) -> Result<Option<Tenant>, DbError> {
        Supervisor::tenant(self).await
    }

    async fn db_ok(&self) -> bool {
        Supervisor::db_ok(self).await
    }

    fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        WORKER_METRICS.gather()
    }
}

pub fn log_and_500(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!(error = %e, "internal error");
    StatusCode::INTERNAL_SERVER_ERROR
}
