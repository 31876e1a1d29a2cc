//! Remote-to-local configuration sync.
//!
//! Four phases, strictly serial, each in its own transaction: tenant,
//! register definitions, meters, device-register associations. A phase
//! failure stops the run; earlier phases stay committed. Rows the remote no
//! longer lists are deactivated, never deleted. After a successful run, only
//! the caches whose tables actually changed are reloaded.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::{MeterCache, RegisterCache};
use crate::db::CatalogStore;
use crate::diagnostics::ErrorRing;
use crate::error::{CycleError, RemoteError};
use crate::guard::{CycleGuard, CyclePermit};
use crate::model::{CollectionError, ErrorOperation, SyncResult};
use crate::remote::RemoteClient;
use crate::worker_metrics::WORKER_METRICS;

pub struct SyncAgent {
    remote: Arc<dyn RemoteClient>,
    catalog: Arc<dyn CatalogStore>,
    registers: Arc<RegisterCache>,
    meters: Arc<MeterCache>,
    guard: CycleGuard,
    errors: Arc<ErrorRing>,
}

impl SyncAgent {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        catalog: Arc<dyn CatalogStore>,
        registers: Arc<RegisterCache>,
        meters: Arc<MeterCache>,
        errors: Arc<ErrorRing>,
    ) -> Self {
        Self {
            remote,
            catalog,
            registers,
            meters,
            guard: CycleGuard::new("sync"),
            errors,
        }
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    pub fn try_begin(&self) -> Result<CyclePermit, CycleError> {
        self.guard.try_acquire()
    }

    pub async fn perform_sync(&self, cancel: CancellationToken) -> Result<SyncResult, CycleError> {
        let permit = self.try_begin()?;
        Ok(self.run(permit, cancel).await)
    }

    pub async fn run(&self, permit: CyclePermit, cancel: CancellationToken) -> SyncResult {
        let _permit = permit;
        let timer = WORKER_METRICS
            .cycle_seconds
            .with_label_values(&["sync"])
            .start_timer();
        let mut result = SyncResult::default();

        // Phase 1: the single tenant row.
        let tenant = match self.remote.fetch_tenant().await {
            Ok(tenant) => tenant,
            Err(e) => return self.fail(result, "tenant", e.to_string()),
        };
        match self.catalog.upsert_tenant(&tenant).await {
            Ok(phase) => result.tenant = phase,
            Err(e) => return self.fail(result, "tenant", e.to_string()),
        }

        // Phase 2: register definitions (with any embedded device models).
        if cancel.is_cancelled() {
            return self.canceled(result);
        }
        let registers = match self.remote.fetch_registers().await {
            Ok(registers) => registers,
            Err(e) => return self.fail(result, "registers", e.to_string()),
        };
        match self.catalog.upsert_registers(&registers).await {
            Ok(phase) => result.registers = phase,
            Err(e) => return self.fail(result, "registers", e.to_string()),
        }

        // Phase 3: meters, keyed by (meter_id, meter_element_id).
        if cancel.is_cancelled() {
            return self.canceled(result);
        }
        let meters = match self.remote.fetch_meters().await {
            Ok(meters) => meters,
            Err(e) => return self.fail(result, "meters", e.to_string()),
        };
        match self.catalog.upsert_meters(&meters).await {
            Ok(phase) => result.meters = phase,
            Err(e) => return self.fail(result, "meters", e.to_string()),
        }

        // Phase 4: device-register associations. Remotes without the join
        // table answer 404; that is an empty phase, not a failure.
        if cancel.is_cancelled() {
            return self.canceled(result);
        }
        let associations = match self.remote.fetch_device_registers().await {
            Ok(associations) => associations,
            Err(RemoteError::Status { status: 404, .. }) => Vec::new(),
            Err(e) => return self.fail(result, "device registers", e.to_string()),
        };
        match self.catalog.upsert_device_registers(&associations).await {
            Ok(phase) => result.device_registers = phase,
            Err(e) => return self.fail(result, "device registers", e.to_string()),
        }

        result.success = true;

        // Phase 5: reload only the affected caches. The meter cache joins
        // register lists at load time, so a register change invalidates it
        // too. Reload failures are warnings; the sync itself succeeded.
        let registers_changed = result.registers.modified() || result.device_registers.modified();
        let meters_changed = registers_changed || result.meters.modified();
        if registers_changed {
            if let Err(e) = self.registers.reload(&*self.catalog).await {
                self.warn_reload("register", e.to_string());
            }
        }
        if meters_changed {
            if let Err(e) = self.meters.reload(&*self.catalog, &self.registers).await {
                self.warn_reload("meter", e.to_string());
            }
        }

        timer.observe_duration();
        tracing::info!(
            tenant = ?result.tenant,
            registers = ?result.registers,
            meters = ?result.meters,
            device_registers = ?result.device_registers,
            "sync finished"
        );
        result
    }

    fn fail(&self, result: SyncResult, phase: &str, error: String) -> SyncResult {
        tracing::error!(phase, error = %error, "sync phase failed, later phases skipped");
        self.errors.push(CollectionError::new(
            ErrorOperation::Sync,
            format!("{phase}: {error}"),
        ));
        result
    }

    fn canceled(&self, result: SyncResult) -> SyncResult {
        tracing::debug!("sync canceled between phases");
        result
    }

    fn warn_reload(&self, cache: &str, error: String) {
        tracing::warn!(cache, error = %error, "cache reload failed, keeping previous snapshot");
        self.errors.push(CollectionError::new(
            ErrorOperation::Sync,
            format!("{cache} cache reload: {error}"),
        ));
    }
}
