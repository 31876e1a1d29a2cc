//! Shared fakes and fixtures for unit tests. Compiled only under `cfg(test)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::bacnet::object_type::ANALOG_INPUT;
use crate::bacnet::property_id::PRESENT_VALUE;
use crate::db::{CatalogStore, ReadingStore};
use crate::error::DbError;
use crate::model::{Meter, MeterReading, PendingReading, PhaseResult, RegisterDef, SyncStatus, Tenant};
use crate::remote::{RemoteDeviceRegister, RemoteMeter, RemoteRegister, RemoteTenant};

pub fn register(id: &str, device_model_id: &str, number: i32, field: &str) -> RegisterDef {
    RegisterDef {
        id: id.to_owned(),
        device_model_id: device_model_id.to_owned(),
        register_number: number,
        field_name: field.to_owned(),
        unit: field.to_owned(),
        data_type: "float".to_owned(),
        object_type: ANALOG_INPUT,
        instance: number as u32,
        property: PRESENT_VALUE,
        active: true,
    }
}

pub fn meter(meter_id: &str, element_id: i32, device_model_id: &str) -> Meter {
    Meter {
        meter_id: meter_id.to_owned(),
        element_id,
        name: format!("{meter_id}/{element_id}"),
        ip: "127.0.0.1".to_owned(),
        port: 47808,
        active: true,
        device_model_id: device_model_id.to_owned(),
        tenant_id: "t-1".to_owned(),
        location_id: None,
    }
}

pub fn pending(meter_id: &str, element_id: i32, data_point: &str, value: f64) -> PendingReading {
    PendingReading {
        meter_id: meter_id.to_owned(),
        element_id,
        timestamp: Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap(),
        data_point: data_point.to_owned(),
        value,
        unit: data_point.to_owned(),
        register_id: format!("r-{data_point}"),
    }
}

/// Catalog store serving fixed rows. Upserts are accepted and ignored, so a
/// sync against this store always reports zero modifications.
#[derive(Default)]
pub struct FixedStore {
    pub registers: Vec<RegisterDef>,
    pub meters: Vec<Meter>,
    pub tenant: Option<Tenant>,
}

impl FixedStore {
    pub fn with_registers(registers: Vec<RegisterDef>) -> Self {
        Self {
            registers,
            ..Default::default()
        }
    }

    pub fn with_meters(registers: Vec<RegisterDef>, meters: Vec<Meter>) -> Self {
        Self {
            registers,
            meters,
            ..Default::default()
        }
    }
}

#[async_trait]
impl CatalogStore for FixedStore {
    async fn upsert_tenant(&self, _: &RemoteTenant) -> Result<PhaseResult, DbError> {
        Ok(PhaseResult::default())
    }
    async fn upsert_registers(&self, _: &[RemoteRegister]) -> Result<PhaseResult, DbError> {
        Ok(PhaseResult::default())
    }
    async fn upsert_meters(&self, _: &[RemoteMeter]) -> Result<PhaseResult, DbError> {
        Ok(PhaseResult::default())
    }
    async fn upsert_device_registers(
        &self,
        _: &[RemoteDeviceRegister],
    ) -> Result<PhaseResult, DbError> {
        Ok(PhaseResult::default())
    }
    async fn tenant(&self) -> Result<Option<Tenant>, DbError> {
        Ok(self.tenant.clone())
    }
    async fn load_registers(&self) -> Result<Vec<RegisterDef>, DbError> {
        Ok(self.registers.clone())
    }
    async fn load_meters(&self) -> Result<Vec<Meter>, DbError> {
        Ok(self.meters.clone())
    }
}

/// Catalog store whose loads always fail, for reload-failure paths.
pub struct FailingStore;

#[async_trait]
impl CatalogStore for FailingStore {
    async fn upsert_tenant(&self, _: &RemoteTenant) -> Result<PhaseResult, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn upsert_registers(&self, _: &[RemoteRegister]) -> Result<PhaseResult, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn upsert_meters(&self, _: &[RemoteMeter]) -> Result<PhaseResult, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn upsert_device_registers(
        &self,
        _: &[RemoteDeviceRegister],
    ) -> Result<PhaseResult, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn tenant(&self) -> Result<Option<Tenant>, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn load_registers(&self) -> Result<Vec<RegisterDef>, DbError> {
        Err(DbError::Decode("down".into()))
    }
    async fn load_meters(&self) -> Result<Vec<Meter>, DbError> {
        Err(DbError::Decode("down".into()))
    }
}

/// In-memory outbox with the same dedup and claim semantics as the Postgres
/// store, plus fault injection for retry tests.
#[derive(Default)]
pub struct MemReadingStore {
    inner: Mutex<MemReadingInner>,
}

#[derive(Default)]
struct MemReadingInner {
    rows: Vec<MeterReading>,
    next_id: i64,
    fail_inserts: u32,
}

impl MemReadingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` insert transactions fail.
    pub fn fail_next_inserts(&self, n: u32) {
        self.inner.lock().fail_inserts = n;
    }

    pub fn rows(&self) -> Vec<MeterReading> {
        self.inner.lock().rows.clone()
    }

    pub fn row(&self, id: i64) -> MeterReading {
        self.inner
            .lock()
            .rows
            .iter()
            .find(|r| r.id == id)
            .expect("row exists")
            .clone()
    }
}

#[async_trait]
impl ReadingStore for MemReadingStore {
    async fn insert_batch(&self, readings: &[PendingReading]) -> Result<u64, DbError> {
        let mut inner = self.inner.lock();
        if inner.fail_inserts > 0 {
            inner.fail_inserts -= 1;
            return Err(DbError::Decode("injected insert failure".into()));
        }
        let mut inserted = 0;
        for reading in readings {
            let exists = inner.rows.iter().any(|row| {
                row.meter_id == reading.meter_id
                    && row.element_id == reading.element_id
                    && row.timestamp == reading.timestamp
                    && row.data_point == reading.data_point
            });
            if exists {
                continue;
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.push(MeterReading {
                id,
                meter_id: reading.meter_id.clone(),
                element_id: reading.element_id,
                timestamp: reading.timestamp,
                data_point: reading.data_point.clone(),
                value: reading.value,
                unit: reading.unit.clone(),
                is_synchronized: false,
                sync_status: SyncStatus::Pending,
                retry_count: 0,
                last_error: None,
                created_at: Utc::now(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_pending(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<MeterReading>, DbError> {
        let mut inner = self.inner.lock();
        let mut claimable: Vec<usize> = inner
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.sync_status == SyncStatus::Pending && row.retry_count < max_retries
            })
            .map(|(i, _)| i)
            .collect();
        claimable.sort_by_key(|&i| (inner.rows[i].created_at, inner.rows[i].id));
        claimable.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(claimable.len());
        for i in claimable {
            inner.rows[i].sync_status = SyncStatus::InFlight;
            claimed.push(inner.rows[i].clone());
        }
        Ok(claimed)
    }

    async fn mark_done(&self, ids: &[i64]) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        for row in inner.rows.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.sync_status = SyncStatus::Done;
            row.is_synchronized = true;
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, ids: &[i64], error: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        for row in inner.rows.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.sync_status = SyncStatus::Failed;
            row.retry_count += 1;
            row.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn release_to_pending(&self, ids: &[i64], error: &str) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        for row in inner.rows.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.sync_status = SyncStatus::Pending;
            row.retry_count += 1;
            row.last_error = Some(error.to_owned());
        }
        Ok(())
    }

    async fn release_claimed(&self, ids: &[i64]) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        for row in inner.rows.iter_mut().filter(|r| ids.contains(&r.id)) {
            row.sync_status = SyncStatus::Pending;
        }
        Ok(())
    }

    async fn count_pending(&self, max_retries: i32) -> Result<i64, DbError> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .iter()
            .filter(|r| r.sync_status == SyncStatus::Pending && r.retry_count < max_retries)
            .count() as i64)
    }

    async fn count_in_flight(&self) -> Result<i64, DbError> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .iter()
            .filter(|r| r.sync_status == SyncStatus::InFlight)
            .count() as i64)
    }
}

/// Connectivity watch fixed at `Connected`.
pub fn connected_watch() -> tokio::sync::watch::Receiver<crate::model::ConnectivityStatus> {
    fixed_watch(true)
}

/// Connectivity watch fixed at `Disconnected`.
pub fn disconnected_watch() -> tokio::sync::watch::Receiver<crate::model::ConnectivityStatus> {
    fixed_watch(false)
}

fn fixed_watch(connected: bool) -> tokio::sync::watch::Receiver<crate::model::ConnectivityStatus> {
    let status = crate::model::ConnectivityStatus {
        state: if connected {
            crate::model::ConnState::Connected
        } else {
            crate::model::ConnState::Disconnected
        },
        is_connected: connected,
        ..Default::default()
    };
    let (tx, rx) = tokio::sync::watch::channel(status);
    // The receiver keeps serving the last value; the sender can leak for the
    // lifetime of the test.
    std::mem::forget(tx);
    rx
}

/// Remote API fake. Uploads consume a script of outcomes, then fall back to
/// the configured default (`Ok` unless set otherwise).
#[derive(Default)]
pub struct MockRemote {
    upload_script: Mutex<std::collections::VecDeque<Result<(), crate::error::RemoteError>>>,
    default_upload_error: Mutex<Option<crate::error::RemoteError>>,
    /// `(rows, idempotency key)` per bulk POST.
    pub uploads: Mutex<Vec<(usize, String)>>,
}

impl MockRemote {
    pub fn script_uploads(
        &self,
        outcomes: impl IntoIterator<Item = Result<(), crate::error::RemoteError>>,
    ) {
        self.upload_script.lock().extend(outcomes);
    }

    pub fn set_default_upload_error(&self, error: Option<crate::error::RemoteError>) {
        *self.default_upload_error.lock() = error;
    }
}

#[async_trait]
impl crate::remote::RemoteClient for MockRemote {
    async fn health(&self) -> Result<(), crate::error::RemoteError> {
        Ok(())
    }

    async fn fetch_tenant(&self) -> Result<RemoteTenant, crate::error::RemoteError> {
        Ok(RemoteTenant {
            id: "t-1".to_owned(),
            name: "Test Tenant".to_owned(),
            street: None,
            city: None,
            postal_code: None,
            country: None,
            active: true,
        })
    }

    async fn fetch_registers(&self) -> Result<Vec<RemoteRegister>, crate::error::RemoteError> {
        Ok(Vec::new())
    }

    async fn fetch_meters(&self) -> Result<Vec<RemoteMeter>, crate::error::RemoteError> {
        Ok(Vec::new())
    }

    async fn fetch_device_registers(
        &self,
    ) -> Result<Vec<RemoteDeviceRegister>, crate::error::RemoteError> {
        Ok(Vec::new())
    }

    async fn upload_readings(
        &self,
        readings: &[crate::remote::ReadingUpload],
        idempotency_key: &str,
    ) -> Result<(), crate::error::RemoteError> {
        self.uploads
            .lock()
            .push((readings.len(), idempotency_key.to_owned()));
        if let Some(outcome) = self.upload_script.lock().pop_front() {
            return outcome;
        }
        match self.default_upload_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A meter whose registers live in a map: `(object instance) -> value`.
/// Simulates batch-size-dependent timeouts for the shrink path.
pub struct ScriptedBacnet {
    pub values: HashMap<u32, f64>,
    /// Batches strictly larger than this time out.
    pub max_batch: usize,
    /// When set, every request fails as if the device were gone.
    pub unreachable: bool,
    pub calls: Mutex<Vec<usize>>,
}

impl ScriptedBacnet {
    pub fn serving(values: impl IntoIterator<Item = (u32, f64)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            max_batch: usize::MAX,
            unreachable: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::serving(std::iter::empty())
    }
}

#[async_trait]
impl crate::bacnet::BacnetClient for ScriptedBacnet {
    async fn read_property(
        &self,
        _target: std::net::SocketAddr,
        prop: crate::bacnet::PropertyRef,
        timeout: std::time::Duration,
    ) -> Result<f64, crate::error::BacnetError> {
        self.calls.lock().push(1);
        if self.unreachable {
            return Err(crate::error::BacnetError::Unreachable("scripted".into()));
        }
        self.values
            .get(&prop.instance)
            .copied()
            .ok_or(crate::error::BacnetError::Timeout(timeout))
    }

    async fn read_property_multiple(
        &self,
        _target: std::net::SocketAddr,
        props: &[crate::bacnet::PropertyRef],
        timeout: std::time::Duration,
    ) -> Result<Vec<Result<f64, crate::error::BacnetError>>, crate::error::BacnetError> {
        self.calls.lock().push(props.len());
        if self.unreachable {
            return Err(crate::error::BacnetError::Unreachable("scripted".into()));
        }
        if props.len() > self.max_batch {
            return Err(crate::error::BacnetError::Timeout(timeout));
        }
        Ok(props
            .iter()
            .map(|p| {
                self.values
                    .get(&p.instance)
                    .copied()
                    .ok_or(crate::error::BacnetError::ValueParse("no such register".into()))
            })
            .collect())
    }
}
