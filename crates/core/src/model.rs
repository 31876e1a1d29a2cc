//! Domain entities mirrored from the Client System, plus the result types the
//! engines report.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identity of one measurable element of a physical meter.
///
/// A physical meter may carry multiple elements; everything downstream of the
/// config mirror is keyed by this composite, never by `meter_id` alone.
pub type MeterKey = (String, i32);

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One configured register of a device model, resolvable to a BACnet read.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterDef {
    pub id: String,
    pub device_model_id: String,
    pub register_number: i32,
    pub field_name: String,
    pub unit: String,
    pub data_type: String,
    pub object_type: u16,
    pub instance: u32,
    pub property: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Meter {
    pub meter_id: String,
    pub element_id: i32,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub active: bool,
    pub device_model_id: String,
    pub tenant_id: String,
    pub location_id: Option<String>,
}

impl Meter {
    pub fn key(&self) -> MeterKey {
        (self.meter_id.clone(), self.element_id)
    }
}

/// A reading produced by a collection cycle, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReading {
    pub meter_id: String,
    pub element_id: i32,
    pub timestamp: DateTime<Utc>,
    pub data_point: String,
    pub value: f64,
    pub unit: String,
    pub register_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InFlight => "in_flight",
            SyncStatus::Done => "done",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "in_flight" => Some(SyncStatus::InFlight),
            "done" => Some(SyncStatus::Done),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// A persisted outbox row awaiting (or done with) upload.
#[derive(Debug, Clone)]
pub struct MeterReading {
    pub id: i64,
    pub meter_id: String,
    pub element_id: i32,
    pub timestamp: DateTime<Utc>,
    pub data_point: String,
    pub value: f64,
    pub unit: String,
    pub is_synchronized: bool,
    pub sync_status: SyncStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOperation {
    Read,
    Persist,
    Upload,
    Sync,
}

/// One diagnostic record, kept in the per-engine ring buffers and logged.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionError {
    pub meter_id: Option<String>,
    pub register_id: Option<String>,
    pub operation: ErrorOperation,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl CollectionError {
    pub fn new(operation: ErrorOperation, error: impl Into<String>) -> Self {
        Self {
            meter_id: None,
            register_id: None,
            operation,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_meter(mut self, meter_id: impl Into<String>) -> Self {
        self.meter_id = Some(meter_id.into());
        self
    }

    pub fn with_register(mut self, register_id: impl Into<String>) -> Self {
        self.register_id = Some(register_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleResult {
    pub total_meters: usize,
    pub success_meters: usize,
    pub readings_produced: usize,
    pub errors: Vec<CollectionError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistResult {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub uploaded: usize,
    pub failed: usize,
    pub remaining: i64,
}

/// Per-table outcome of one remote-to-local sync phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    pub inserted: usize,
    pub updated: usize,
    pub deactivated: usize,
}

impl PhaseResult {
    /// True when the phase changed anything, which is what decides whether
    /// the corresponding cache reloads.
    pub fn modified(&self) -> bool {
        self.inserted + self.updated + self.deactivated > 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncResult {
    pub tenant: PhaseResult,
    pub registers: PhaseResult,
    pub meters: PhaseResult,
    pub device_registers: PhaseResult,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Unknown,
    Connected,
    Disconnected,
}

/// Process-wide reachability snapshot. Only the connectivity monitor
/// transitions it; everyone else observes it read-only.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityStatus {
    pub state: ConnState,
    pub is_connected: bool,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub last_failed_connection: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self {
            state: ConnState::Unknown,
            is_connected: false,
            last_check_time: None,
            last_successful_connection: None,
            last_failed_connection: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}
