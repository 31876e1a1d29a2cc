use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::CatalogStore;
use crate::error::DbError;
use crate::model::{Meter, MeterKey, RegisterDef};

use super::{RegisterCache, RegisterSnapshot};

/// A meter element with its register list already resolved.
pub struct MeterEntry {
    pub meter: Meter,
    pub registers: Vec<Arc<RegisterDef>>,
}

#[derive(Default)]
pub struct MeterSnapshot {
    by_key: HashMap<MeterKey, Arc<MeterEntry>>,
    active: Vec<Arc<MeterEntry>>,
}

impl MeterSnapshot {
    /// Join meters with the register snapshot taken at the same reload.
    pub fn build(meters: Vec<Meter>, registers: &RegisterSnapshot) -> Self {
        let mut by_key = HashMap::with_capacity(meters.len());
        let mut active = Vec::new();
        for meter in meters {
            let entry = Arc::new(MeterEntry {
                registers: registers.registers_for(&meter.device_model_id).to_vec(),
                meter,
            });
            if entry.meter.active {
                active.push(entry.clone());
            }
            by_key.insert(entry.meter.key(), entry);
        }
        active.sort_by(|a, b| a.meter.key().cmp(&b.meter.key()));
        Self { by_key, active }
    }

    pub fn get(&self, key: &MeterKey) -> Option<&Arc<MeterEntry>> {
        self.by_key.get(key)
    }

    /// The active subset, the collection cycle's working set.
    pub fn active(&self) -> &[Arc<MeterEntry>] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

pub struct MeterCache {
    current: RwLock<Arc<MeterSnapshot>>,
}

impl MeterCache {
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(Arc::new(MeterSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<MeterSnapshot> {
        self.current.read().clone()
    }

    /// Rebuild from the local database, resolving registers against the
    /// register cache's current snapshot. Atomic swap; on error the previous
    /// snapshot stays current.
    pub async fn reload(
        &self,
        store: &dyn CatalogStore,
        registers: &RegisterCache,
    ) -> Result<(), DbError> {
        let meters = store.load_meters().await?;
        let snapshot = Arc::new(MeterSnapshot::build(meters, &registers.snapshot()));
        tracing::debug!(
            meters = snapshot.len(),
            active = snapshot.active().len(),
            "meter cache reloaded"
        );
        *self.current.write() = snapshot;
        Ok(())
    }
}
