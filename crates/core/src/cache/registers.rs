use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::CatalogStore;
use crate::error::DbError;
use crate::model::RegisterDef;

/// Registers per device model, active only, ordered by register number.
#[derive(Default)]
pub struct RegisterSnapshot {
    by_model: HashMap<String, Vec<Arc<RegisterDef>>>,
    total: usize,
}

impl RegisterSnapshot {
    pub fn build(defs: Vec<RegisterDef>) -> Self {
        let mut by_model: HashMap<String, Vec<Arc<RegisterDef>>> = HashMap::new();
        for def in defs.into_iter().filter(|d| d.active) {
            by_model
                .entry(def.device_model_id.clone())
                .or_default()
                .push(Arc::new(def));
        }
        for registers in by_model.values_mut() {
            registers.sort_by_key(|r| r.register_number);
        }
        let total = by_model.values().map(Vec::len).sum();
        Self { by_model, total }
    }

    pub fn registers_for(&self, device_model_id: &str) -> &[Arc<RegisterDef>] {
        self.by_model
            .get(device_model_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

pub struct RegisterCache {
    current: RwLock<Arc<RegisterSnapshot>>,
}

impl RegisterCache {
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegisterSnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RegisterSnapshot> {
        self.current.read().clone()
    }

    /// Rebuild from the local database and swap atomically. On error the
    /// previous snapshot stays current.
    pub async fn reload(&self, store: &dyn CatalogStore) -> Result<(), DbError> {
        let defs = store.load_registers().await?;
        let snapshot = Arc::new(RegisterSnapshot::build(defs));
        tracing::debug!(registers = snapshot.len(), "register cache reloaded");
        *self.current.write() = snapshot;
        Ok(())
    }
}
