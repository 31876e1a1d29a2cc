//! Per-meter adaptive batch sizing for multi-property reads.
//!
//! Start optimistic (read everything at once), halve on timeout, and grow
//! back after a window of clean batches. State is process-local and resets on
//! restart.

use std::collections::HashMap;

use parking_lot::Mutex;

pub const MIN_BATCH: usize = 1;
pub const REDUCTION_FACTOR: f64 = 0.5;
pub const GROWTH_WINDOW: u32 = 10;

#[derive(Default)]
struct MeterBatchState {
    batch: usize,
    consecutive_successes: u32,
}

#[derive(Default)]
pub struct BatchSizeManager {
    inner: Mutex<HashMap<String, MeterBatchState>>,
}

impl BatchSizeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current batch size for a meter, clamped to `[MIN_BATCH, total]`.
    /// The first call for a meter returns `total`.
    pub fn get(&self, meter_id: &str, total_registers: usize) -> usize {
        let total = total_registers.max(MIN_BATCH);
        let mut inner = self.inner.lock();
        let state = inner
            .entry(meter_id.to_owned())
            .or_insert_with(|| MeterBatchState {
                batch: total,
                consecutive_successes: 0,
            });
        state.batch = state.batch.clamp(MIN_BATCH, total);
        state.batch
    }

    /// A batch of `batch_len` timed out: shrink and restart the growth
    /// window. Returns the new batch size.
    pub fn record_timeout(&self, meter_id: &str, batch_len: usize) -> usize {
        let mut inner = self.inner.lock();
        let state = inner.entry(meter_id.to_owned()).or_default();
        let shrunk = ((batch_len as f64) * REDUCTION_FACTOR).floor() as usize;
        state.batch = shrunk.max(MIN_BATCH);
        state.consecutive_successes = 0;
        state.batch
    }

    /// A batch completed cleanly. After [`GROWTH_WINDOW`] of these in a row
    /// the size doubles, capped at the meter's register count.
    pub fn record_success(&self, meter_id: &str, total_registers: usize) {
        let total = total_registers.max(MIN_BATCH);
        let mut inner = self.inner.lock();
        let state = inner.entry(meter_id.to_owned()).or_insert_with(|| MeterBatchState {
            batch: total,
            consecutive_successes: 0,
        });
        state.consecutive_successes += 1;
        if state.consecutive_successes >= GROWTH_WINDOW {
            let grown = ((state.batch as f64) / REDUCTION_FACTOR).floor() as usize;
            state.batch = grown.min(total);
            state.consecutive_successes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_reads_everything_at_once() {
        let bsm = BatchSizeManager::new();
        assert_eq!(bsm.get("m1", 20), 20);
        assert_eq!(bsm.get("m2", 3), 3);
    }

    #[test]
    fn shrinks_by_half_with_floor_at_min() {
        let bsm = BatchSizeManager::new();
        bsm.get("m1", 20);
        assert_eq!(bsm.record_timeout("m1", 20), 10);
        assert_eq!(bsm.record_timeout("m1", 10), 5);
        assert_eq!(bsm.record_timeout("m1", 2), 1);
        assert_eq!(bsm.record_timeout("m1", 1), 1);
        assert_eq!(bsm.get("m1", 20), 1);
    }

    #[test]
    fn grows_after_a_window_of_clean_batches() {
        let bsm = BatchSizeManager::new();
        bsm.get("m1", 20);
        bsm.record_timeout("m1", 20);
        assert_eq!(bsm.get("m1", 20), 10);

        for _ in 0..GROWTH_WINDOW - 1 {
            bsm.record_success("m1", 20);
        }
        assert_eq!(bsm.get("m1", 20), 10);
        bsm.record_success("m1", 20);
        assert_eq!(bsm.get("m1", 20), 20);
    }

    #[test]
    fn growth_is_capped_by_register_count() {
        let bsm = BatchSizeManager::new();
        bsm.get("m1", 8);
        for _ in 0..GROWTH_WINDOW {
            bsm.record_success("m1", 8);
        }
        assert_eq!(bsm.get("m1", 8), 8);
    }

    #[test]
    fn timeout_resets_the_growth_window() {
        let bsm = BatchSizeManager::new();
        bsm.get("m1", 16);
        bsm.record_timeout("m1", 16); // 8
        for _ in 0..GROWTH_WINDOW - 1 {
            bsm.record_success("m1", 16);
        }
        bsm.record_timeout("m1", 8); // 4, window restarts
        for _ in 0..GROWTH_WINDOW - 1 {
            bsm.record_success("m1", 16);
        }
        assert_eq!(bsm.get("m1", 16), 4);
    }

    #[test]
    fn meters_are_independent() {
        let bsm = BatchSizeManager::new();
        bsm.get("m1", 20);
        bsm.get("m2", 20);
        bsm.record_timeout("m1", 20);
        assert_eq!(bsm.get("m1", 20), 10);
        assert_eq!(bsm.get("m2", 20), 20);
    }
}
