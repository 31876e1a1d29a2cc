use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::model::CollectionError;

/// How many errors each engine keeps for the local API.
pub const ERROR_RING_CAPACITY: usize = 100;

/// Bounded ring of recent errors, newest last.
#[derive(Default)]
pub struct ErrorRing {
    inner: Mutex<VecDeque<CollectionError>>,
}

impl ErrorRing {
    pub fn push(&self, err: CollectionError) {
        let mut ring = self.inner.lock();
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(err);
    }

    pub fn extend(&self, errs: impl IntoIterator<Item = CollectionError>) {
        for err in errs {
            self.push(err);
        }
    }

    pub fn snapshot(&self) -> Vec<CollectionError> {
        self.inner.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The per-engine rings surfaced by `GET /status`. Each engine holds a clone
/// of its own ring; this struct is the read side.
#[derive(Default)]
pub struct Diagnostics {
    pub collection: std::sync::Arc<ErrorRing>,
    pub outbox: std::sync::Arc<ErrorRing>,
    pub upload: std::sync::Arc<ErrorRing>,
    pub sync: std::sync::Arc<ErrorRing>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorOperation;

    #[test]
    fn ring_is_bounded_and_fifo() {
        let ring = ErrorRing::default();
        for i in 0..(ERROR_RING_CAPACITY + 7) {
            ring.push(CollectionError::new(ErrorOperation::Read, format!("e{i}")));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), ERROR_RING_CAPACITY);
        assert_eq!(snap.first().unwrap().error, "e7");
        assert_eq!(snap.last().unwrap().error, format!("e{}", ERROR_RING_CAPACITY + 6));
    }
}
