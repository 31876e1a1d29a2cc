use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CycleError;

/// Mutual exclusion for one cycle kind.
///
/// `try_acquire` is a checked-and-set under the mutex; the returned permit
/// releases the flag on drop, so the flag clears even if the cycle panics and
/// the task unwinds. A second acquisition while the permit lives is rejected,
/// never queued.
#[derive(Clone)]
pub struct CycleGuard {
    name: &'static str,
    busy: Arc<Mutex<bool>>,
}

impl CycleGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: Arc::new(Mutex::new(false)),
        }
    }

    pub fn try_acquire(&self) -> Result<CyclePermit, CycleError> {
        let mut busy = self.busy.lock();
        if *busy {
            return Err(CycleError::AlreadyRunning(self.name));
        }
        *busy = true;
        Ok(CyclePermit {
            busy: self.busy.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug)]
pub struct CyclePermit {
    busy: Arc<Mutex<bool>>,
}

impl Drop for CyclePermit {
    fn drop(&mut self) {
        *self.busy.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_is_rejected() {
        let guard = CycleGuard::new("collection");
        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_busy());
        assert_eq!(
            guard.try_acquire().unwrap_err(),
            CycleError::AlreadyRunning("collection")
        );
        drop(permit);
        assert!(!guard.is_busy());
        guard.try_acquire().unwrap();
    }

    #[test]
    fn permit_releases_on_panic() {
        let guard = CycleGuard::new("upload");
        let inner = guard.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = inner.try_acquire().unwrap();
            panic!("cycle blew up");
        }));
        assert!(result.is_err());
        assert!(!guard.is_busy());
    }
}
