use crate::registry::ServerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per instance id.
///
/// Calls on the same id queue up behind each other; calls on different ids
/// never contend. The guard releases on every exit path, including `?`.
#[derive(Debug, Default)]
pub(crate) struct InstanceLocks {
    locks: Mutex<HashMap<ServerId, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self, id: &ServerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock of a destroyed instance once nobody else waits on it.
    pub(crate) fn forget(&self, id: &ServerId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(id) {
            // The map and the caller's guard hold the only references.
            if Arc::strong_count(lock) <= 2 {
                locks.remove(id);
            }
        }
    }
}
