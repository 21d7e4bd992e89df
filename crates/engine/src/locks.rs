use stash_storage::FileId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per id, so that the upload pass, the refresh pass and the
/// live fetcher never write the same id at the same time, while different
/// ids proceed in parallel.
#[derive(Default)]
pub(crate) struct IdLocks {
    locks: Mutex<HashMap<FileId, Arc<AsyncMutex<()>>>>,
}
impl IdLocks {
    pub(crate) async fn lock(&self, id: &FileId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
