use crate::error::{ErrorKind, Result};
use crate::{CacheableIds, Fetched, RemoteTransfer};
use async_trait::async_trait;
use exn::ResultExt;
use stash_storage::{BlobRecord, FileId, Slot, StoreHandle};

/// Any [`ByteStore`](stash_storage::ByteStore) used as the remote.
///
/// A tombstoned slot is a remote deletion; an absent slot is "not found".
/// Useful for a shared directory (or a second SQLite file) acting as the
/// replica, and for tests.
#[derive(Clone)]
pub struct StoreRemote {
    store: StoreHandle,
}
impl StoreRemote {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Record a remote deletion of `id`.
    pub async fn delete(&self, id: &FileId) -> Result<()> {
        self.store
            .set(id, Slot::Tombstone)
            .await
            .or_raise(|| ErrorKind::Transfer(format!("tombstone {id} on {}", self.store.name())))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteTransfer for StoreRemote {
    fn name(&self) -> &str {
        self.store.name()
    }

    async fn upload(&self, id: &FileId, blob: &BlobRecord) -> Result<()> {
        self.store
            .set(id, Slot::Present(blob.clone()))
            .await
            .or_raise(|| ErrorKind::Transfer(format!("upload {id} to {}", self.store.name())))?;
        tracing::debug!(remote = %self.store.name(), id = %id, bytes = blob.len(), "Uploaded blob");
        Ok(())
    }

    async fn download(&self, id: &FileId) -> Result<Fetched> {
        let slot = self
            .store
            .get(id)
            .await
            .or_raise(|| ErrorKind::Transfer(format!("download {id} from {}", self.store.name())))?;
        Ok(match slot {
            Some(Slot::Present(blob)) => Fetched::Present(blob),
            Some(Slot::Tombstone) => Fetched::Tombstone,
            None => Fetched::NotFound,
        })
    }
}

#[async_trait]
impl CacheableIds for StoreRemote {
    async fn cacheable_ids(&self, max: usize) -> Result<Option<Vec<FileId>>> {
        let listing_error = || ErrorKind::Transfer(format!("list {}", self.store.name()));
        let ids = self.store.list_ids().await.or_raise(listing_error)?;
        let mut cacheable = Vec::with_capacity(max.min(ids.len()));
        for id in ids {
            if cacheable.len() >= max {
                break;
            }
            // Deleted content is not worth caching.
            if let Some(Slot::Present(_)) = self.store.get(&id).await.or_raise(listing_error)? {
                cacheable.push(id);
            }
        }
        Ok(Some(cacheable))
    }
}
