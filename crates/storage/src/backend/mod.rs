//! Byte store trait and implementations.
//!
//! This module defines the [`ByteStore`] trait, the persistence seam of the
//! synchronization engine. The engine keeps two independent stores: one for
//! locally authored content awaiting upload and one size-bounded read cache.
//! Both are plain `ByteStore`s; what differs is how the engine treats them.

mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::local::LocalStore;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockStore;
use crate::error::Result;
use crate::models::{FileId, Slot};
use async_trait::async_trait;

/// Unified interface for byte stores.
///
/// All operations are asynchronous and operate on `&self`; implementations
/// are expected to serialize concurrent writes to the same id themselves.
///
/// # Enumeration order
///
/// [`list_ids()`](Self::list_ids) must enumerate ids **most recently written
/// first**. Eviction relies on this: it takes the *last* unprotected id,
/// which is then the entry written longest ago.
///
/// # Examples
///
/// ```no_run
/// use stash_storage::{BlobRecord, ByteStore, FileId, Slot, error::Result};
///
/// async fn copy_over(from: &dyn ByteStore, to: &dyn ByteStore, id: &FileId) -> Result<bool> {
///     match from.get(id).await? {
///         Some(Slot::Present(blob)) => {
///             to.set(id, Slot::Present(blob)).await?;
///             Ok(true)
///         },
///         Some(Slot::Tombstone) | None => Ok(false),
///     }
/// }
/// ```
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Name of the store, used for logging only.
    fn name(&self) -> &str;

    /// Read a slot. `None` means the id was never written (or was deleted
    /// via [`delete()`](Self::delete)), which is distinct from a tombstone.
    async fn get(&self, id: &FileId) -> Result<Option<Slot>>;

    /// Write a slot, replacing whatever was there, and return it.
    async fn set(&self, id: &FileId, slot: Slot) -> Result<Slot>;

    /// Forget a slot entirely. Deleting an absent id is not an error.
    async fn delete(&self, id: &FileId) -> Result<()>;

    /// All ids with a slot (present or tombstoned), most recently written first.
    async fn list_ids(&self) -> Result<Vec<FileId>>;

    /// Remove every slot.
    async fn reset(&self) -> Result<()>;

    /// Check whether the store holds a slot for `id`.
    ///
    /// The default implementation reads the whole slot.
    async fn contains(&self, id: &FileId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}
