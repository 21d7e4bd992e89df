//! Remote collaborators.
//!
//! The synchronization engine never talks to a network directly. It uploads
//! and downloads through a [`RemoteTransfer`] and learns which ids are worth
//! caching from a [`CacheableIds`] provider. Implementations are responsible
//! for their own timeout policy and surface timeouts as ordinary
//! [`Transfer`](error::ErrorKind::Transfer) failures.

pub mod error;
#[cfg(any(test, feature = "mock"))]
mod mock;
#[cfg(feature = "s3")]
mod s3;
mod store;

#[cfg(any(test, feature = "mock"))]
pub use crate::mock::MockRemote;
#[cfg(feature = "s3")]
pub use crate::s3::S3Remote;
pub use crate::store::StoreRemote;

use crate::error::Result;
use async_trait::async_trait;
use stash_storage::{BlobRecord, FileId};
use std::sync::Arc;

/// Outcome of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Present(BlobRecord),
    /// The remote knows the id and says its content was deleted.
    Tombstone,
    /// The remote has no record of the id.
    NotFound,
}
impl Fetched {
    pub fn into_blob(self) -> Option<BlobRecord> {
        match self {
            Self::Present(blob) => Some(blob),
            Self::Tombstone | Self::NotFound => None,
        }
    }
}

#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Name of the remote, used for logging only.
    fn name(&self) -> &str;

    /// Replace the remote copy of `id` with `blob`.
    async fn upload(&self, id: &FileId, blob: &BlobRecord) -> Result<()>;

    /// Fetch the remote copy of `id`.
    ///
    /// Remotes that record a digest next to the object must compare it with
    /// the received bytes and fail with
    /// [`Integrity`](error::ErrorKind::Integrity) instead of returning
    /// corrupt content.
    async fn download(&self, id: &FileId) -> Result<Fetched>;
}

/// Source of ids worth keeping in the local cache.
#[async_trait]
pub trait CacheableIds: Send + Sync {
    /// Up to `max` ids, most recently changed on the remote first. `None`
    /// means the provider has nothing to offer right now (for example it has
    /// not loaded its listing yet), which is not an error.
    async fn cacheable_ids(&self, max: usize) -> Result<Option<Vec<FileId>>>;
}

pub type RemoteHandle = Arc<dyn RemoteTransfer + Send + Sync>;
pub type CacheableHandle = Arc<dyn CacheableIds + Send + Sync>;
