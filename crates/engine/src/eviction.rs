//! Priority classification and eviction.
//!
//! Only the cache store is ever evicted from. An id is protected while it is
//! pending, mounted or in the recent queue; every other cached id is a
//! candidate. Candidates are taken from the *end* of the cache store's
//! enumeration, which every [`ByteStore`](stash_storage::ByteStore) orders
//! newest-write first, so the entry written longest ago goes first. This is
//! insertion-age eviction: reading an entry does not refresh it.

use crate::Engine;
use crate::error::{ErrorKind, Result, storage};
use stash_storage::{BlobRecord, FileId, Slot};
use std::collections::HashSet;

/// The id to evict from `cached` (in store enumeration order), or `None` if
/// every cached id is protected.
pub fn select_victim<'a>(cached: &'a [FileId], protected: &HashSet<FileId>) -> Option<&'a FileId> {
    cached.iter().rev().find(|id| !protected.contains(*id))
}

impl Engine {
    /// Pending ∪ mounted ∪ recent.
    pub(crate) fn protected_ids(&self) -> HashSet<FileId> {
        let mut protected: HashSet<FileId> = self.inner.state.pending.borrow().iter().cloned().collect();
        protected.extend(self.inner.mounts.mounted());
        protected.extend(self.inner.mounts.recent());
        protected
    }

    async fn cached_ids(&self) -> Result<Vec<FileId>> {
        let cache = &self.inner.cache;
        storage(cache.name(), cache.list_ids().await)
    }

    async fn evict(&self, victim: &FileId) -> Result<()> {
        let cache = &self.inner.cache;
        storage(cache.name(), cache.delete(victim).await)?;
        self.inner.state.unset_cached(victim);
        tracing::debug!(store = %cache.name(), id = %victim, "Evicted");
        Ok(())
    }

    /// Evict one unprotected entry from the cache store. Returns `None` when
    /// there is nothing that may be evicted.
    pub async fn evict_one(&self) -> Result<Option<FileId>> {
        let _admission = self.inner.admission.lock().await;
        self.evict_one_locked().await
    }

    /// Evict until the cache store holds at most `target` entries, stopping
    /// early when only protected entries remain. Returns the resulting
    /// number of cached entries.
    pub async fn evict_until_fits(&self, target: usize) -> Result<usize> {
        let _admission = self.inner.admission.lock().await;
        self.evict_until_fits_locked(target).await
    }

    pub(crate) async fn evict_one_locked(&self) -> Result<Option<FileId>> {
        let cached = self.cached_ids().await?;
        let Some(victim) = select_victim(&cached, &self.protected_ids()).cloned() else {
            tracing::debug!(cached = cached.len(), "No eviction candidate");
            return Ok(None);
        };
        self.evict(&victim).await?;
        Ok(Some(victim))
    }

    pub(crate) async fn evict_until_fits_locked(&self, target: usize) -> Result<usize> {
        let cached = self.cached_ids().await?;
        let protected = self.protected_ids();
        let mut count = cached.len();
        let mut candidates = cached.iter().rev().filter(|id| !protected.contains(*id));
        while count > target {
            let Some(victim) = candidates.next() else {
                tracing::debug!(cached = count, target, "Eviction stalled on protected entries");
                break;
            };
            self.evict(victim).await?;
            count -= 1;
        }
        Ok(count)
    }

    /// Write `blob` into the cache store, evicting first if the store is
    /// full. Admission is serialized so that concurrent writers cannot
    /// together exceed `max_cache`.
    ///
    /// Fails with [`CacheOverflow`](ErrorKind::CacheOverflow), leaving the
    /// cache untouched, when no room can be made.
    pub(crate) async fn admit(&self, id: &FileId, blob: BlobRecord) -> Result<()> {
        let _admission = self.inner.admission.lock().await;
        let max_cache = self.inner.limits.max_cache;
        let cached = self.cached_ids().await?;
        if !cached.contains(id) && cached.len() >= max_cache {
            let count = self.evict_until_fits_locked(max_cache - 1).await?;
            if count >= max_cache {
                exn::bail!(ErrorKind::CacheOverflow(id.clone()));
            }
        }
        let cache = &self.inner.cache;
        storage(cache.name(), cache.set(id, Slot::Present(blob)).await)?;
        self.inner.state.set_cached(id);
        Ok(())
    }
}
