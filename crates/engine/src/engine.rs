use crate::error::{ErrorKind, Result, storage};
use crate::limits::Limits;
use crate::locks::IdLocks;
use crate::mount::{MountGuard, MountTracker};
use crate::state::{ErrorMap, Snapshot, State};
use stash_remote::{CacheableHandle, RemoteHandle};
use stash_storage::{BlobRecord, FileId, Slot, StoreHandle};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, watch};

pub(crate) struct Inner {
    pub(crate) pending: StoreHandle,
    pub(crate) cache: StoreHandle,
    pub(crate) remote: RemoteHandle,
    pub(crate) cacheable: Option<CacheableHandle>,
    pub(crate) limits: Limits,
    pub(crate) state: State,
    pub(crate) mounts: MountTracker,
    pub(crate) locks: IdLocks,
    /// Serializes every addition to the cache store.
    pub(crate) admission: AsyncMutex<()>,
    /// Serializes every addition to the pending store.
    pub(crate) pending_admission: AsyncMutex<()>,
    /// Serializes overlapping sync runs.
    pub(crate) sync_lock: AsyncMutex<()>,
    /// Ids the live fetcher tried during the current online session.
    pub(crate) attempted: Mutex<HashSet<FileId>>,
}

/// The cache prioritization and synchronization engine.
///
/// One engine owns a pending store (locally authored content awaiting
/// upload), a size-bounded cache store, the mount tracker and every
/// observable id set. Engines share nothing with each other. Cloning is
/// cheap and yields a handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

pub struct EngineBuilder {
    pending: StoreHandle,
    cache: StoreHandle,
    remote: RemoteHandle,
    cacheable: Option<CacheableHandle>,
    limits: Limits,
    online: bool,
}
impl EngineBuilder {
    /// Where refresh passes learn which ids are worth caching. Without a
    /// provider only recently mounted ids are refreshed.
    pub fn cacheable(mut self, provider: CacheableHandle) -> Self {
        self.cacheable = Some(provider);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Validate the limits and load the current contents of both stores.
    pub async fn build(self) -> Result<Engine> {
        self.limits.validate()?;
        let pending = storage(self.pending.name(), self.pending.list_ids().await)?;
        let cached = storage(self.cache.name(), self.cache.list_ids().await)?;
        tracing::debug!(pending = pending.len(), cached = cached.len(), "Engine opened");
        Ok(Engine {
            inner: Arc::new(Inner {
                state: State::new(pending, cached, self.online),
                mounts: MountTracker::new(self.limits.max_recent),
                pending: self.pending,
                cache: self.cache,
                remote: self.remote,
                cacheable: self.cacheable,
                limits: self.limits,
                locks: IdLocks::default(),
                admission: AsyncMutex::new(()),
                pending_admission: AsyncMutex::new(()),
                sync_lock: AsyncMutex::new(()),
                attempted: Mutex::new(HashSet::new()),
            }),
        })
    }
}

impl Engine {
    pub fn builder(pending: StoreHandle, cache: StoreHandle, remote: RemoteHandle) -> EngineBuilder {
        EngineBuilder {
            pending,
            cache,
            remote,
            cacheable: None,
            limits: Limits::default(),
            online: false,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    /// Mark `id` as in use. See [`MountTracker::register()`].
    pub fn register(&self, id: FileId) -> MountGuard {
        self.inner.mounts.register(id)
    }

    /// Store locally authored content. It is the only copy until the next
    /// upload pass confirms the remote holds identical content.
    ///
    /// Fails with [`PendingFull`](ErrorKind::PendingFull) when `max_pending`
    /// other ids are already pending.
    #[tracing::instrument(skip(self, id, blob), fields(id = %id, bytes = blob.len()))]
    pub async fn put_pending(&self, id: &FileId, blob: BlobRecord) -> Result<()> {
        let _lock = self.inner.locks.lock(id).await;
        // The size check and the write must not interleave with another id.
        let _admission = self.inner.pending_admission.lock().await;
        let state = &self.inner.state;
        if !state.is_pending(id) && state.pending.borrow().len() >= self.inner.limits.max_pending {
            exn::bail!(ErrorKind::PendingFull(id.clone()));
        }
        let pending = &self.inner.pending;
        storage(pending.name(), pending.set(id, Slot::Present(blob)).await)?;
        state.set_pending(id, true);
        Ok(())
    }

    /// Add content straight to the cache store, evicting if needed.
    ///
    /// Fails with [`CacheOverflow`](ErrorKind::CacheOverflow) when the cache
    /// is full of protected entries; neither store is changed then.
    #[tracing::instrument(skip(self, id, blob), fields(id = %id, bytes = blob.len()))]
    pub async fn put_cached(&self, id: &FileId, blob: BlobRecord) -> Result<()> {
        let _lock = self.inner.locks.lock(id).await;
        self.admit(id, blob).await?;
        self.inner.state.set_missing(id, false);
        self.inner.state.set_cache_error(id, None);
        Ok(())
    }

    /// Read the local content for `id`: pending content wins over cached
    /// content. `None` when neither store holds content.
    pub async fn get(&self, id: &FileId) -> Result<Option<BlobRecord>> {
        for store in [&self.inner.pending, &self.inner.cache] {
            if let Some(Slot::Present(blob)) = storage(store.name(), store.get(id).await)? {
                return Ok(Some(blob));
            }
        }
        Ok(None)
    }

    /// Forget `id` locally: drop its pending and cached content and every
    /// error recorded for it. Mounts are unaffected.
    #[tracing::instrument(skip(self, id), fields(id = %id))]
    pub async fn delete(&self, id: &FileId) -> Result<()> {
        let _lock = self.inner.locks.lock(id).await;
        for store in [&self.inner.pending, &self.inner.cache] {
            storage(store.name(), store.delete(id).await)?;
        }
        self.inner.state.forget(id);
        Ok(())
    }

    /// Clear both stores, every mount and every observable set.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        let _pending = self.inner.pending_admission.lock().await;
        let _admission = self.inner.admission.lock().await;
        for store in [&self.inner.pending, &self.inner.cache] {
            storage(store.name(), store.reset().await)?;
        }
        self.inner.mounts.reset();
        self.inner.state.clear();
        self.attempted().clear();
        tracing::info!("Engine reset");
        Ok(())
    }

    pub fn clear_cache_error(&self, id: &FileId) {
        self.inner.state.set_cache_error(id, None);
    }

    pub fn clear_upload_error(&self, id: &FileId) {
        self.inner.state.set_upload_error(id, None);
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = &self.inner.state;
        Snapshot {
            pending: state.pending.borrow().clone(),
            cached: state.cached.borrow().clone(),
            mounted: self.inner.mounts.mounted(),
            recent: self.inner.mounts.recent(),
            missing: state.missing.borrow().clone(),
            cache_errors: state.cache_errors.borrow().clone(),
            upload_errors: state.upload_errors.borrow().clone(),
            syncing: *state.syncing.borrow(),
            online: *state.online.borrow(),
        }
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<BTreeSet<FileId>> {
        self.inner.state.pending.subscribe()
    }

    pub fn subscribe_cached(&self) -> watch::Receiver<Vec<FileId>> {
        self.inner.state.cached.subscribe()
    }

    pub fn subscribe_mounted(&self) -> watch::Receiver<Vec<FileId>> {
        self.inner.mounts.subscribe_mounted()
    }

    pub fn subscribe_recent(&self) -> watch::Receiver<Vec<FileId>> {
        self.inner.mounts.subscribe_recent()
    }

    pub fn subscribe_missing(&self) -> watch::Receiver<BTreeSet<FileId>> {
        self.inner.state.missing.subscribe()
    }

    pub fn subscribe_cache_errors(&self) -> watch::Receiver<ErrorMap> {
        self.inner.state.cache_errors.subscribe()
    }

    pub fn subscribe_upload_errors(&self) -> watch::Receiver<ErrorMap> {
        self.inner.state.upload_errors.subscribe()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.inner.state.syncing.subscribe()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.inner.state.online.subscribe()
    }

    pub(crate) fn attempted(&self) -> std::sync::MutexGuard<'_, HashSet<FileId>> {
        self.inner.attempted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stash_remote::MockRemote;
    use stash_storage::ByteStore;
    use stash_storage::backend::MockStore;

    /// Hands control back to the scheduler before every write.
    #[derive(Default)]
    struct YieldingStore(MockStore);

    #[async_trait]
    impl ByteStore for YieldingStore {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn get(&self, id: &FileId) -> stash_storage::error::Result<Option<Slot>> {
            self.0.get(id).await
        }

        async fn set(&self, id: &FileId, slot: Slot) -> stash_storage::error::Result<Slot> {
            tokio::task::yield_now().await;
            self.0.set(id, slot).await
        }

        async fn delete(&self, id: &FileId) -> stash_storage::error::Result<()> {
            self.0.delete(id).await
        }

        async fn list_ids(&self) -> stash_storage::error::Result<Vec<FileId>> {
            self.0.list_ids().await
        }

        async fn reset(&self) -> stash_storage::error::Result<()> {
            self.0.reset().await
        }
    }

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    fn blob(content: &str) -> BlobRecord {
        BlobRecord::new("text/plain", content)
    }

    async fn engine(limits: Limits) -> Engine {
        Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), Arc::new(MockRemote::default()))
            .limits(limits)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_loads_existing_contents() {
        let pending = MockStore::with_blobs([("p", "text/plain", b"p".to_vec())]);
        let cache = MockStore::with_blobs([("a", "text/plain", b"a".to_vec()), ("b", "text/plain", b"b".to_vec())]);
        let engine = Engine::builder(Arc::new(pending), Arc::new(cache), Arc::new(MockRemote::default()))
            .build()
            .await
            .unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.pending.into_iter().collect::<Vec<_>>(), vec![id("p")]);
        assert_eq!(snapshot.cached, vec![id("b"), id("a")]);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_limits() {
        let err = Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), Arc::new(MockRemote::default()))
            .limits(Limits {
                max_cache: 0,
                max_recent: 0,
                ..Limits::default()
            })
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(&*err, ErrorKind::InvalidLimits(_)));
    }

    #[tokio::test]
    async fn test_pending_wins_on_get() {
        let engine = engine(Limits::default()).await;
        engine.put_cached(&id("a"), blob("cached")).await.unwrap();
        assert_eq!(engine.get(&id("a")).await.unwrap(), Some(blob("cached")));
        engine.put_pending(&id("a"), blob("edited")).await.unwrap();
        assert_eq!(engine.get(&id("a")).await.unwrap(), Some(blob("edited")));
        assert_eq!(engine.get(&id("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_full() {
        let engine = engine(Limits {
            max_pending: 2,
            ..Limits::default()
        })
        .await;
        engine.put_pending(&id("a"), blob("a")).await.unwrap();
        engine.put_pending(&id("b"), blob("b")).await.unwrap();
        // Rewriting an id that is already pending is fine.
        engine.put_pending(&id("a"), blob("a2")).await.unwrap();
        let err = engine.put_pending(&id("c"), blob("c")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PendingFull(_)));
        assert_eq!(engine.snapshot().pending.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_puts_respect_pending_cap() {
        let pending = Arc::new(YieldingStore::default());
        let engine = Engine::builder(pending.clone(), Arc::new(MockStore::default()), Arc::new(MockRemote::default()))
            .limits(Limits {
                max_pending: 1,
                ..Limits::default()
            })
            .build()
            .await
            .unwrap();
        let (id_a, id_b) = (id("a"), id("b"));
        let (a, b) = tokio::join!(engine.put_pending(&id_a, blob("a")), engine.put_pending(&id_b, blob("b")));
        assert!(a.is_ok() != b.is_ok());
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(&*err, ErrorKind::PendingFull(_)));
        assert_eq!(pending.list_ids().await.unwrap().len(), 1);
        assert_eq!(engine.snapshot().pending.len(), 1);
    }

    #[tokio::test]
    async fn test_put_cached_evicts_oldest_unprotected() {
        let engine = engine(Limits {
            max_cache: 2,
            max_recent: 0,
            ..Limits::default()
        })
        .await;
        engine.put_cached(&id("a"), blob("a")).await.unwrap();
        engine.put_cached(&id("b"), blob("b")).await.unwrap();
        engine.put_cached(&id("c"), blob("c")).await.unwrap();
        assert_eq!(engine.snapshot().cached, vec![id("c"), id("b")]);
        // Overwriting a cached id needs no room.
        engine.put_cached(&id("b"), blob("b2")).await.unwrap();
        assert_eq!(engine.snapshot().cached, vec![id("b"), id("c")]);
    }

    #[tokio::test]
    async fn test_delete_and_reset() {
        let engine = engine(Limits::default()).await;
        engine.put_pending(&id("p"), blob("p")).await.unwrap();
        engine.put_cached(&id("c"), blob("c")).await.unwrap();
        let guard = engine.register(id("c"));
        engine.delete(&id("p")).await.unwrap();
        assert!(engine.snapshot().pending.is_empty());
        assert_eq!(engine.get(&id("p")).await.unwrap(), None);
        engine.reset().await.unwrap();
        let snapshot = engine.snapshot();
        assert!(snapshot.cached.is_empty());
        assert!(snapshot.mounted.is_empty());
        assert!(snapshot.recent.is_empty());
        drop(guard);
        assert_eq!(engine.get(&id("c")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_engines_are_isolated() {
        let first = engine(Limits::default()).await;
        let second = engine(Limits::default()).await;
        let _guard = first.register(id("a"));
        first.put_pending(&id("a"), blob("a")).await.unwrap();
        assert!(second.snapshot().mounted.is_empty());
        assert!(second.snapshot().pending.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_unavailable() {
        let cache = Arc::new(MockStore::default());
        cache.break_id(&id("x")).await;
        let engine = Engine::builder(Arc::new(MockStore::default()), cache, Arc::new(MockRemote::default()))
            .build()
            .await
            .unwrap();
        let err = engine.put_cached(&id("x"), blob("x")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::StorageUnavailable(_)));
    }
}
