//! In-memory remote with fault injection, for testing.

use crate::error::{ErrorKind, Result};
use crate::{CacheableIds, Fetched, RemoteTransfer};
use async_trait::async_trait;
use stash_storage::{BlobRecord, FileId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

type Hook = Box<dyn Fn(&FileId) + Send + Sync>;

#[derive(Default)]
struct Inner {
    objects: HashMap<FileId, Fetched>,
    cacheable: Option<Vec<FileId>>,
    cacheable_fails: bool,
    failing_uploads: HashSet<FileId>,
    failing_downloads: HashSet<FileId>,
    failing_checksums: HashSet<FileId>,
    corrupt_downloads: HashSet<FileId>,
    uploaded: Vec<FileId>,
    downloaded: Vec<FileId>,
}

/// In-memory remote for testing.
///
/// Objects live in a `HashMap` behind a [`RwLock`]. Individual ids can be
/// made to fail on upload or download, or to come back altered on download,
/// and the cacheable-id listing is set explicitly rather than derived from
/// the stored objects. Every call yields to the scheduler once so that
/// concurrent passes actually interleave.
pub struct MockRemote {
    inner: RwLock<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    on_upload: Option<Hook>,
    on_download: Option<Hook>,
}

impl MockRemote {
    /// Create a mock remote holding the given blobs.
    ///
    /// Panics if any id is empty. If test setup is wrong, then test should
    /// not pass.
    pub fn with_blobs<'a>(blobs: impl IntoIterator<Item = (&'a str, &'a str, Vec<u8>)>) -> Self {
        let mut inner = Inner::default();
        for (id, mime_type, bytes) in blobs {
            inner.objects.insert(Self::id(id), Fetched::Present(BlobRecord::new(mime_type, bytes)));
        }
        Self {
            inner: RwLock::new(inner),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            on_upload: None,
            on_download: None,
        }
    }

    /// Mark ids as deleted on the remote.
    pub fn with_tombstones<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        {
            let mut inner = self.inner.try_write().unwrap_or_else(|_| panic!("MockRemote is shared already"));
            for id in ids {
                inner.objects.insert(Self::id(id), Fetched::Tombstone);
            }
        }
        self
    }

    /// Set the list returned by [`cacheable_ids()`](CacheableIds::cacheable_ids).
    pub fn with_cacheable<'a>(self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        {
            let mut inner = self.inner.try_write().unwrap_or_else(|_| panic!("MockRemote is shared already"));
            inner.cacheable = Some(ids.into_iter().map(Self::id).collect());
        }
        self
    }

    /// Run `hook` at the start of every upload, before anything is stored.
    pub fn on_upload(mut self, hook: impl Fn(&FileId) + Send + Sync + 'static) -> Self {
        self.on_upload = Some(Box::new(hook));
        self
    }

    /// Run `hook` at the start of every download, before anything is read.
    pub fn on_download(mut self, hook: impl Fn(&FileId) + Send + Sync + 'static) -> Self {
        self.on_download = Some(Box::new(hook));
        self
    }

    pub async fn fail_uploads(&self, id: &str) {
        self.inner.write().await.failing_uploads.insert(Self::id(id));
    }

    pub async fn fail_downloads(&self, id: &str) {
        self.inner.write().await.failing_downloads.insert(Self::id(id));
    }

    /// Downloads of `id` fail the remote's own checksum comparison.
    pub async fn fail_checksums(&self, id: &str) {
        self.inner.write().await.failing_checksums.insert(Self::id(id));
    }

    /// Downloads of `id` return the stored content with one byte flipped.
    pub async fn corrupt_downloads(&self, id: &str) {
        self.inner.write().await.corrupt_downloads.insert(Self::id(id));
    }

    pub async fn fail_cacheable(&self) {
        self.inner.write().await.cacheable_fails = true;
    }

    /// Ids in upload order, including failed attempts.
    pub async fn uploaded(&self) -> Vec<FileId> {
        self.inner.read().await.uploaded.clone()
    }

    /// Ids in download order, including failed attempts.
    pub async fn downloaded(&self) -> Vec<FileId> {
        self.inner.read().await.downloaded.clone()
    }

    pub async fn object(&self, id: &str) -> Option<Fetched> {
        self.inner.read().await.objects.get(&Self::id(id)).cloned()
    }

    /// Highest number of transfers that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn id(id: &str) -> FileId {
        let Ok(id) = FileId::new(id) else {
            // The panic here is DELIBERATE. MockRemote is intended to be
            // used in tests; panics are expected. There is no error result.
            panic!("MockRemote: invalid id {id:?}");
        };
        id
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
impl Default for MockRemote {
    fn default() -> Self {
        let blobs: [(&str, &str, Vec<u8>); 0] = [];
        Self::with_blobs(blobs)
    }
}

#[async_trait]
impl RemoteTransfer for MockRemote {
    fn name(&self) -> &str {
        "mock"
    }

    async fn upload(&self, id: &FileId, blob: &BlobRecord) -> Result<()> {
        if let Some(hook) = &self.on_upload {
            hook(id);
        }
        self.enter().await;
        let mut inner = self.inner.write().await;
        inner.uploaded.push(id.clone());
        let result = if inner.failing_uploads.contains(id) {
            Err(ErrorKind::Transfer(format!("simulated upload failure for {id}")).into())
        } else {
            inner.objects.insert(id.clone(), Fetched::Present(blob.clone()));
            Ok(())
        };
        drop(inner);
        self.leave();
        result
    }

    async fn download(&self, id: &FileId) -> Result<Fetched> {
        if let Some(hook) = &self.on_download {
            hook(id);
        }
        self.enter().await;
        let mut inner = self.inner.write().await;
        inner.downloaded.push(id.clone());
        let result = if inner.failing_downloads.contains(id) {
            Err(ErrorKind::Transfer(format!("simulated download failure for {id}")).into())
        } else if inner.failing_checksums.contains(id) {
            Err(ErrorKind::Integrity(format!("simulated checksum mismatch for {id}")).into())
        } else {
            let mut fetched = inner.objects.get(id).cloned().unwrap_or(Fetched::NotFound);
            if inner.corrupt_downloads.contains(id)
                && let Fetched::Present(blob) = &mut fetched
            {
                match blob.bytes.first_mut() {
                    Some(byte) => *byte ^= 0xff,
                    None => blob.bytes.push(0),
                }
            }
            Ok(fetched)
        };
        drop(inner);
        self.leave();
        result
    }
}

#[async_trait]
impl CacheableIds for MockRemote {
    async fn cacheable_ids(&self, max: usize) -> Result<Option<Vec<FileId>>> {
        let inner = self.inner.read().await;
        if inner.cacheable_fails {
            exn::bail!(ErrorKind::Transfer("simulated listing failure".to_string()));
        }
        Ok(inner.cacheable.as_ref().map(|ids| ids.iter().take(max).cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_classification() {
        let remote = MockRemote::with_blobs([("a", "text/plain", b"a".to_vec())]).with_tombstones(["gone"]);
        assert!(matches!(remote.download(&id("a")).await.unwrap(), Fetched::Present(_)));
        assert_eq!(remote.download(&id("gone")).await.unwrap(), Fetched::Tombstone);
        assert_eq!(remote.download(&id("never")).await.unwrap(), Fetched::NotFound);
        assert_eq!(remote.downloaded().await.len(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_downloads_differ() {
        let remote = MockRemote::default();
        let blob = BlobRecord::new("text/plain", "hello");
        remote.upload(&id("x"), &blob).await.unwrap();
        remote.corrupt_downloads("x").await;
        let fetched = remote.download(&id("x")).await.unwrap().into_blob().unwrap();
        assert_eq!(fetched.len(), blob.len());
        assert_ne!(fetched, blob);
        // The stored object itself is intact.
        assert_eq!(remote.object("x").await, Some(Fetched::Present(blob)));
    }

    #[tokio::test]
    async fn test_failures() {
        let remote = MockRemote::default();
        remote.fail_uploads("u").await;
        remote.fail_downloads("d").await;
        let err = remote.upload(&id("u"), &BlobRecord::new("text/plain", "")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Transfer(_)));
        assert!(remote.download(&id("d")).await.is_err());
        remote.fail_checksums("u").await;
        let err = remote.download(&id("u")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Integrity(_)));
        assert_eq!(remote.uploaded().await, vec![id("u")]);
        assert_eq!(remote.object("u").await, None);
    }

    #[tokio::test]
    async fn test_cacheable_listing() {
        let remote = MockRemote::default();
        assert_eq!(remote.cacheable_ids(5).await.unwrap(), None);
        let remote = MockRemote::default().with_cacheable(["c", "d", "e"]);
        assert_eq!(remote.cacheable_ids(2).await.unwrap(), Some(vec![id("c"), id("d")]));
        remote.fail_cacheable().await;
        assert!(remote.cacheable_ids(2).await.is_err());
    }
}
