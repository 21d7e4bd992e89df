//! In-memory byte store for testing.

use crate::ByteStore;
use crate::error::{ErrorKind, Result};
use crate::models::{BlobRecord, FileId, Slot};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    /// Write sequence number alongside each slot; higher is newer.
    slots: HashMap<FileId, (u64, Slot)>,
    next_seq: u64,
    /// Ids whose operations fail, to simulate an unreachable store.
    broken: HashSet<FileId>,
}

/// In-memory byte store for testing.
///
/// Slots are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Ideal for unit
/// tests that need a [`ByteStore`] without filesystem or database
/// dependencies.
///
/// # Examples
///
/// ```
/// use stash_storage::backend::MockStore;
/// use stash_storage::{ByteStore, FileId};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockStore::with_blobs([("a", "text/plain", b"first".to_vec())]);
/// assert!(store.contains(&FileId::new("a")?).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockStore {
    name: String,
    inner: RwLock<Inner>,
}

impl MockStore {
    /// Create a mock store pre-populated with blobs, written in iteration
    /// order (so the last item is listed first).
    ///
    /// Panics if any id is empty. If test setup is wrong, then test should
    /// not pass.
    pub fn with_blobs<'a>(blobs: impl IntoIterator<Item = (&'a str, &'a str, Vec<u8>)>) -> Self {
        let mut inner = Inner::default();
        for (id, mime_type, bytes) in blobs {
            let Ok(id) = FileId::new(id) else {
                // The panic here is DELIBERATE. MockStore is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockStore::with_blobs: invalid id {id:?}");
            };
            inner.next_seq += 1;
            inner.slots.insert(id, (inner.next_seq, Slot::Present(BlobRecord::new(mime_type, bytes))));
        }
        Self {
            name: "mock".to_string(),
            inner: RwLock::new(inner),
        }
    }

    /// Change the name of the mock store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make every operation touching `id` fail with a backend error.
    pub async fn break_id(&self, id: &FileId) {
        self.inner.write().await.broken.insert(id.clone());
    }

    fn check(inner: &Inner, id: &FileId) -> Result<()> {
        if inner.broken.contains(id) {
            exn::bail!(ErrorKind::BackendError(format!("simulated failure for {id}")));
        }
        Ok(())
    }
}
impl Default for MockStore {
    fn default() -> Self {
        let blobs: [(&str, &str, Vec<u8>); 0] = [];
        Self::with_blobs(blobs)
    }
}

#[async_trait]
impl ByteStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &FileId) -> Result<Option<Slot>> {
        let guard = self.inner.read().await;
        Self::check(&guard, id)?;
        Ok(guard.slots.get(id).map(|(_, slot)| slot.clone()))
    }

    async fn set(&self, id: &FileId, slot: Slot) -> Result<Slot> {
        let mut guard = self.inner.write().await;
        Self::check(&guard, id)?;
        guard.next_seq += 1;
        let seq = guard.next_seq;
        guard.slots.insert(id.clone(), (seq, slot.clone()));
        Ok(slot)
    }

    async fn delete(&self, id: &FileId) -> Result<()> {
        let mut guard = self.inner.write().await;
        Self::check(&guard, id)?;
        guard.slots.remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<FileId>> {
        let guard = self.inner.read().await;
        let mut entries: Vec<(u64, FileId)> = guard.slots.iter().map(|(id, (seq, _))| (*seq, id.clone())).collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    async fn reset(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.slots.clear();
        Ok(())
    }
}
