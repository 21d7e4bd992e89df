#![allow(dead_code)]

use stash_engine::{Engine, Limits};
use stash_remote::MockRemote;
use stash_storage::backend::MockStore;
use stash_storage::{BlobRecord, ByteStore, FileId};
use std::sync::Arc;

pub struct Harness {
    pub engine: Engine,
    pub pending: Arc<MockStore>,
    pub cache: Arc<MockStore>,
    pub remote: Arc<MockRemote>,
}
impl Harness {
    pub async fn new(limits: Limits, remote: MockRemote) -> Self {
        let pending = Arc::new(MockStore::default().with_name("pending"));
        let cache = Arc::new(MockStore::default().with_name("cache"));
        let remote = Arc::new(remote);
        let engine = Engine::builder(pending.clone(), cache.clone(), remote.clone())
            .cacheable(remote.clone())
            .limits(limits)
            .build()
            .await
            .unwrap();
        Self {
            engine,
            pending,
            cache,
            remote,
        }
    }

    pub async fn cached_ids(&self) -> Vec<FileId> {
        self.cache.list_ids().await.unwrap()
    }

    pub async fn pending_ids(&self) -> Vec<FileId> {
        self.pending.list_ids().await.unwrap()
    }
}

pub fn id(s: &str) -> FileId {
    FileId::new(s).unwrap()
}

pub fn blob(content: &str) -> BlobRecord {
    BlobRecord::new("application/octet-stream", content)
}

pub fn limits(max_cache: usize) -> Limits {
    Limits {
        max_cache,
        max_recent: 0,
        ..Limits::default()
    }
}
