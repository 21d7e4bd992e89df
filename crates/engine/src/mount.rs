//! Mount tracking.
//!
//! A consumer that starts using an id calls [`MountTracker::register()`] and
//! holds on to the returned [`MountGuard`] for as long as it uses the id.
//! Mounts are reference counted: an id is mounted while at least one guard
//! for it is alive. Every registration also moves the id to the front of the
//! bounded recent queue, which outlives the mount.
//!
//! All transitions take one short [`Mutex`] and never suspend.

use stash_storage::FileId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Default)]
struct Inner {
    counts: HashMap<FileId, usize>,
    /// Mounted ids, most recently registered first.
    mounted: VecDeque<FileId>,
    recent: VecDeque<FileId>,
    /// Bumped by every reset; guards from an older epoch are inert.
    epoch: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    max_recent: usize,
    mounted: watch::Sender<Vec<FileId>>,
    recent: watch::Sender<Vec<FileId>>,
}
impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every transition leaves the state consistent, so a panic in another
        // holder does not invalidate it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner, mounted: bool, recent: bool) {
        if mounted {
            self.mounted.send_replace(inner.mounted.iter().cloned().collect());
        }
        if recent {
            self.recent.send_replace(inner.recent.iter().cloned().collect());
        }
    }

    fn unregister(&self, id: &FileId, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        let Some(count) = inner.counts.get_mut(id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            inner.counts.remove(id);
            inner.mounted.retain(|mounted| mounted != id);
            tracing::trace!(id = %id, "Unmounted");
            self.publish(&inner, true, false);
        }
    }
}

/// Reference-counted mounts plus the recently-mounted queue.
#[derive(Clone)]
pub struct MountTracker {
    shared: Arc<Shared>,
}
impl MountTracker {
    pub fn new(max_recent: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                max_recent,
                mounted: watch::Sender::new(Vec::new()),
                recent: watch::Sender::new(Vec::new()),
            }),
        }
    }

    /// Start using `id`. The id stays mounted until the returned guard (and
    /// every other guard for the same id) is released or dropped.
    pub fn register(&self, id: FileId) -> MountGuard {
        let mut inner = self.shared.lock();
        let count = inner.counts.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            tracing::trace!(id = %id, "Mounted");
        }
        inner.mounted.retain(|mounted| mounted != &id);
        inner.mounted.push_front(id.clone());
        inner.recent.retain(|recent| recent != &id);
        inner.recent.push_front(id.clone());
        inner.recent.truncate(self.shared.max_recent);
        self.shared.publish(&inner, true, true);
        MountGuard {
            shared: Arc::clone(&self.shared),
            id,
            epoch: inner.epoch,
        }
    }

    /// Forget every mount and the recent queue. Guards handed out before the
    /// reset no longer affect the tracker.
    pub fn reset(&self) {
        let mut inner = self.shared.lock();
        inner.counts.clear();
        inner.mounted.clear();
        inner.recent.clear();
        inner.epoch += 1;
        self.shared.publish(&inner, true, true);
    }

    /// Mounted ids, most recently registered first.
    pub fn mounted(&self) -> Vec<FileId> {
        self.shared.lock().mounted.iter().cloned().collect()
    }

    /// Recently mounted ids, most recent first.
    pub fn recent(&self) -> Vec<FileId> {
        self.shared.lock().recent.iter().cloned().collect()
    }

    pub fn is_mounted(&self, id: &FileId) -> bool {
        self.shared.lock().counts.contains_key(id)
    }

    pub fn subscribe_mounted(&self) -> watch::Receiver<Vec<FileId>> {
        self.shared.mounted.subscribe()
    }

    pub fn subscribe_recent(&self) -> watch::Receiver<Vec<FileId>> {
        self.shared.recent.subscribe()
    }
}

/// Keeps an id mounted. Unregisters on [`release()`](Self::release) or drop,
/// exactly once.
#[must_use = "the id is unmounted as soon as the guard is dropped"]
pub struct MountGuard {
    shared: Arc<Shared>,
    id: FileId,
    epoch: u64,
}
impl MountGuard {
    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn release(self) {}
}
impl Drop for MountGuard {
    fn drop(&mut self) {
        self.shared.unregister(&self.id, self.epoch);
    }
}
