//! Observable engine state.
//!
//! Each id set and error map lives in its own [`watch`] channel. Updates are
//! always applied with `send_if_modified`, a read-modify-write over the
//! previous value, so two items completing at the same time cannot drop
//! each other's update. Receivers are only notified when the value actually
//! changes.

use stash_storage::FileId;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::watch;

/// FileId → last error message.
pub type ErrorMap = BTreeMap<FileId, String>;

/// A point-in-time copy of every observable value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub pending: BTreeSet<FileId>,
    /// Cache store order, most recently written first.
    pub cached: Vec<FileId>,
    /// Most recently mounted first.
    pub mounted: Vec<FileId>,
    /// Most recently mounted first.
    pub recent: Vec<FileId>,
    pub missing: BTreeSet<FileId>,
    pub cache_errors: ErrorMap,
    pub upload_errors: ErrorMap,
    pub syncing: bool,
    pub online: bool,
}

pub(crate) struct State {
    pub(crate) pending: watch::Sender<BTreeSet<FileId>>,
    pub(crate) cached: watch::Sender<Vec<FileId>>,
    pub(crate) missing: watch::Sender<BTreeSet<FileId>>,
    pub(crate) cache_errors: watch::Sender<ErrorMap>,
    pub(crate) upload_errors: watch::Sender<ErrorMap>,
    pub(crate) syncing: watch::Sender<bool>,
    pub(crate) online: watch::Sender<bool>,
}
impl State {
    pub(crate) fn new(pending: Vec<FileId>, cached: Vec<FileId>, online: bool) -> Self {
        Self {
            pending: watch::Sender::new(pending.into_iter().collect()),
            cached: watch::Sender::new(cached),
            missing: watch::Sender::new(BTreeSet::new()),
            cache_errors: watch::Sender::new(ErrorMap::new()),
            upload_errors: watch::Sender::new(ErrorMap::new()),
            syncing: watch::Sender::new(false),
            online: watch::Sender::new(online),
        }
    }

    pub(crate) fn is_pending(&self, id: &FileId) -> bool {
        self.pending.borrow().contains(id)
    }

    pub(crate) fn is_cached(&self, id: &FileId) -> bool {
        self.cached.borrow().contains(id)
    }

    pub(crate) fn set_pending(&self, id: &FileId, pending: bool) {
        self.pending.send_if_modified(|set| match pending {
            true => set.insert(id.clone()),
            false => set.remove(id),
        });
    }

    /// Move `id` to the front of the cached list, mirroring the store's
    /// newest-first enumeration.
    pub(crate) fn set_cached(&self, id: &FileId) {
        self.cached.send_modify(|list| {
            list.retain(|cached| cached != id);
            list.insert(0, id.clone());
        });
    }

    pub(crate) fn unset_cached(&self, id: &FileId) {
        self.cached.send_if_modified(|list| {
            let before = list.len();
            list.retain(|cached| cached != id);
            list.len() != before
        });
    }

    pub(crate) fn set_missing(&self, id: &FileId, missing: bool) {
        self.missing.send_if_modified(|set| match missing {
            true => set.insert(id.clone()),
            false => set.remove(id),
        });
    }

    pub(crate) fn set_cache_error(&self, id: &FileId, message: Option<String>) {
        Self::set_error(&self.cache_errors, id, message);
    }

    pub(crate) fn set_upload_error(&self, id: &FileId, message: Option<String>) {
        Self::set_error(&self.upload_errors, id, message);
    }

    fn set_error(map: &watch::Sender<ErrorMap>, id: &FileId, message: Option<String>) {
        map.send_if_modified(|errors| match message {
            Some(message) => errors.insert(id.clone(), message.clone()).as_ref() != Some(&message),
            None => errors.remove(id).is_some(),
        });
    }

    /// Forget everything known about `id` except its mounts.
    pub(crate) fn forget(&self, id: &FileId) {
        self.set_pending(id, false);
        self.unset_cached(id);
        self.set_missing(id, false);
        self.set_cache_error(id, None);
        self.set_upload_error(id, None);
    }

    pub(crate) fn clear(&self) {
        self.pending.send_if_modified(|set| !std::mem::take(set).is_empty());
        self.cached.send_if_modified(|list| !std::mem::take(list).is_empty());
        self.missing.send_if_modified(|set| !std::mem::take(set).is_empty());
        self.cache_errors.send_if_modified(|map| !std::mem::take(map).is_empty());
        self.upload_errors.send_if_modified(|map| !std::mem::take(map).is_empty());
    }
}
