//! Cache refresh.
//!
//! Fills the cache with recently mounted ids and ids the cacheable-id
//! provider suggests, evicting unprotected entries to make room first.

use crate::Engine;
use crate::error::{ErrorKind, FailureKind, ItemFailure, PartialFailure, Result, storage, transfer};
use crate::limiter::bounded;
use futures::StreamExt;
use stash_remote::Fetched;
use stash_storage::FileId;
use std::collections::HashSet;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// What happened to one fetched id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Present on the remote and now in the cache store.
    Cached,
    /// Deleted on the remote; nothing cached.
    Tombstone,
    /// Unknown to the remote; recorded as missing.
    Missing,
    /// Not fetched: cached or pending by the time its turn came.
    Skipped,
    /// Not cached: the cache had no evictable entry left.
    NoRoom,
}

/// Per-id outcomes of a refresh pass or a live fetch, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub outcomes: Vec<(FileId, FetchOutcome)>,
    /// Entries evicted before fetching.
    pub evicted: Vec<FileId>,
}
impl FetchReport {
    pub fn with_outcome(&self, outcome: FetchOutcome) -> Vec<&FileId> {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).map(|(id, _)| id).collect()
    }
}

impl Engine {
    /// Build the refresh candidate list: recent ids, then cacheable ids,
    /// deduplicated, without anything already cached or pending, capped at
    /// the refresh budget.
    pub(crate) fn refresh_candidates(
        &self,
        recent: Vec<FileId>,
        cacheable: Vec<FileId>,
        cached: &[FileId],
    ) -> Vec<FileId> {
        let pending = self.inner.state.pending.borrow();
        let mut seen: HashSet<FileId> = cached.iter().cloned().collect();
        recent
            .into_iter()
            .chain(cacheable)
            .filter(|id| !pending.contains(id) && seen.insert(id.clone()))
            .take(self.inner.limits.refresh_budget())
            .collect()
    }

    /// Refresh the cache with at most `concurrency` downloads in flight.
    ///
    /// A failing cacheable-id provider does not stop the pass: recent ids
    /// are still refreshed and the provider failure is part of the
    /// [`Partial`](ErrorKind::Partial) error raised at the end, together
    /// with every per-id transfer failure.
    #[tracing::instrument(skip(self, token))]
    pub async fn refresh(&self, concurrency: usize, token: &CancellationToken) -> Result<FetchReport> {
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        let limits = self.inner.limits;
        let mut failures = Vec::new();
        let cacheable = match &self.inner.cacheable {
            Some(provider) => match provider.cacheable_ids(limits.max_cache).await {
                Ok(ids) => ids.unwrap_or_default(),
                Err(err) => {
                    let message = (*err).to_string();
                    tracing::warn!(error = %message, "Cacheable-id provider failed");
                    failures.push(ItemFailure {
                        id: None,
                        kind: FailureKind::Listing,
                        message,
                    });
                    Vec::new()
                },
            },
            None => Vec::new(),
        };
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }

        let mut report = FetchReport::default();
        let mut candidates = {
            let _admission = self.inner.admission.lock().await;
            let cache = &self.inner.cache;
            let cached = storage(cache.name(), cache.list_ids().await)?;
            let candidates = self.refresh_candidates(self.inner.mounts.recent(), cacheable, &cached);
            let num_to_evict = (cached.len() + candidates.len()).saturating_sub(limits.max_cache);
            for _ in 0..num_to_evict {
                match self.evict_one_locked().await? {
                    Some(victim) => report.evicted.push(victim),
                    None => break,
                }
            }
            candidates
        };
        let room = limits.max_cache.saturating_sub(self.inner.state.cached.borrow().len());
        if candidates.len() > room {
            tracing::debug!(candidates = candidates.len(), room, "Eviction stalled, fetching fewer ids");
            candidates.truncate(room);
        }
        tracing::debug!(count = candidates.len(), evicted = report.evicted.len(), "Refreshing cache");

        let full = AtomicBool::new(false);
        let full = &full;
        let futures = candidates.into_iter().map(|id| async move {
            let result = self.fetch_one(&id, token, full).await;
            (id, result)
        });
        let mut window = pin!(bounded(futures.collect(), concurrency, token));
        while let Some((id, result)) = window.next().await {
            match result {
                Ok(outcome) => report.outcomes.push((id, outcome)),
                Err(err) if matches!(&*err, ErrorKind::Aborted) => {},
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => failures.push(self.record_fetch_failure(&id, &err)),
            }
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        if !failures.is_empty() {
            let succeeded = report.with_outcome(FetchOutcome::Cached).into_iter().cloned().collect();
            exn::bail!(ErrorKind::Partial(PartialFailure { succeeded, failures }));
        }
        tracing::info!(
            cached = report.with_outcome(FetchOutcome::Cached).len(),
            missing = report.with_outcome(FetchOutcome::Missing).len(),
            "Refresh pass complete"
        );
        Ok(report)
    }

    pub(crate) fn record_fetch_failure(&self, id: &FileId, err: &ErrorKind) -> ItemFailure {
        let failure = ItemFailure::from_error(id, err);
        tracing::warn!(id = %id, error = %failure.message, "Fetch failed");
        self.inner.state.set_cache_error(id, Some(failure.message.clone()));
        failure
    }

    /// Download one id and classify the result. Once an admission finds no
    /// room, `full` is set and the remaining ids of the pass are not fetched.
    pub(crate) async fn fetch_one(&self, id: &FileId, token: &CancellationToken, full: &AtomicBool) -> Result<FetchOutcome> {
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        let _lock = self.inner.locks.lock(id).await;
        let state = &self.inner.state;
        if state.is_cached(id) || state.is_pending(id) {
            return Ok(FetchOutcome::Skipped);
        }
        if full.load(Ordering::SeqCst) {
            return Ok(FetchOutcome::NoRoom);
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        let fetched = transfer(id, self.inner.remote.download(id).await)?;
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        let outcome = match fetched {
            Fetched::Present(blob) => match self.admit(id, blob).await {
                Ok(()) => {
                    state.set_missing(id, false);
                    FetchOutcome::Cached
                },
                Err(err) if matches!(&*err, ErrorKind::CacheOverflow(_)) => {
                    tracing::debug!(id = %id, "No room left, stopping additions for this pass");
                    full.store(true, Ordering::SeqCst);
                    return Ok(FetchOutcome::NoRoom);
                },
                Err(err) => return Err(err),
            },
            Fetched::Tombstone => {
                state.set_missing(id, false);
                FetchOutcome::Tombstone
            },
            Fetched::NotFound => {
                state.set_missing(id, true);
                FetchOutcome::Missing
            },
        };
        state.set_cache_error(id, None);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Limits;
    use stash_remote::MockRemote;
    use stash_storage::BlobRecord;
    use stash_storage::backend::MockStore;
    use std::sync::Arc;

    fn ids(names: &[&str]) -> Vec<FileId> {
        names.iter().map(|s| FileId::new(*s).unwrap()).collect()
    }

    async fn engine(max_cache: usize) -> Engine {
        Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), Arc::new(MockRemote::default()))
            .limits(Limits {
                max_cache,
                max_recent: 0,
                ..Limits::default()
            })
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_candidates_deduplicated_and_filtered() {
        let engine = engine(8).await;
        engine.put_pending(&ids(&["p"])[0], BlobRecord::new("text/plain", "p")).await.unwrap();
        let candidates = engine.refresh_candidates(ids(&["r1", "c1", "p"]), ids(&["c1", "c2", "r1", "c3"]), &ids(&["c2"]));
        assert_eq!(candidates, ids(&["r1", "c1", "c3"]));
    }

    #[tokio::test]
    async fn test_candidates_capped_at_budget() {
        let engine = engine(4).await;
        let candidates = engine.refresh_candidates(vec![], ids(&["a", "b", "c", "d", "e"]), &[]);
        assert_eq!(candidates, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_report_filters_outcomes() {
        let report = FetchReport {
            outcomes: vec![
                (FileId::new("a").unwrap(), FetchOutcome::Cached),
                (FileId::new("b").unwrap(), FetchOutcome::Missing),
                (FileId::new("c").unwrap(), FetchOutcome::Cached),
            ],
            evicted: vec![],
        };
        assert_eq!(report.with_outcome(FetchOutcome::Cached).len(), 2);
        assert_eq!(report.with_outcome(FetchOutcome::Tombstone).len(), 0);
    }
}
