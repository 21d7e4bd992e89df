//! Live fetching of mounted ids.
//!
//! A freshly mounted id should not wait for the next full sync to appear in
//! the cache. While the engine is online, every mounted id that is neither
//! cached nor pending is fetched on its own, at most once per online
//! session. Per-id locks keep this from racing a sync on the same id.

use crate::Engine;
use crate::error::{ErrorKind, Result};
use crate::refresh::{FetchOutcome, FetchReport};
use std::sync::atomic::AtomicBool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

impl Engine {
    /// Assert or withdraw connectivity. Going offline ends the session, so
    /// ids attempted during it will be tried again next time.
    pub fn set_online(&self, online: bool) {
        if !online {
            self.attempted().clear();
        }
        self.inner.state.online.send_if_modified(|current| std::mem::replace(current, online) != online);
    }

    pub fn is_online(&self) -> bool {
        *self.inner.state.online.borrow()
    }

    /// One live fetch pass: up to `max_mounted` mounted ids, most recently
    /// mounted first. Best effort: transfer failures are recorded in the
    /// cache error map and logged, never raised.
    #[tracing::instrument(skip(self, token))]
    pub async fn fetch_mounted(&self, token: &CancellationToken) -> Result<FetchReport> {
        let mut report = FetchReport::default();
        if !self.is_online() {
            return Ok(report);
        }
        let state = &self.inner.state;
        let mut due = Vec::new();
        {
            let attempted = self.attempted();
            for id in self.inner.mounts.mounted() {
                if due.len() >= self.inner.limits.max_mounted {
                    break;
                }
                if !state.is_cached(&id) && !state.is_pending(&id) && !attempted.contains(&id) {
                    due.push(id);
                }
            }
        }
        let full = AtomicBool::new(false);
        for id in due {
            // Only ids whose fetch actually runs count as attempted; the rest
            // of the pass stays eligible once room frees up.
            if !self.attempted().insert(id.clone()) {
                continue;
            }
            match self.fetch_one(&id, token, &full).await {
                Ok(FetchOutcome::NoRoom) => {
                    report.outcomes.push((id, FetchOutcome::NoRoom));
                    break;
                },
                Ok(outcome) => report.outcomes.push((id, outcome)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    self.record_fetch_failure(&id, &err);
                },
            }
        }
        if !report.outcomes.is_empty() {
            tracing::debug!(fetched = report.with_outcome(FetchOutcome::Cached).len(), "Live fetch pass complete");
        }
        Ok(report)
    }

    /// Run [`fetch_mounted()`](Self::fetch_mounted) now and again whenever
    /// the mounted set or connectivity changes, until `token` is cancelled.
    pub fn spawn_live_fetcher(&self, token: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let mut mounted = self.subscribe_mounted();
        let mut online = self.subscribe_online();
        tokio::spawn(async move {
            loop {
                match engine.fetch_mounted(&token).await {
                    Ok(_) => {},
                    Err(err) if matches!(&*err, ErrorKind::Aborted) => break,
                    Err(err) => tracing::warn!(error = %(*err).to_string(), "Live fetch pass failed"),
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = mounted.changed() => if changed.is_err() { break },
                    changed = online.changed() => if changed.is_err() { break },
                }
            }
            tracing::debug!("Live fetcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Limits;
    use stash_remote::MockRemote;
    use stash_storage::backend::MockStore;
    use stash_storage::{BlobRecord, FileId};
    use std::sync::Arc;
    use std::time::Duration;

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    async fn engine(remote: Arc<MockRemote>, max_mounted: usize) -> Engine {
        Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), remote)
            .limits(Limits {
                max_mounted,
                ..Limits::default()
            })
            .build()
            .await
            .unwrap()
    }

    fn remote() -> Arc<MockRemote> {
        Arc::new(
            MockRemote::with_blobs([("a", "text/plain", b"a".to_vec()), ("b", "text/plain", b"b".to_vec())])
                .with_tombstones(["gone"]),
        )
    }

    #[tokio::test]
    async fn test_offline_does_nothing() {
        let remote = remote();
        let engine = engine(Arc::clone(&remote), 4).await;
        let _guard = engine.register(id("a"));
        let report = engine.fetch_mounted(&CancellationToken::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(remote.downloaded().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetches_mounted_once_per_session() {
        let remote = remote();
        let engine = engine(Arc::clone(&remote), 4).await;
        engine.set_online(true);
        let _a = engine.register(id("a"));
        let _gone = engine.register(id("gone"));
        let _never = engine.register(id("never"));
        let token = CancellationToken::new();
        let report = engine.fetch_mounted(&token).await.unwrap();
        assert_eq!(
            report.outcomes,
            vec![
                (id("never"), FetchOutcome::Missing),
                (id("gone"), FetchOutcome::Tombstone),
                (id("a"), FetchOutcome::Cached),
            ]
        );
        assert_eq!(engine.get(&id("a")).await.unwrap(), Some(BlobRecord::new("text/plain", "a")));
        assert!(engine.snapshot().missing.contains(&id("never")));

        // Already attempted in this session.
        assert!(engine.fetch_mounted(&token).await.unwrap().outcomes.is_empty());
        // A new session retries what is still not cached.
        engine.set_online(false);
        engine.set_online(true);
        let report = engine.fetch_mounted(&token).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_budget_and_pending_are_respected() {
        let remote = remote();
        let engine = engine(Arc::clone(&remote), 1).await;
        engine.set_online(true);
        engine.put_pending(&id("b"), BlobRecord::new("text/plain", "local")).await.unwrap();
        let _a = engine.register(id("a"));
        let _b = engine.register(id("b"));
        let report = engine.fetch_mounted(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes, vec![(id("a"), FetchOutcome::Cached)]);
        assert_eq!(remote.downloaded().await, vec![id("a")]);
    }

    #[tokio::test]
    async fn test_ids_left_by_a_full_cache_are_fetched_later() {
        let remote = Arc::new(MockRemote::with_blobs(
            ["x", "y", "z"].map(|name| (name, "text/plain", name.as_bytes().to_vec())),
        ));
        let engine = Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), remote.clone())
            .limits(Limits {
                max_cache: 1,
                max_recent: 0,
                max_mounted: 4,
                ..Limits::default()
            })
            .build()
            .await
            .unwrap();
        engine.put_cached(&id("m"), BlobRecord::new("text/plain", "m")).await.unwrap();
        let m = engine.register(id("m"));
        let _x = engine.register(id("x"));
        let _y = engine.register(id("y"));
        let _z = engine.register(id("z"));
        engine.set_online(true);
        let token = CancellationToken::new();

        let report = engine.fetch_mounted(&token).await.unwrap();
        assert_eq!(report.outcomes, vec![(id("z"), FetchOutcome::NoRoom)]);

        // Unmounting m makes it evictable; y and x were never tried.
        drop(m);
        let report = engine.fetch_mounted(&token).await.unwrap();
        assert_eq!(
            report.outcomes,
            vec![(id("y"), FetchOutcome::Cached), (id("x"), FetchOutcome::NoRoom)]
        );
        assert_eq!(remote.downloaded().await, vec![id("z"), id("y"), id("x")]);
        assert_eq!(engine.snapshot().cached, vec![id("y")]);
    }

    #[tokio::test]
    async fn test_failures_recorded_not_raised() {
        let remote = remote();
        remote.fail_downloads("a").await;
        let engine = engine(Arc::clone(&remote), 4).await;
        engine.set_online(true);
        let _a = engine.register(id("a"));
        let report = engine.fetch_mounted(&CancellationToken::new()).await.unwrap();
        assert!(report.outcomes.is_empty());
        assert!(engine.snapshot().cache_errors.contains_key(&id("a")));
    }

    #[tokio::test]
    async fn test_spawned_fetcher_follows_mounts() {
        let remote = remote();
        let engine = engine(Arc::clone(&remote), 4).await;
        engine.set_online(true);
        let token = CancellationToken::new();
        let handle = engine.spawn_live_fetcher(token.clone());
        let mut cached = engine.subscribe_cached();
        let _guard = engine.register(id("b"));
        tokio::time::timeout(Duration::from_secs(5), cached.wait_for(|ids| ids.contains(&id("b"))))
            .await
            .unwrap()
            .unwrap();
        token.cancel();
        handle.await.unwrap();
    }
}
