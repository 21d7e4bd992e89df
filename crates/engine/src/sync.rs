//! Sync orchestration: the upload pass, then the refresh pass.

use crate::Engine;
use crate::error::{ErrorKind, Result};
use crate::refresh::FetchReport;
use crate::upload::UploadReport;
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::pin;
use tokio_util::sync::CancellationToken;

/// Coarse progress: `completed` of `total` phases are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: u8,
    pub total: u8,
}

pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

pub struct SyncOptions {
    /// Cancelling stops scheduling new work; committed effects stay.
    pub token: CancellationToken,
    pub on_progress: Option<ProgressFn>,
    /// Run the refresh pass after uploading.
    pub pull: bool,
    /// Transfers in flight per pass.
    pub concurrency: usize,
}
impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            on_progress: None,
            pull: true,
            concurrency: 1,
        }
    }
}
impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("cancelled", &self.token.is_cancelled())
            .field("pull", &self.pull)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Progress events emitted by [`Engine::sync_events()`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started): exactly once, after any previous sync on
///    the same engine has finished.
/// 2. [`UploadComplete`](Self::UploadComplete): exactly once.
/// 3. [`RefreshComplete`](Self::RefreshComplete): once when pulling, never
///    otherwise.
/// 4. [`Complete`](Self::Complete): exactly once, signalling the stream is
///    finished.
///
/// An error terminates the stream early, in which case
/// [`Complete`](Self::Complete) is never emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started,
    UploadComplete(UploadReport),
    RefreshComplete(FetchReport),
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub upload: UploadReport,
    /// `None` when the sync did not pull.
    pub refresh: Option<FetchReport>,
}

/// Keeps the `syncing` flag raised for as long as it lives.
struct SyncingFlag<'a>(&'a Engine);
impl<'a> SyncingFlag<'a> {
    fn raise(engine: &'a Engine) -> Self {
        engine.inner.state.syncing.send_replace(true);
        Self(engine)
    }
}
impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.inner.state.syncing.send_replace(false);
    }
}

impl Engine {
    /// Streams [`SyncEvent`]s while uploading pending content and then, if
    /// `pull` is set, refreshing the cache.
    ///
    /// Overlapping syncs on one engine run one after the other. Cancellation
    /// is observed between and within the passes. The first error ends the
    /// stream: an upload failure means the refresh pass never starts.
    pub fn sync_events(
        &self,
        pull: bool,
        concurrency: usize,
        token: CancellationToken,
    ) -> impl Stream<Item = Result<SyncEvent>> + '_ {
        // `rustfmt` does not format macros that use braces. Wrap in parentheses!
        stream!({
            let _serialized = self.inner.sync_lock.lock().await;
            let _syncing = SyncingFlag::raise(self);
            yield Ok(SyncEvent::Started);

            match self.sync_pending(concurrency, &token).await {
                Ok(report) => yield Ok(SyncEvent::UploadComplete(report)),
                Err(err) => {
                    yield Err(err);
                    return;
                },
            }
            if !pull {
                yield Ok(SyncEvent::Complete);
                return;
            }
            if token.is_cancelled() {
                yield Err(ErrorKind::Aborted.into());
                return;
            }
            match self.refresh(concurrency, &token).await {
                Ok(report) => yield Ok(SyncEvent::RefreshComplete(report)),
                Err(err) => {
                    yield Err(err);
                    return;
                },
            }
            yield Ok(SyncEvent::Complete);
        })
    }

    /// Run a full sync, reporting progress through `options.on_progress`
    /// (`1/2` after uploading and `2/2` after refreshing, or `1/1` when not
    /// pulling).
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport> {
        let total = if options.pull { 2 } else { 1 };
        let progress = |completed| {
            if let Some(on_progress) = &options.on_progress {
                on_progress(Progress { completed, total });
            }
        };
        let mut events = pin!(self.sync_events(options.pull, options.concurrency, options.token.clone()));
        let mut report = SyncReport::default();
        while let Some(event) = events.next().await {
            match event? {
                SyncEvent::Started => tracing::debug!("Sync started"),
                SyncEvent::UploadComplete(upload) => {
                    report.upload = upload;
                    progress(1);
                },
                SyncEvent::RefreshComplete(refresh) => {
                    report.refresh = Some(refresh);
                    progress(2);
                },
                SyncEvent::Complete => tracing::info!("Sync complete"),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Limits;
    use stash_remote::MockRemote;
    use stash_storage::backend::MockStore;
    use stash_storage::{BlobRecord, FileId};
    use std::sync::{Arc, Mutex};

    async fn engine() -> Engine {
        Engine::builder(Arc::new(MockStore::default()), Arc::new(MockStore::default()), Arc::new(MockRemote::default()))
            .limits(Limits::default())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_event_order() {
        let engine = engine().await;
        let events: Vec<_> = engine.sync_events(true, 1, CancellationToken::new()).collect().await;
        let events: Vec<_> = events.into_iter().map(|e| e.unwrap()).collect();
        assert!(matches!(events[0], SyncEvent::Started));
        assert!(matches!(events[1], SyncEvent::UploadComplete(_)));
        assert!(matches!(events[2], SyncEvent::RefreshComplete(_)));
        assert!(matches!(events[3], SyncEvent::Complete));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_progress_reports() {
        let engine = engine().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        engine
            .sync(SyncOptions {
                on_progress: Some(Box::new(move |p: Progress| recorder.lock().unwrap().push((p.completed, p.total)))),
                ..SyncOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2)]);

        let recorder = Arc::clone(&seen);
        seen.lock().unwrap().clear();
        let report = engine
            .sync(SyncOptions {
                on_progress: Some(Box::new(move |p: Progress| recorder.lock().unwrap().push((p.completed, p.total)))),
                pull: false,
                ..SyncOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);
        assert_eq!(report.refresh, None);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = engine().await;
        engine.put_pending(&FileId::new("x").unwrap(), BlobRecord::new("text/plain", "x")).await.unwrap();
        let options = SyncOptions::default();
        options.token.cancel();
        let err = engine.sync(options).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Aborted));
        assert_eq!(engine.snapshot().pending.len(), 1);
        assert!(!engine.snapshot().syncing);
    }

    #[tokio::test]
    async fn test_syncing_flag_is_observable() {
        let engine = engine().await;
        let mut syncing = engine.subscribe_syncing();
        let mut events = pin!(engine.sync_events(false, 1, CancellationToken::new()));
        assert!(matches!(events.next().await, Some(Ok(SyncEvent::Started))));
        assert!(*syncing.borrow_and_update());
        while events.next().await.is_some() {}
        drop(events);
        assert!(!*syncing.borrow_and_update());
    }
}
