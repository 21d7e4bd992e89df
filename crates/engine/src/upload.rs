//! Upload synchronization.
//!
//! Every pending id goes through upload, re-download and digest comparison
//! before its content moves from the pending store into the cache store.
//! Until the comparison succeeds the pending entry is the only authoritative
//! copy and is never touched.

use crate::Engine;
use crate::error::{ErrorKind, ItemFailure, PartialFailure, Result, storage, transfer};
use crate::limiter::bounded;
use exn::ResultExt;
use futures::StreamExt;
use stash_remote::Fetched;
use stash_remote::error::ErrorKind as RemoteErrorKind;
use stash_storage::{Digest, FileId, Slot};
use std::pin::pin;
use tokio_util::sync::CancellationToken;

/// Ids promoted by one upload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Verified, removed from the pending store and written to the cache.
    pub promoted: Vec<FileId>,
    /// Verified and removed from the pending store, but the cache had no
    /// evictable entry to make room for them.
    pub uncached: Vec<FileId>,
}

enum Promotion {
    Cached,
    Uncached,
}

impl Engine {
    /// Upload every pending id with at most `concurrency` transfers in
    /// flight.
    ///
    /// Fail-slow: one item failing never stops its siblings. Failures are
    /// recorded in the upload error map and raised together as
    /// [`Partial`](ErrorKind::Partial) once every admitted item finished;
    /// ids verified before then stay promoted. Cancellation stops admitting
    /// items and raises [`Aborted`](ErrorKind::Aborted).
    #[tracing::instrument(skip(self, token))]
    pub async fn sync_pending(&self, concurrency: usize, token: &CancellationToken) -> Result<UploadReport> {
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        let pending = &self.inner.pending;
        let mut ids = storage(pending.name(), pending.list_ids().await)?;
        // Oldest edits first.
        ids.reverse();
        tracing::debug!(count = ids.len(), "Uploading pending content");

        let futures = ids.into_iter().map(|id| async move {
            let result = self.upload_one(&id, token).await;
            (id, result)
        });
        let mut window = pin!(bounded(futures.collect(), concurrency, token));
        let mut report = UploadReport::default();
        let mut failures = Vec::new();
        while let Some((id, result)) = window.next().await {
            match result {
                Ok(Promotion::Cached) => report.promoted.push(id),
                Ok(Promotion::Uncached) => report.uncached.push(id),
                Err(err) if matches!(&*err, ErrorKind::Aborted) => {},
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    let failure = ItemFailure::from_error(&id, &err);
                    tracing::warn!(id = %id, error = %failure.message, "Upload failed");
                    self.inner.state.set_upload_error(&id, Some(failure.message.clone()));
                    failures.push(failure);
                },
            }
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Aborted);
        }
        if !failures.is_empty() {
            let mut succeeded = report.promoted;
            succeeded.extend(report.uncached);
            exn::bail!(ErrorKind::Partial(PartialFailure { succeeded, failures }));
        }
        tracing::info!(promoted = report.promoted.len(), uncached = report.uncached.len(), "Upload pass complete");
        Ok(report)
    }

    async fn upload_one(&self, id: &FileId, token: &CancellationToken) -> Result<Promotion> {
        let abort_check = || match token.is_cancelled() {
            true => Err(exn::Exn::from(ErrorKind::Aborted)),
            false => Ok(()),
        };
        abort_check()?;
        let _lock = self.inner.locks.lock(id).await;

        abort_check()?;
        let pending = &self.inner.pending;
        let blob = match storage(pending.name(), pending.get(id).await)? {
            Some(Slot::Present(blob)) => blob,
            Some(Slot::Tombstone) | None => exn::bail!(ErrorKind::NotFound(id.clone())),
        };
        let expected = Digest::of(&blob);

        abort_check()?;
        transfer(id, self.inner.remote.upload(id, &blob).await)?;

        abort_check()?;
        let fetched = match self.inner.remote.download(id).await {
            // The remote's own checksum disagrees with the bytes it sent back.
            Err(err) if matches!(&*err, RemoteErrorKind::Integrity(_)) => {
                return Err(err).or_raise(|| ErrorKind::VerificationMismatch(id.clone()));
            },
            result => transfer(id, result)?,
        };
        match fetched {
            Fetched::Present(remote) if remote.len() == blob.len() && expected.verify(&remote) => {},
            _ => exn::bail!(ErrorKind::VerificationMismatch(id.clone())),
        }

        abort_check()?;
        let promotion = match self.admit(id, blob).await {
            Ok(()) => Promotion::Cached,
            Err(err) if matches!(&*err, ErrorKind::CacheOverflow(_)) => {
                // The remote holds a verified copy, so nothing is lost by
                // leaving it out of the cache.
                tracing::warn!(id = %id, "Cache full of protected entries, promoted without caching");
                Promotion::Uncached
            },
            Err(err) => return Err(err),
        };
        storage(pending.name(), pending.delete(id).await)?;
        let state = &self.inner.state;
        state.set_pending(id, false);
        state.set_upload_error(id, None);
        state.set_missing(id, false);
        tracing::debug!(id = %id, "Promoted");
        Ok(promotion)
    }
}
