use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use stash_engine::error::ErrorKind as EngineErrorKind;
use stash_engine::{Engine, FetchOutcome, Progress, SyncOptions, SyncReport};
use stash_storage::{BlobRecord, FileId};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

fn file_id(id: &str) -> Result<FileId> {
    FileId::new(id).or_raise(|| ErrorKind::InvalidId(id.to_string()))
}

pub async fn sync(engine: &Engine, pull: bool, concurrency: usize) -> Result<()> {
    let token = CancellationToken::new();
    let interrupt = tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, waiting for in-flight transfers");
                token.cancel();
            }
        }
    });
    let options = SyncOptions {
        token,
        on_progress: Some(Box::new(|progress: Progress| {
            tracing::info!(completed = progress.completed, total = progress.total, "Sync progress");
        })),
        pull,
        concurrency,
    };
    let result = engine.sync(options).await;
    interrupt.abort();
    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        },
        Err(err) => {
            if let EngineErrorKind::Partial(partial) = &*err {
                println!("{} item(s) synced, {} failed:", partial.succeeded.len(), partial.failures.len());
                for failure in &partial.failures {
                    println!("  {failure}");
                }
            }
            Err(err).or_raise(|| ErrorKind::Engine("sync failed"))
        },
    }
}

fn print_report(report: &SyncReport) {
    println!("uploaded: {}", report.upload.promoted.len() + report.upload.uncached.len());
    if !report.upload.uncached.is_empty() {
        println!("  not cached (no evictable entry): {}", join(report.upload.uncached.iter()));
    }
    if let Some(refresh) = &report.refresh {
        println!("fetched: {}", refresh.with_outcome(FetchOutcome::Cached).len());
        println!("evicted: {}", refresh.evicted.len());
        let missing = refresh.with_outcome(FetchOutcome::Missing);
        if !missing.is_empty() {
            println!("  missing on remote: {}", join(missing.into_iter()));
        }
    }
}

pub fn status(engine: &Engine) {
    let snapshot = engine.snapshot();
    let limits = engine.limits();
    println!("online: {}", snapshot.online);
    println!("pending: {}/{}", snapshot.pending.len(), limits.max_pending);
    for id in &snapshot.pending {
        println!("  {id}");
    }
    println!("cached: {}/{}", snapshot.cached.len(), limits.max_cache);
    for id in &snapshot.cached {
        println!("  {id}");
    }
}

pub async fn put(engine: &Engine, id: &str, file: &Path, mime_type: Option<String>) -> Result<()> {
    let id = file_id(id)?;
    let bytes = tokio::fs::read(file).await.or_raise(|| ErrorKind::Io(file.display().to_string()))?;
    let blob = BlobRecord::new(mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()), bytes);
    let size = blob.len();
    engine
        .put_pending(&id, blob)
        .await
        .or_raise(|| ErrorKind::Engine("could not stage content"))?;
    tracing::info!(id = %id, size, "Staged for upload");
    Ok(())
}

pub async fn get(engine: &Engine, id: &str, output: Option<&Path>) -> Result<()> {
    let id = file_id(id)?;
    let blob = engine
        .get(&id)
        .await
        .or_raise(|| ErrorKind::Engine("could not read content"))?
        .ok_or_raise(|| ErrorKind::NotFound(id.to_string()))?;
    match output {
        Some(path) => {
            tokio::fs::write(path, &blob.bytes)
                .await
                .or_raise(|| ErrorKind::Io(path.display().to_string()))?;
            tracing::info!(id = %id, mime_type = %blob.mime_type, path = %path.display(), "Written");
        },
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&blob.bytes).await.or_raise(|| ErrorKind::Io("stdout".to_string()))?;
            stdout.flush().await.or_raise(|| ErrorKind::Io("stdout".to_string()))?;
        },
    }
    Ok(())
}

pub async fn delete(engine: &Engine, id: &str) -> Result<()> {
    let id = file_id(id)?;
    engine.delete(&id).await.or_raise(|| ErrorKind::Engine("could not delete content"))
}

pub async fn reset(engine: &Engine) -> Result<()> {
    engine.reset().await.or_raise(|| ErrorKind::Engine("could not reset"))?;
    tracing::info!("Pending and cache stores cleared");
    Ok(())
}

fn join<'a>(ids: impl Iterator<Item = &'a FileId>) -> String {
    ids.map(FileId::as_str).collect::<Vec<_>>().join(", ")
}
