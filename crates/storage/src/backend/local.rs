//! Local filesystem byte store.
//!
//! Each slot is one file inside the store's root directory. The file name is
//! the hex SHA-256 of the [`FileId`], which keeps names safe and short for
//! any id. The content is a single JSON header line, carrying the real id,
//! followed by the raw bytes.

use crate::ByteStore;
use crate::digest::sha256_hex;
use crate::error::{ErrorKind, Result};
use crate::models::{BlobRecord, FileId, Slot};
use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all as sync_create_dir, read_dir as sync_read_dir, remove_file as sync_remove_file};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::UtcDateTime;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};

const EXTENSION: &str = "blob";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    id: FileId,
    /// `None` marks a tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
    /// Write stamp (nanoseconds since the epoch, strictly increasing within
    /// one process) used for enumeration order.
    written: u64,
}

/// Local filesystem byte store.
///
/// # Examples
///
/// ```no_run
/// use stash_storage::backend::LocalStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalStore::new("pending", "/var/lib/stash/pending")?;
/// # Ok(())
/// # }
/// ```
pub struct LocalStore {
    name: String,
    root: PathBuf,
    last_written: AtomicU64,
}
impl LocalStore {
    /// Create a new local store rooted at `root`.
    ///
    /// The directory is created if missing. Temporary files left behind by
    /// interrupted writes are removed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidRoot`](ErrorKind::InvalidRoot) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidRoot(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidRoot(root));
            }
        } else {
            // Use non-async here; it'll only happen once on startup and it's
            // not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        let store = Self {
            name: name.into(),
            root,
            last_written: AtomicU64::new(0),
        };
        store.cleanup();
        Ok(store)
    }

    fn cleanup(&self) {
        let Ok(entries) = sync_read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                tracing::debug!(store = %self.name, path = %path.display(), "Removing stale temp file");
                _ = sync_remove_file(&path);
            }
        }
    }

    fn entry_path(&self, id: &FileId) -> PathBuf {
        self.root.join(format!("{}.{EXTENSION}", sha256_hex(id.as_str().as_bytes())))
    }

    fn next_stamp(&self) -> u64 {
        let now = u64::try_from(UtcDateTime::now().unix_timestamp_nanos()).unwrap_or(0);
        let previous = self
            .last_written
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            // Infallible: the closure always returns Some.
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    fn decode(id: &FileId, raw: &[u8]) -> Result<Slot> {
        let Some(split) = raw.iter().position(|b| *b == b'\n') else {
            exn::bail!(ErrorKind::Corrupt(format!("missing header for {id}")));
        };
        let header: Header =
            serde_json::from_slice(&raw[..split]).or_raise(|| ErrorKind::Corrupt(format!("bad header for {id}")))?;
        if &header.id != id {
            exn::bail!(ErrorKind::Corrupt(format!("entry for {id} belongs to {}", header.id)));
        }
        Ok(match header.mime_type {
            Some(mime_type) => Slot::Present(BlobRecord::new(mime_type, raw[split + 1..].to_vec())),
            None => Slot::Tombstone,
        })
    }

    async fn read_header(path: &Path) -> Result<Header> {
        let file = fs::File::open(path).await.map_err(|e| Self::map_io_error(e, path))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line).await.map_err(|e| Self::map_io_error(e, path))?;
        serde_json::from_str(&line).or_raise(|| ErrorKind::Corrupt(format!("bad header in {}", path.display())))
    }

    fn is_entry(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == EXTENSION)
    }
}

#[async_trait]
impl ByteStore for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &FileId) -> Result<Option<Slot>> {
        let path = self.entry_path(id);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        };
        Self::decode(id, &raw).map(Some)
    }

    async fn set(&self, id: &FileId, slot: Slot) -> Result<Slot> {
        let stamp = self.next_stamp();
        let header = Header {
            id: id.clone(),
            mime_type: slot.blob().map(|blob| blob.mime_type.clone()),
            written: stamp,
        };
        let mut raw = serde_json::to_vec(&header).or_raise(|| ErrorKind::Corrupt(format!("unencodable header for {id}")))?;
        raw.push(b'\n');
        if let Some(blob) = slot.blob() {
            raw.extend_from_slice(&blob.bytes);
        }
        let path = self.entry_path(id);
        // Write-then-rename so readers never observe a half-written entry.
        let temp = path.with_extension(format!("{stamp}.{TEMP_EXTENSION}"));
        fs::write(&temp, &raw).await.map_err(|e| Self::map_io_error(e, &temp))?;
        if let Err(e) = fs::rename(&temp, &path).await {
            _ = fs::remove_file(&temp).await;
            exn::bail!(Self::map_io_error(e, &path));
        }
        tracing::trace!(store = %self.name, id = %id, bytes = raw.len(), "Wrote slot");
        Ok(slot)
    }

    async fn delete(&self, id: &FileId) -> Result<()> {
        let path = self.entry_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        }
    }

    async fn list_ids(&self) -> Result<Vec<FileId>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| Self::map_io_error(e, &self.root))?;
        let mut headers = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &self.root))? {
            let path = entry.path();
            if !Self::is_entry(&path) {
                continue;
            }
            match Self::read_header(&path).await {
                Ok(header) => headers.push(header),
                // Deleted between read_dir and open.
                Err(e) if matches!(&*e, ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound) => {},
                Err(e) => return Err(e),
            }
        }
        headers.sort_by(|a, b| b.written.cmp(&a.written).then_with(|| a.id.cmp(&b.id)));
        Ok(headers.into_iter().map(|header| header.id).collect())
    }

    async fn reset(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| Self::map_io_error(e, &self.root))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::map_io_error(e, &self.root))? {
            let path = entry.path();
            if Self::is_entry(&path) {
                match fs::remove_file(&path).await {
                    Ok(()) => {},
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => exn::bail!(Self::map_io_error(e, &path)),
                }
            }
        }
        Ok(())
    }

    async fn contains(&self, id: &FileId) -> Result<bool> {
        fs::try_exists(self.entry_path(id)).await.map_err(|e| exn::Exn::from(ErrorKind::Io(e)))
    }
}
