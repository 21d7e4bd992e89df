//! Storage models.
//!
//! These types are shared by every store implementation, the remote
//! collaborators and the synchronization engine.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Opaque identifier of one logical file.
///
/// Identifiers are compared byte-for-byte; the only validation applied is
/// that they are not empty.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);
impl FileId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            exn::bail!(ErrorKind::InvalidId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl TryFrom<String> for FileId {
    type Error = ErrorKind;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.is_empty() {
            true => Err(ErrorKind::InvalidId(value)),
            false => Ok(Self(value)),
        }
    }
}
impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}
impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
impl Borrow<str> for FileId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The binary content unit: bytes plus the MIME type they were stored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}
impl BlobRecord {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A materialized store slot.
///
/// Absence ("never written") is represented by the *lack* of a slot, i.e.
/// `Option<Slot>::None`, so that it can never be confused with a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Present(BlobRecord),
    /// Explicitly known to be deleted.
    Tombstone,
}
impl Slot {
    pub fn blob(&self) -> Option<&BlobRecord> {
        match self {
            Self::Present(blob) => Some(blob),
            Self::Tombstone => None,
        }
    }

    pub fn into_blob(self) -> Option<BlobRecord> {
        match self {
            Self::Present(blob) => Some(blob),
            Self::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}
impl From<BlobRecord> for Slot {
    fn from(blob: BlobRecord) -> Self {
        Self::Present(blob)
    }
}
