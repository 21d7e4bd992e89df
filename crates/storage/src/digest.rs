//! Content fingerprints.
//!
//! A [`Digest`] identifies the exact content of a [`BlobRecord`] so that two
//! copies can be compared without transferring the bytes again.

use crate::models::BlobRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub mime_type: String,
    pub size_bytes: u64,
    /// Lowercase hex-encoded SHA-256 of the bytes.
    pub sha256_hex: String,
}
impl Digest {
    pub fn of(blob: &BlobRecord) -> Self {
        Self {
            mime_type: blob.mime_type.clone(),
            // Infallible: a usize (either 32- or 64-bit) will always fit in a u64.
            size_bytes: u64::try_from(blob.bytes.len()).unwrap_or(u64::MAX),
            sha256_hex: sha256_hex(&blob.bytes),
        }
    }

    /// Whether `blob` is byte-for-byte the content this digest describes.
    ///
    /// The size is compared first so that a truncated transfer is rejected
    /// without hashing.
    pub fn verify(&self, blob: &BlobRecord) -> bool {
        u64::try_from(blob.bytes.len()).is_ok_and(|len| len == self.size_bytes)
            && blob.mime_type == self.mime_type
            && sha256_hex(&blob.bytes) == self.sha256_hex
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
