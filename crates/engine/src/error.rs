//! Engine Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Batch passes are fail-slow: per-item failures are collected into
//! [`ItemFailure`]s, recorded in the engine's error maps and raised together
//! as one [`Partial`](ErrorKind::Partial) error once every admitted item has
//! finished. [`CacheOverflow`](ErrorKind::CacheOverflow),
//! [`StorageUnavailable`](ErrorKind::StorageUnavailable) and
//! [`Aborted`](ErrorKind::Aborted) stop the operation immediately.

use derive_more::{Display, Error};
use exn::ResultExt;
use stash_storage::FileId;
use std::fmt;

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// ### Fatal to the triggering operation
/// - [`ErrorKind::CacheOverflow`]
/// - [`ErrorKind::PendingFull`]
/// - [`ErrorKind::StorageUnavailable`]
/// - [`ErrorKind::Aborted`]
/// - [`ErrorKind::InvalidLimits`]
///
/// ### Per item, aggregated into [`ErrorKind::Partial`]
/// - [`ErrorKind::VerificationMismatch`]
/// - [`ErrorKind::Transfer`]
/// - [`ErrorKind::NotFound`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Every cached id is protected, so there is no room for another one.
    #[display("cache is full of protected entries, cannot add {_0}")]
    CacheOverflow(#[error(not(source))] FileId),
    /// The pending store already holds its maximum number of entries.
    #[display("pending store is full, cannot add {_0}")]
    PendingFull(#[error(not(source))] FileId),
    /// The re-downloaded copy does not match what was uploaded. The id stays
    /// pending.
    #[display("remote copy of {_0} does not match the uploaded content")]
    VerificationMismatch(#[error(not(source))] FileId),
    /// The remote collaborator failed. Retryable.
    #[display("transfer of {id} failed: {message}")]
    Transfer { id: FileId, message: String },
    /// A pending id had no content to upload.
    #[display("{_0} has no pending content")]
    NotFound(#[error(not(source))] FileId),
    /// The named byte store could not be read or written.
    #[display("store {_0} is unavailable")]
    StorageUnavailable(#[error(not(source))] String),
    /// Cancellation was observed.
    #[display("operation aborted")]
    Aborted,
    /// Some items of a batch pass failed; the others took effect.
    #[display("{_0}")]
    Partial(#[error(not(source))] PartialFailure),
    /// The limits cannot be satisfied together, e.g. a zero-sized cache or a
    /// recent queue longer than the cache.
    #[display("invalid limits: {_0}")]
    InvalidLimits(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { .. } | Self::VerificationMismatch(_) | Self::StorageUnavailable(_) => true,
            Self::Partial(partial) => partial.failures.iter().any(|f| f.kind.is_retryable()),
            _ => false,
        }
    }

    /// Whether this error stops a batch pass instead of being recorded
    /// against a single item.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, Self::CacheOverflow(_) | Self::StorageUnavailable(_) | Self::Aborted)
    }
}

/// Category of one per-item failure.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    #[display("not found")]
    NotFound,
    #[display("verification mismatch")]
    VerificationMismatch,
    #[display("transfer")]
    Transfer,
    /// The cacheable-id provider could not be queried.
    #[display("listing")]
    Listing,
}
impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// `None` for failures that are not tied to one id, such as a failed
    /// cacheable-id listing.
    pub id: Option<FileId>,
    pub kind: FailureKind,
    pub message: String,
}
impl ItemFailure {
    pub(crate) fn from_error(id: &FileId, err: &ErrorKind) -> Self {
        let kind = match err {
            ErrorKind::NotFound(_) => FailureKind::NotFound,
            ErrorKind::VerificationMismatch(_) => FailureKind::VerificationMismatch,
            _ => FailureKind::Transfer,
        };
        Self {
            id: Some(id.clone()),
            kind,
            message: err.to_string(),
        }
    }
}
impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{id}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// The aggregate error of one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialFailure {
    /// Ids that took effect despite the failures.
    pub succeeded: Vec<FileId>,
    pub failures: Vec<ItemFailure>,
}
impl PartialFailure {
    /// The failure recorded for `id`, if any.
    pub fn failure(&self, id: &FileId) -> Option<&ItemFailure> {
        self.failures.iter().find(|f| f.id.as_ref() == Some(id))
    }
}
impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            write!(f, "{} {failure}", if i == 0 { ":" } else { ";" })?;
        }
        Ok(())
    }
}

/// Wrap a byte store failure.
pub(crate) fn storage<T>(store: &str, result: stash_storage::error::Result<T>) -> Result<T> {
    result.or_raise(|| ErrorKind::StorageUnavailable(store.to_string()))
}

/// Wrap a remote failure, keeping its message for the error maps.
pub(crate) fn transfer<T>(id: &FileId, result: stash_remote::error::Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            let message = (*err).to_string();
            Err(err).or_raise(|| ErrorKind::Transfer { id: id.clone(), message })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> FileId {
        FileId::new(s).unwrap()
    }

    #[test]
    fn test_partial_display() {
        let partial = PartialFailure {
            succeeded: vec![id("x")],
            failures: vec![
                ItemFailure::from_error(&id("y"), &ErrorKind::NotFound(id("y"))),
                ItemFailure {
                    id: None,
                    kind: FailureKind::Listing,
                    message: "listing failed".to_string(),
                },
            ],
        };
        assert_eq!(partial.to_string(), "2 item(s) failed: y: y has no pending content; listing failed");
        assert_eq!(partial.failure(&id("y")).unwrap().kind, FailureKind::NotFound);
        assert!(partial.failure(&id("x")).is_none());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::Aborted.is_fatal());
        assert!(ErrorKind::StorageUnavailable("cache".to_string()).is_fatal());
        assert!(ErrorKind::CacheOverflow(id("a")).is_fatal());
        assert!(!ErrorKind::VerificationMismatch(id("a")).is_fatal());
        assert!(!ErrorKind::NotFound(id("a")).is_fatal());
    }

    #[test]
    fn test_retryable() {
        let transient = ErrorKind::Partial(PartialFailure {
            succeeded: vec![],
            failures: vec![ItemFailure::from_error(
                &id("y"),
                &ErrorKind::Transfer {
                    id: id("y"),
                    message: "timeout".to_string(),
                },
            )],
        });
        assert!(transient.is_retryable());
        assert!(!ErrorKind::Aborted.is_retryable());
        assert!(!ErrorKind::CacheOverflow(id("a")).is_retryable());
    }
}
