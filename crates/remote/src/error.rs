//! Remote Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A remote error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Network or transport failure, including timeouts. Try again later.
    #[display("transfer failed: {_0}")]
    Transfer(#[error(not(source))] String),
    /// The remote recorded a digest that the received bytes do not match.
    #[display("integrity check failed: {_0}")]
    Integrity(#[error(not(source))] String),
    /// Credentials were rejected.
    #[display("not authorized: {_0}")]
    NotAuthorized(#[error(not(source))] String),
    /// The remote is misconfigured (bucket, prefix, endpoint, ...)
    #[display("invalid remote configuration: {_0}")]
    InvalidConfig(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Integrity(_))
    }
}
