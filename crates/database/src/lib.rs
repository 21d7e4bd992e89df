//! SQLite byte store.
//!
//! Several logical stores (for example `pending` and `cache`) can share one
//! database file; every row is keyed by the store's name and the file id.
//! This is the embedded-database counterpart of the directory-backed
//! [`LocalStore`](stash_storage::backend::LocalStore).

mod db;
pub mod error;
mod models;
mod store;

pub use crate::db::Database;
pub use crate::store::SqliteStore;
