//! Blob model and byte stores.
//!
//! Everything the synchronization engine persists goes through a
//! [`ByteStore`]: a flat key/value store from [`FileId`] to a [`Slot`]. A
//! slot is either a present [`BlobRecord`] or a [tombstone](Slot::Tombstone),
//! and a store must keep "never written" distinct from "explicitly deleted".

pub mod backend;
pub mod digest;
pub mod error;
mod models;

pub use crate::backend::ByteStore;
pub use crate::digest::Digest;
pub use crate::models::{BlobRecord, FileId, Slot};
use std::sync::Arc;

pub type StoreHandle = Arc<dyn ByteStore + Send + Sync>;
