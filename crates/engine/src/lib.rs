//! Cache prioritization and synchronization engine.
//!
//! Every known [`FileId`](stash_storage::FileId) falls into overlapping
//! priority tiers: pending (local content awaiting upload), mounted (in use
//! right now), recent (mounted lately) and cacheable (suggested by the
//! remote). The [`Engine`] keeps the cache store within `max_cache` by
//! evicting only ids outside the first three tiers, uploads pending content
//! with verification before promoting it, refreshes the cache from the
//! remote, and exposes every id set and error map as an observable
//! [`watch`](tokio::sync::watch) channel.
//!
//! ```no_run
//! use stash_engine::{Engine, SyncOptions};
//! # async fn example(engine: Engine) -> stash_engine::error::Result<()> {
//! let guard = engine.register(stash_storage::FileId::new("avatar.png").unwrap());
//! engine.sync(SyncOptions::default()).await?;
//! guard.release();
//! # Ok(())
//! # }
//! ```

mod engine;
pub mod error;
mod eviction;
mod limiter;
mod limits;
mod live;
mod locks;
mod mount;
mod refresh;
mod state;
mod sync;
mod upload;

pub use crate::engine::{Engine, EngineBuilder};
pub use crate::eviction::select_victim;
pub use crate::limits::Limits;
pub use crate::mount::{MountGuard, MountTracker};
pub use crate::refresh::{FetchOutcome, FetchReport};
pub use crate::state::{ErrorMap, Snapshot};
pub use crate::sync::{Progress, ProgressFn, SyncEvent, SyncOptions, SyncReport};
pub use crate::upload::UploadReport;
