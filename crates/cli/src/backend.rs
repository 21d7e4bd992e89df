//! Opening the stores and remote named in a [`Config`].

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use stash_config::{Config, RemoteConfig, StoreConfig};
use stash_database::{Database, SqliteStore};
use stash_engine::{Engine, Limits};
use stash_remote::{CacheableHandle, RemoteHandle, StoreRemote};
use stash_storage::StoreHandle;
use stash_storage::backend::LocalStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Backends {
    pub pending: StoreHandle,
    pub cache: StoreHandle,
    pub remote: RemoteHandle,
    pub cacheable: CacheableHandle,
}

impl Backends {
    pub async fn open(config: &Config) -> Result<Self> {
        // Stores pointing at the same SQLite file share one pool.
        let mut databases = HashMap::new();
        let pending = open_store("pending", &config.pending, &mut databases).await?;
        let cache = open_store("cache", &config.cache, &mut databases).await?;
        let (remote, cacheable) = open_remote(&config.remote)?;
        Ok(Self {
            pending,
            cache,
            remote,
            cacheable,
        })
    }

    pub async fn into_engine(self, config: &Config) -> Result<Engine> {
        let limits = Limits {
            max_cache: config.limits.max_cache,
            max_pending: config.limits.max_pending,
            max_recent: config.limits.max_recent,
            max_mounted: config.limits.max_mounted,
        };
        Engine::builder(self.pending, self.cache, self.remote)
            .cacheable(self.cacheable)
            .limits(limits)
            .online(config.online)
            .build()
            .await
            .or_raise(|| ErrorKind::Engine("could not start the engine"))
    }
}

async fn open_store(name: &str, config: &StoreConfig, databases: &mut HashMap<PathBuf, Database>) -> Result<StoreHandle> {
    let opening = || ErrorKind::Backend(format!("{name} store"));
    match config {
        StoreConfig::Local { path } => {
            let path = absolute(path)?;
            Ok(Arc::new(LocalStore::new(name, path).or_raise(opening)?))
        },
        StoreConfig::Sqlite { path } => {
            let path = absolute(path)?;
            let db = match databases.get(&path) {
                Some(db) => db.clone(),
                None => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .or_raise(|| ErrorKind::Io(parent.display().to_string()))?;
                    }
                    let db = Database::connect(&path).await.or_raise(opening)?;
                    databases.insert(path.clone(), db.clone());
                    db
                },
            };
            tracing::debug!(store = name, path = %path.display(), "Opened SQLite store");
            Ok(Arc::new(SqliteStore::new(&db, name)))
        },
    }
}

fn open_remote(config: &RemoteConfig) -> Result<(RemoteHandle, CacheableHandle)> {
    match config {
        RemoteConfig::Directory { path } => {
            let store = LocalStore::new("remote", absolute(path)?)
                .or_raise(|| ErrorKind::Backend("remote directory".to_string()))?;
            let remote = Arc::new(StoreRemote::new(Arc::new(store)));
            Ok((remote.clone() as RemoteHandle, remote as CacheableHandle))
        },
        #[cfg(feature = "s3")]
        RemoteConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
            key_id,
            key_secret,
        } => {
            let remote = stash_remote::S3Remote::new(
                "s3",
                bucket,
                prefix.clone(),
                region,
                endpoint.clone(),
                key_id,
                key_secret,
            )
            .or_raise(|| ErrorKind::Backend(format!("s3 bucket {bucket}")))?;
            let remote = Arc::new(remote);
            Ok((remote.clone() as RemoteHandle, remote as CacheableHandle))
        },
        #[cfg(not(feature = "s3"))]
        RemoteConfig::S3 { .. } => {
            exn::bail!(ErrorKind::Backend("s3 remote: built without the `s3` feature".to_string()))
        },
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).or_raise(|| ErrorKind::Io(path.display().to_string()))
}
