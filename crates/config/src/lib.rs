//! Layered configuration for stash.
//!
//! Sources are merged in order, later ones winning:
//! 1. built-in defaults,
//! 2. a TOML, YAML or JSON file (chosen by extension),
//! 3. `STASH_*` environment variables, with `__` separating nested keys
//!    (`STASH_LIMITS__MAX_CACHE=128`).
//!
//! ```toml
//! online = true
//!
//! [limits]
//! max_cache = 128
//!
//! [pending]
//! type = "sqlite"
//! path = "/var/lib/stash/stash.db"
//!
//! [remote]
//! type = "s3"
//! bucket = "media"
//! region = "eu-central-1"
//! key_id = "..."
//! key_secret = "..."
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "STASH_";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether live fetching of mounted ids starts enabled.
    pub online: bool,
    pub limits: LimitsConfig,
    pub sync: SyncConfig,
    pub pending: StoreConfig,
    pub cache: StoreConfig,
    pub remote: RemoteConfig,
}
impl Default for Config {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            online: true,
            limits: LimitsConfig::default(),
            sync: SyncConfig::default(),
            pending: StoreConfig::Local {
                path: data.join("pending"),
            },
            cache: StoreConfig::Local {
                path: data.join("cache"),
            },
            remote: RemoteConfig::Directory {
                path: data.join("remote"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_cache: usize,
    pub max_pending: usize,
    pub max_recent: usize,
    pub max_mounted: usize,
}
impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_cache: 64,
            max_pending: 64,
            max_recent: 16,
            max_mounted: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Transfers in flight per pass.
    pub concurrency: usize,
    /// Refresh the cache after uploading.
    pub pull: bool,
}
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            pull: true,
        }
    }
}

/// Where a local byte store keeps its slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// One file per id inside a directory.
    Local { path: PathBuf },
    /// A table inside a SQLite database file. Several stores may share one
    /// file.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteConfig {
    /// A directory standing in for the remote, e.g. a network share.
    Directory { path: PathBuf },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

impl Config {
    /// Load configuration from the given file, or from the default location
    /// when `path` is `None`. A missing default file is not an error.
    #[tracing::instrument]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.exists() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|path| path.exists()),
        };
        let figment = Self::figment(file.as_deref())?;
        let config = Self::from_figment(&figment)?;
        tracing::debug!(file = ?file, "Configuration loaded");
        Ok(config)
    }

    /// The layered provider chain, exposed so callers can merge their own
    /// overrides on top.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            let extension = file.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR)))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().map_err(|err| ErrorKind::Load(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_cache == 0 {
            exn::bail!(ErrorKind::Invalid("limits.max_cache must be at least 1"));
        }
        if self.limits.max_recent > self.limits.max_cache {
            exn::bail!(ErrorKind::Invalid("limits.max_recent must not exceed limits.max_cache"));
        }
        if self.sync.concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("sync.concurrency must be at least 1"));
        }
        if let (StoreConfig::Local { path: pending }, StoreConfig::Local { path: cache }) = (&self.pending, &self.cache)
            && pending == cache
        {
            exn::bail!(ErrorKind::Invalid("pending and cache must not share a local directory"));
        }
        if let RemoteConfig::S3 { bucket, .. } = &self.remote
            && bucket.is_empty()
        {
            exn::bail!(ErrorKind::Invalid("remote.bucket must not be empty"));
        }
        Ok(())
    }
}

/// `<config dir>/stash/config.toml`, if the platform has a config directory.
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("stash"))
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "stash")
}
