//! S3-compatible remote.
//!
//! Works with AWS S3 and S3-compatible services (Backblaze B2, Tigris,
//! MinIO, ...). Each file id is one object under an optional key prefix.
//!
//! # Object layout
//!
//! - The body holds the raw bytes and `Content-Type` holds the MIME type.
//! - `x-amz-meta-sha256` holds the hex SHA-256 of the body, checked on every
//!   download.
//! - A deleted file is an empty object carrying `x-amz-meta-tombstone: true`.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file
//! (`key_id` and `key_secret`).

use crate::error::{ErrorKind, Result};
use crate::{CacheableIds, Fetched, RemoteTransfer};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
};
use exn::ResultExt;
use stash_storage::digest::sha256_hex;
use stash_storage::{BlobRecord, FileId};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
const META_SHA256: &str = "sha256";
const META_TOMBSTONE: &str = "tombstone";
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// S3-compatible remote.
///
/// # Examples
///
/// ```no_run
/// use stash_remote::S3Remote;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let remote = S3Remote::new(
///     "backblaze",
///     "my-bucket",
///     Some("stash/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Remote {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Remote {
    /// Create a new S3 remote.
    ///
    /// # Arguments
    /// * `name` - A name for this remote (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            exn::bail!(ErrorKind::InvalidConfig("bucket name is empty".to_string()));
        }
        let prefix = prefix.map(|p| p.trim_matches('/').to_string()).filter(|p| !p.is_empty());
        let credentials = Credentials::new(key_id, key_secret, None, None, "stash-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket,
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    fn full_key(prefix: Option<&str>, id: &FileId) -> String {
        match prefix {
            Some(prefix) => format!("{prefix}/{id}"),
            None => id.to_string(),
        }
    }

    fn relative_id(prefix: Option<&str>, key: &str) -> Option<FileId> {
        let relative = match prefix {
            Some(prefix) => key.strip_prefix(prefix)?.strip_prefix('/')?,
            None => key,
        };
        FileId::new(relative).ok()
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::Transfer(format!("rate limiter for {} closed", self.name)))
    }

    fn classify<E: ProvideErrorMetadata, R>(&self, err: &SdkError<E, R>, action: &str, id: &str) -> ErrorKind {
        let context = format!("{action} {id} on {}", self.name);
        match err.code() {
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => ErrorKind::NotAuthorized(context),
            Some("NoSuchBucket") => ErrorKind::InvalidConfig(context),
            _ => ErrorKind::Transfer(context),
        }
    }

    async fn put(&self, id: &FileId, mime_type: &str, bytes: Vec<u8>, tombstone: bool) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        let key = Self::full_key(self.prefix.as_deref(), id);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(mime_type)
            .metadata(META_SHA256, sha256_hex(&bytes));
        if tombstone {
            request = request.metadata(META_TOMBSTONE, "true");
        }
        request
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| self.classify(&e, "upload", id.as_str()))?;
        Ok(())
    }

    /// Record a remote deletion of `id`.
    pub async fn delete(&self, id: &FileId) -> Result<()> {
        self.put(id, FALLBACK_MIME_TYPE, Vec::new(), true).await
    }
}

#[async_trait]
impl RemoteTransfer for S3Remote {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, id: &FileId, blob: &BlobRecord) -> Result<()> {
        self.put(id, &blob.mime_type, blob.bytes.clone(), false).await?;
        tracing::debug!(remote = %self.name, id = %id, bytes = blob.len(), "Uploaded object");
        Ok(())
    }

    async fn download(&self, id: &FileId) -> Result<Fetched> {
        let _permit = self.acquire_permit().await?;
        let key = Self::full_key(self.prefix.as_deref(), id);
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => return Ok(Fetched::NotFound),
            Err(e) => exn::bail!(self.classify(&e, "download", id.as_str())),
        };
        let metadata = output.metadata().cloned().unwrap_or_default();
        if metadata.get(META_TOMBSTONE).is_some_and(|v| v == "true") {
            return Ok(Fetched::Tombstone);
        }
        let mime_type = output.content_type().unwrap_or(FALLBACK_MIME_TYPE).to_string();
        let bytes = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Transfer(format!("read body of {id} from {}", self.name)))?
            .into_bytes()
            .to_vec();
        if let Some(expected) = metadata.get(META_SHA256) {
            let actual = sha256_hex(&bytes);
            if &actual != expected {
                exn::bail!(ErrorKind::Integrity(format!("{id}: expected sha256 {expected}, received {actual}")));
            }
        }
        Ok(Fetched::Present(BlobRecord::new(mime_type, bytes)))
    }
}

#[async_trait]
impl CacheableIds for S3Remote {
    /// Objects ordered by last modification, newest first. Tombstones are
    /// included (the listing does not carry metadata); downloading them
    /// reports [`Fetched::Tombstone`].
    async fn cacheable_ids(&self, max: usize) -> Result<Option<Vec<FileId>>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let _permit = self.acquire_permit().await?;
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = &self.prefix {
                request = request.prefix(format!("{prefix}/"));
            }
            let output = request
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| self.classify(&e, "list", self.prefix.as_deref().unwrap_or("/")))?;
            for object in output.contents() {
                let Some(id) = object.key().and_then(|key| Self::relative_id(self.prefix.as_deref(), key)) else {
                    continue;
                };
                let modified = object.last_modified().map(|dt| dt.as_nanos()).unwrap_or_default();
                objects.push((modified, id));
            }
            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        objects.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(Some(objects.into_iter().take(max).map(|(_, id)| id).collect()))
    }
}
