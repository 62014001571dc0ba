//! Uniform transfer abstraction over the supported destinations.
//!
//! A target picks exactly one [`BackendParams`] variant; [`open_backend`]
//! turns it into a shared [`StorageBackend`] once, when the target is loaded.
//! Callers go through [`retry::RetryingBackend`] so every operation gets the
//! same backoff behaviour.

pub mod error;
pub mod keys;
pub mod local;
pub mod multipart;
pub mod retry;
pub mod s3;
pub mod sftp;

pub use error::StorageError;
pub use retry::{RetryPolicy, RetryingBackend};

use crate::transfer::reporter::ProgressCallback;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default page size for `list` when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Local,
    Sync,
    ObjectStore,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Sync => "sync",
            BackendKind::ObjectStore => "object-store",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters, one variant per backend kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendParams {
    Local(LocalParams),
    Sync(SyncParams),
    ObjectStore(ObjectStoreParams),
}

impl BackendParams {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendParams::Local(_) => BackendKind::Local,
            BackendParams::Sync(_) => BackendKind::Sync,
            BackendParams::ObjectStore(_) => BackendKind::ObjectStore,
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        match self {
            BackendParams::Local(p) => {
                if p.root.as_os_str().is_empty() {
                    return Err(StorageError::Validation("local root must not be empty".into()));
                }
            }
            BackendParams::Sync(p) => {
                if p.host.is_empty() || p.username.is_empty() {
                    return Err(StorageError::Validation(
                        "sync backend requires host and username".into(),
                    ));
                }
                if p.password.is_none() && p.private_key_path.is_none() {
                    return Err(StorageError::Validation(
                        "sync backend requires a password or a private key".into(),
                    ));
                }
            }
            BackendParams::ObjectStore(p) => {
                if p.bucket.is_empty() {
                    return Err(StorageError::Validation("bucket must not be empty".into()));
                }
                if p.access_key_id.is_empty() || p.secret_access_key.is_empty() {
                    return Err(StorageError::Validation(
                        "object store requires access_key_id and secret_access_key".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalParams {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParams {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    pub base_path: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStoreParams {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// For MinIO, R2 and other S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_ssh_port() -> u16 { 22 }
fn default_connect_timeout_secs() -> u64 { 30 }
fn default_region() -> String { "us-east-1".into() }

/// Chunking parameters applied to large transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTuning {
    pub multipart_threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    pub max_parallel_chunks: usize,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            multipart_threshold_bytes: 64 * 1024 * 1024,
            chunk_size_bytes: 16 * 1024 * 1024,
            max_parallel_chunks: 4,
        }
    }
}

#[derive(Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("content_type", &self.content_type)
            .field("metadata", &self.metadata)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end; `None` reads to the end of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Number of bytes selected from an object of `size` bytes.
    pub fn length_within(&self, size: u64) -> u64 {
        if self.start >= size {
            return 0;
        }
        let end = self.end.map(|e| e.min(size - 1)).unwrap_or(size - 1);
        end.saturating_sub(self.start) + 1
    }

    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[derive(Clone, Default)]
pub struct DownloadOptions {
    pub range: Option<ByteRange>,
    pub progress: Option<ProgressCallback>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub max_keys: Option<usize>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Present when more entries remain.
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    /// Number of parts the payload was split into (1 for a single request).
    pub parts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

impl DeleteReport {
    fn absorb(&mut self, other: DeleteReport) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedOperation {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub total_count: u64,
}

/// Storage backend abstraction
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Upload a local file, splitting it into parts above the multipart
    /// threshold. A failed upload never leaves a partial object behind.
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError>;

    /// Stream an object (or a byte range of it) into a local file.
    /// Returns the number of bytes written.
    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError>;

    /// "Not found" is `Ok(false)`; any other failure is an error.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError>;

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError>;

    /// Copy then delete the source. If the delete fails the source stays in
    /// place next to the copy.
    async fn move_object(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        self.copy(src_key, dst_key).await?;
        self.delete(src_key).await
    }

    async fn signed_url(
        &self,
        operation: SignedOperation,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn test_connection(&self) -> Result<bool, StorageError>;

    async fn stats(&self, prefix: &str) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        let mut options = ListOptions::default();
        loop {
            let page = self.list(prefix, &options).await?;
            for entry in &page.entries {
                stats.total_bytes += entry.size;
                stats.total_count += 1;
            }
            match page.continuation_token {
                Some(token) => options.continuation_token = Some(token),
                None => break,
            }
        }
        Ok(stats)
    }
}

/// Build the backend for a target. Called once per target load.
pub async fn open_backend(
    params: &BackendParams,
    tuning: TransferTuning,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    params.validate()?;
    let backend: Arc<dyn StorageBackend> = match params {
        BackendParams::Local(p) => Arc::new(local::LocalBackend::new(p.root.clone())),
        BackendParams::Sync(p) => Arc::new(sftp::SyncBackend::new(p.clone())),
        BackendParams::ObjectStore(p) => Arc::new(s3::S3Backend::new(p.clone(), tuning).await?),
    };
    tracing::debug!(kind = %params.kind(), "Storage backend opened");
    Ok(backend)
}

/// Send `keys` in requests of at most `limit` keys and merge the per-key
/// outcomes. Duplicate keys are sent once. A request-level error stops the
/// walk and is returned as-is.
pub async fn delete_in_batches<F, Fut>(
    keys: &[String],
    limit: usize,
    mut send: F,
) -> Result<DeleteReport, StorageError>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<DeleteReport, StorageError>>,
{
    let mut seen = HashSet::with_capacity(keys.len());
    let unique: Vec<String> = keys
        .iter()
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect();

    let mut report = DeleteReport::default();
    for batch in unique.chunks(limit.max(1)) {
        report.absorb(send(batch.to_vec()).await?);
    }
    Ok(report)
}

/// Key-ordered pagination over a fully materialized listing, used by the
/// path-based backends. The continuation token is the last key returned.
pub(crate) fn paginate(mut entries: Vec<ObjectEntry>, options: &ListOptions) -> ListPage {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    let page_size = options.max_keys.unwrap_or(DEFAULT_PAGE_SIZE).max(1);

    let start = match &options.continuation_token {
        Some(token) => entries.partition_point(|e| e.key.as_str() <= token.as_str()),
        None => 0,
    };
    let remaining = entries.len().saturating_sub(start);
    let page: Vec<ObjectEntry> = entries.into_iter().skip(start).take(page_size).collect();

    let continuation_token = if remaining > page.len() {
        page.last().map(|e| e.key.clone())
    } else {
        None
    };

    ListPage {
        entries: page,
        continuation_token,
    }
}
