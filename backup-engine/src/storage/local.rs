//! Filesystem destination: objects are plain files under a root directory.

use super::keys::validate_key;
use super::{
    paginate, BackendKind, DeleteReport, DownloadOptions, ListOptions, ListPage, ObjectEntry,
    SignedOperation, StorageBackend, StorageError, UploadOptions, UploadReceipt,
};
use crate::transfer::ProgressReporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

const COPY_BUFFER: usize = 256 * 1024;
const PARTIAL_PREFIX: &str = ".partial-";

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Sibling temp file the payload is written to before the final rename.
    fn partial_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix: u32 = rand::random();
        target.with_file_name(format!("{PARTIAL_PREFIX}{suffix:08x}-{name}"))
    }

    async fn write_via_partial(
        &self,
        source: &Path,
        target: &Path,
        range: Option<(u64, u64)>,
        reporter: &mut ProgressReporter,
    ) -> Result<u64, StorageError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::local(parent, e))?;
        }
        let partial = Self::partial_path(target);
        let result = copy_file(source, &partial, range, reporter).await;
        let written = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&partial, target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::local(target, e));
        }
        Ok(written)
    }
}

/// Copy `source` (or `range` = (offset, length) of it) to `dest` in chunks.
async fn copy_file(
    source: &Path,
    dest: &Path,
    range: Option<(u64, u64)>,
    reporter: &mut ProgressReporter,
) -> Result<u64, StorageError> {
    let mut input = fs::File::open(source)
        .await
        .map_err(|e| StorageError::local(source, e))?;
    let mut output = fs::File::create(dest)
        .await
        .map_err(|e| StorageError::local(dest, e))?;

    let mut remaining = match range {
        Some((offset, length)) => {
            input
                .seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| StorageError::local(source, e))?;
            length
        }
        None => u64::MAX,
    };

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut written = 0u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = input
            .read(&mut buf[..want])
            .await
            .map_err(|e| StorageError::local(source, e))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(|e| StorageError::local(dest, e))?;
        written += n as u64;
        remaining -= n as u64;
        reporter.advance(n as u64);
    }
    output.flush().await.map_err(|e| StorageError::local(dest, e))?;
    output.sync_all().await.map_err(|e| StorageError::local(dest, e))?;
    Ok(written)
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        let target = self.resolve(key)?;
        let size = fs::metadata(local_path)
            .await
            .map_err(|e| StorageError::local(local_path, e))?
            .len();

        let mut reporter = ProgressReporter::new(options.progress.clone());
        let written = self
            .write_via_partial(local_path, &target, None, &mut reporter)
            .await?;
        reporter.finish();

        if written != size {
            tracing::warn!(key, expected = size, written, "Source changed size during upload");
        }

        tracing::debug!(key, bytes = written, "Stored object on local backend");
        Ok(UploadReceipt {
            key: key.to_string(),
            size: written,
            etag: None,
            parts: 1,
        })
    }

    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError> {
        let source = self.resolve(key)?;
        let meta = fs::metadata(&source)
            .await
            .map_err(|e| StorageError::from_remote_io(key, e))?;

        let range = options
            .range
            .map(|r| (r.start, r.length_within(meta.len())));
        let mut reporter = ProgressReporter::new(options.progress.clone());
        let written = self
            .write_via_partial(&source, local_path, range, &mut reporter)
            .await?;
        reporter.finish();
        Ok(written)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_remote_io(key, e)),
        }
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let entries = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            if !root.exists() {
                return entries;
            }
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PARTIAL_PREFIX)
                {
                    continue;
                }
                let Some(key) = key_for(&root, entry.path()) else {
                    continue;
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                let (size, last_modified) = match entry.metadata() {
                    Ok(meta) => (meta.len(), modified_at(&meta)),
                    Err(_) => continue,
                };
                entries.push(ObjectEntry {
                    key,
                    size,
                    last_modified,
                });
            }
            entries
        })
        .await
        .map_err(|e| StorageError::Backend(format!("listing task failed: {e}")))?;

        Ok(paginate(entries, options))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_remote_io(key, e)),
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        super::delete_in_batches(keys, 1000, |batch| async move {
            let mut report = DeleteReport::default();
            for key in batch {
                match self.delete(&key).await {
                    Ok(()) => report.deleted.push(key),
                    Err(e) => report.failed.push(super::DeleteFailure {
                        key,
                        message: e.to_string(),
                    }),
                }
            }
            Ok(report)
        })
        .await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        let source = self.resolve(src_key)?;
        let target = self.resolve(dst_key)?;
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StorageError::NotFound(src_key.to_string()));
        }
        let mut reporter = ProgressReporter::new(None);
        self.write_via_partial(&source, &target, None, &mut reporter)
            .await?;
        Ok(())
    }

    async fn move_object(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        let source = self.resolve(src_key)?;
        let target = self.resolve(dst_key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::local(parent, e))?;
        }
        match fs::rename(&source, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(src_key.to_string()))
            }
            // Cross-device renames fall back to copy + delete.
            Err(_) => {
                self.copy(src_key, dst_key).await?;
                self.delete(src_key).await
            }
        }
    }

    async fn signed_url(
        &self,
        _operation: SignedOperation,
        _key: &str,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        Err(StorageError::Unsupported {
            backend: "local",
            operation: "signed_url",
        })
    }

    async fn test_connection(&self) -> Result<bool, StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::from_remote_io(&self.root.display().to_string(), e))?;
        let marker = self.root.join(format!(".write-check-{:08x}", rand::random::<u32>()));
        fs::write(&marker, b"ok")
            .await
            .map_err(|e| StorageError::from_remote_io(&marker.display().to_string(), e))?;
        let _ = fs::remove_file(&marker).await;
        Ok(true)
    }
}
