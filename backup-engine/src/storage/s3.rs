//! S3-compatible object store destination (AWS, MinIO, R2, ...).

use super::multipart::{needs_multipart, plan_parts, PartPlan, S3_MAX_PARTS, S3_MIN_PART_SIZE};
use super::{
    delete_in_batches, BackendKind, DeleteFailure, DeleteReport, DownloadOptions, ListOptions,
    ListPage, ObjectEntry, ObjectStoreParams, SignedOperation, StorageBackend, StorageError,
    TransferTuning, UploadOptions, UploadReceipt, DEFAULT_PAGE_SIZE,
};
use crate::transfer::ProgressReporter;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// DeleteObjects accepts at most 1000 keys per request.
const DELETE_BATCH: usize = 1000;

pub struct S3Backend {
    client: Client,
    bucket: String,
    tuning: TransferTuning,
}

impl S3Backend {
    pub async fn new(params: ObjectStoreParams, tuning: TransferTuning) -> Result<Self, StorageError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(params.region.clone()));
        if let Some(endpoint) = &params.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).credentials_provider(
            aws_sdk_s3::config::Credentials::new(
                &params.access_key_id,
                &params.secret_access_key,
                params.session_token.clone(),
                None,
                "backup-engine",
            ),
        );
        if params.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: params.bucket,
            tuning,
        })
    }

    async fn put_single(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| local_stream_error(local_path, e))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_content_type(options.content_type.clone());
        if !options.metadata.is_empty() {
            request = request.set_metadata(Some(options.metadata.clone()));
        }
        let output = request.send().await.map_err(|e| classify(key, e))?;

        let mut reporter = ProgressReporter::new(options.progress.clone());
        reporter.advance(size);
        reporter.finish();

        Ok(UploadReceipt {
            key: key.to_string(),
            size,
            etag: output.e_tag().map(str::to_string),
            parts: 1,
        })
    }

    async fn put_multipart(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(options.content_type.clone());
        if !options.metadata.is_empty() {
            request = request.set_metadata(Some(options.metadata.clone()));
        }
        let created = request.send().await.map_err(|e| classify(key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Backend(format!("{key}: no upload id returned")))?
            .to_string();

        let chunk = self.tuning.chunk_size_bytes.max(S3_MIN_PART_SIZE);
        let parts = plan_parts(size, chunk, S3_MAX_PARTS);
        let part_count = parts.len() as u32;

        let session = BucketUpload {
            client: &self.client,
            bucket: &self.bucket,
            key,
            upload_id,
            local_path,
        };
        let reporter = Mutex::new(ProgressReporter::new(options.progress.clone()));
        let etag = drive_multipart(&session, parts, self.tuning.max_parallel_chunks, &reporter).await?;
        if let Ok(r) = reporter.into_inner() {
            r.finish();
        }

        Ok(UploadReceipt {
            key: key.to_string(),
            size,
            etag,
            parts: part_count,
        })
    }
}

/// The steps of one multipart upload after it has been created.
#[async_trait]
trait MultipartSession: Send + Sync {
    async fn upload_part(&self, part: PartPlan) -> Result<CompletedPart, StorageError>;

    /// Returns the ETag of the assembled object.
    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<Option<String>, StorageError>;

    async fn abort(&self);
}

struct BucketUpload<'a> {
    client: &'a Client,
    bucket: &'a str,
    key: &'a str,
    upload_id: String,
    local_path: &'a Path,
}

#[async_trait]
impl MultipartSession for BucketUpload<'_> {
    async fn upload_part(&self, part: PartPlan) -> Result<CompletedPart, StorageError> {
        let body = ByteStream::read_from()
            .path(self.local_path)
            .offset(part.offset)
            .length(Length::Exact(part.length))
            .build()
            .await
            .map_err(|e| local_stream_error(self.local_path, e))?;
        let output = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .part_number(part.number as i32)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(self.key, e))?;
        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part.number as i32)
            .build())
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<Option<String>, StorageError> {
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| classify(self.key, e))?;
        Ok(output.e_tag().map(str::to_string))
    }

    async fn abort(&self) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(
                key = self.key,
                upload_id = %self.upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        }
    }
}

/// Upload every part, at most `max_parallel` at a time, then complete the
/// upload with the parts in order. Any failure aborts the upload.
async fn drive_multipart(
    session: &dyn MultipartSession,
    parts: Vec<PartPlan>,
    max_parallel: usize,
    progress: &Mutex<ProgressReporter>,
) -> Result<Option<String>, StorageError> {
    let uploaded: Result<Vec<CompletedPart>, StorageError> = futures_util::stream::iter(parts)
        .map(|part| async move {
            let completed = session.upload_part(part).await?;
            if let Ok(mut r) = progress.lock() {
                r.advance(part.length);
            }
            Ok::<_, StorageError>(completed)
        })
        .buffer_unordered(max_parallel.max(1))
        .try_collect()
        .await;

    let mut completed = match uploaded {
        Ok(completed) => completed,
        Err(e) => {
            session.abort().await;
            return Err(e);
        }
    };
    completed.sort_by_key(|p| p.part_number());
    match session.complete(completed).await {
        Ok(etag) => Ok(etag),
        Err(e) => {
            session.abort().await;
            Err(e)
        }
    }
}

/// Keep the I/O error kind of a local read failure, so a source that
/// vanished still reads as not found.
fn local_stream_error(path: &Path, err: aws_sdk_s3::primitives::ByteStreamError) -> StorageError {
    let kind = io_kind(&err);
    StorageError::local(path, std::io::Error::new(kind, err))
}

/// Kind of the first `io::Error` in the source chain of `err`.
fn io_kind(err: &(dyn std::error::Error + 'static)) -> std::io::ErrorKind {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return io.kind();
        }
        current = e.source();
    }
    std::io::ErrorKind::Other
}

/// Map an SDK failure onto the storage error categories.
fn classify<E>(context: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Connection(detail)
        }
        SdkError::ConstructionFailure(_) => StorageError::Validation(detail),
        _ => {
            let status = err.raw_response().map(|r| r.status().as_u16());
            classify_response(err.code(), status, context, detail)
        }
    }
}

fn classify_response(
    code: Option<&str>,
    status: Option<u16>,
    context: &str,
    detail: String,
) -> StorageError {
    match (code, status) {
        (Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded"), _)
        | (_, Some(429 | 503)) => StorageError::Throttled(detail),
        (
            Some(
                "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                | "InvalidToken",
            ),
            _,
        )
        | (_, Some(401 | 403)) => StorageError::Auth(detail),
        (Some("NoSuchBucket"), _) => StorageError::Validation(detail),
        (Some("NoSuchKey" | "NotFound"), _) | (_, Some(404)) => {
            StorageError::NotFound(context.to_string())
        }
        (Some("RequestTimeout" | "InternalError"), _) => StorageError::Connection(detail),
        (_, Some(s)) if s >= 500 => StorageError::Connection(detail),
        (_, Some(400)) => StorageError::Validation(detail),
        _ => StorageError::Backend(detail),
    }
}

/// Percent-encode a key for the `x-amz-copy-source` header, keeping `/`.
fn encode_copy_source(bucket: &str, key: &str) -> String {
    let mut out = String::with_capacity(bucket.len() + key.len() + 1);
    out.push_str(bucket);
    out.push('/');
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| StorageError::local(local_path, e))?
            .len();

        let receipt = if needs_multipart(size, self.tuning.multipart_threshold_bytes) {
            self.put_multipart(local_path, key, size, options).await?
        } else {
            self.put_single(local_path, key, size, options).await?
        };
        tracing::debug!(key, bytes = size, parts = receipt.parts, "Stored object in bucket");
        Ok(receipt)
    }

    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(options.range.map(|r| r.header_value()))
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::local(parent, e))?;
        }
        let partial = local_path.with_extension("partial");
        let result = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(|e| StorageError::local(&partial, e))?;
            let mut body = output.body;
            let mut reporter = ProgressReporter::new(options.progress.clone());
            while let Some(bytes) = body
                .try_next()
                .await
                .map_err(|e| StorageError::Connection(format!("{key}: {e}")))?
            {
                file.write_all(&bytes)
                    .await
                    .map_err(|e| StorageError::local(&partial, e))?;
                reporter.advance(bytes.len() as u64);
            }
            file.flush().await.map_err(|e| StorageError::local(&partial, e))?;
            tokio::fs::rename(&partial, local_path)
                .await
                .map_err(|e| StorageError::local(local_path, e))?;
            Ok::<u64, StorageError>(reporter.finish())
        }
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => Ok(false),
            Err(e) => match classify(key, e) {
                StorageError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError> {
        let max_keys = options.max_keys.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000) as i32;
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .set_continuation_token(options.continuation_token.clone())
            .send()
            .await
            .map_err(|e| classify(prefix, e))?;

        let entries = output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectEntry {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0)),
                })
            })
            .collect();

        let continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            entries,
            continuation_token,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify(key, e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        delete_in_batches(keys, DELETE_BATCH, |batch| async move {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Validation(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(false)
                .build()
                .map_err(|e| StorageError::Validation(e.to_string()))?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify("delete_objects", e))?;

            let mut report = DeleteReport::default();
            for deleted in output.deleted() {
                if let Some(key) = deleted.key() {
                    report.deleted.push(key.to_string());
                }
            }
            for err in output.errors() {
                // A key that is already gone counts as deleted.
                if err.code() == Some("NoSuchKey") {
                    if let Some(key) = err.key() {
                        report.deleted.push(key.to_string());
                    }
                    continue;
                }
                report.failed.push(DeleteFailure {
                    key: err.key().unwrap_or_default().to_string(),
                    message: err
                        .message()
                        .or(err.code())
                        .unwrap_or("unknown error")
                        .to_string(),
                });
            }
            Ok(report)
        })
        .await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(encode_copy_source(&self.bucket, src_key))
            .key(dst_key)
            .send()
            .await
            .map_err(|e| classify(src_key, e))?;
        Ok(())
    }

    async fn signed_url(
        &self,
        operation: SignedOperation,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let config =
            PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Validation(e.to_string()))?;
        let request = match operation {
            SignedOperation::Read => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|e| classify(key, e))?,
            SignedOperation::Write => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .presigned(config)
                .await
                .map_err(|e| classify(key, e))?,
        };
        Ok(request.uri().to_string())
    }

    async fn test_connection(&self) -> Result<bool, StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(&self.bucket, e))?;
        Ok(true)
    }
}
