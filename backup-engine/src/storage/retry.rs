//! Exponential backoff with jitter around any storage operation.

use super::{
    BackendKind, DeleteReport, DownloadOptions, ListOptions, ListPage, SignedOperation,
    StorageBackend, StorageError, StorageStats, UploadOptions, UploadReceipt,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 200 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Upper bound on the wait after failed attempt `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Equal jitter: half the ceiling is fixed, the other half scales with
    /// `jitter` in `[0, 1]`.
    pub fn next_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as f64;
        let half = ceiling / 2.0;
        Duration::from_millis((half + half * jitter.clamp(0.0, 1.0)) as u64)
    }
}

/// The last error together with how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub error: StorageError,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. Returns the value and the attempt count.
pub async fn retry_counted<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<(T, u32), RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = policy.next_delay(attempt, rand::random::<f64>());
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Storage operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(RetryExhausted { error, attempts: attempt }),
        }
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    op: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    retry_counted(policy, op_name, op)
        .await
        .map(|(value, _)| value)
        .map_err(|e| e.error)
}

/// A failed upload and the number of attempts spent on it.
#[derive(Debug, Clone)]
pub struct TransferFailure {
    pub error: StorageError,
    pub attempts: u32,
}

/// Wraps a backend so every call goes through [`with_retry`].
#[derive(Clone)]
pub struct RetryingBackend {
    inner: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upload with retries, reporting the attempt count on both outcomes.
    pub async fn upload_counted(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<(UploadReceipt, u32), TransferFailure> {
        retry_counted(&self.policy, "upload", || {
            self.inner.upload(local_path, key, options)
        })
        .await
        .map_err(|e| TransferFailure {
            error: e.error,
            attempts: e.attempts,
        })
    }
}

#[async_trait]
impl StorageBackend for RetryingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        with_retry(&self.policy, "upload", || self.inner.upload(local_path, key, options)).await
    }

    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError> {
        with_retry(&self.policy, "download", || {
            self.inner.download(key, local_path, options)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        with_retry(&self.policy, "exists", || self.inner.exists(key)).await
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError> {
        with_retry(&self.policy, "list", || self.inner.list(prefix, options)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        with_retry(&self.policy, "delete", || self.inner.delete(key)).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        with_retry(&self.policy, "delete_many", || self.inner.delete_many(keys)).await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        with_retry(&self.policy, "copy", || self.inner.copy(src_key, dst_key)).await
    }

    async fn move_object(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        with_retry(&self.policy, "move", || self.inner.move_object(src_key, dst_key)).await
    }

    async fn signed_url(
        &self,
        operation: SignedOperation,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        with_retry(&self.policy, "signed_url", || {
            self.inner.signed_url(operation, key, ttl)
        })
        .await
    }

    async fn test_connection(&self) -> Result<bool, StorageError> {
        with_retry(&self.policy, "test_connection", || self.inner.test_connection()).await
    }

    async fn stats(&self, prefix: &str) -> Result<StorageStats, StorageError> {
        with_retry(&self.policy, "stats", || self.inner.stats(prefix)).await
    }
}
