//! Storage-layer error type shared by every backend.

use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("throttled by backend: {0}")]
    Throttled(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("local file {path}: {message}")]
    LocalFile {
        path: String,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Connection resets, timeouts and throttling are worth another attempt;
    /// everything else is terminal for the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Throttled(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, StorageError::Auth(_))
    }

    /// An error reading or writing a file on the machine running the engine.
    pub fn local(path: impl AsRef<std::path::Path>, err: io::Error) -> Self {
        StorageError::LocalFile {
            path: path.as_ref().display().to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True when a local source file disappeared before it could be read.
    pub fn is_local_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::LocalFile {
                kind: io::ErrorKind::NotFound,
                ..
            }
        )
    }

    /// Classify an I/O error raised while talking to the destination.
    pub fn from_remote_io(key: &str, err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => StorageError::NotFound(key.to_string()),
            PermissionDenied => StorageError::Auth(format!("{key}: {err}")),
            TimedOut | ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe
            | Interrupted | UnexpectedEof | WouldBlock => {
                StorageError::Connection(format!("{key}: {err}"))
            }
            InvalidInput | InvalidData => StorageError::Validation(format!("{key}: {err}")),
            _ => StorageError::Backend(format!("{key}: {err}")),
        }
    }
}
