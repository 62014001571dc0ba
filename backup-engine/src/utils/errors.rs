//! Error types for the backup engine.

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Network failure, timeout or throttling that outlived the retry budget.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transfer of {path} failed after {attempts} attempt(s): {source}")]
    PerFileTransfer {
        path: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("Failed to persist {domain} manifest: {message}")]
    ManifestPersist { domain: String, message: String },

    #[error("A backup is already running for target {0}")]
    AlreadyRunning(String),

    #[error("Database dump failed: {0}")]
    Dump(String),

    #[error("Retention pruning failed: {0}")]
    RetentionPrune(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("In use: {0}")]
    InUse(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Connection(m) | StorageError::Throttled(m) => EngineError::Connection(m),
            StorageError::Auth(m) => EngineError::Auth(m),
            StorageError::Validation(m) => EngineError::Validation(m),
            other => EngineError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Registry(format!("{err:#}"))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Registry(format!("blocking task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
