//! Backup Engine Library
//!
//! Content-addressed incremental backups of a database dump and file trees,
//! stored through local, SFTP or S3-compatible backends.

pub mod config;
pub mod domain;
pub mod fs;
pub mod manifest;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{BackupTarget, EngineConfig};
pub use domain::Domain;
pub use manifest::{ChangeSet, Manifest, ManifestBuilder, ManifestEntry, ManifestFormat};
pub use orchestrator::BackupOrchestrator;
pub use registry::{BackupRun, RunRegistry, RunStatus};
pub use service::{BackupService, RestoreSummary};
pub use storage::{BackendParams, StorageBackend, StorageError};
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
