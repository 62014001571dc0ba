//! Configuration management for the backup engine.
//!
//! Loads the engine configuration, including every backup target, from a TOML
//! file.

use crate::domain::Domain;
use crate::manifest::ManifestFormat;
use crate::storage::{BackendParams, RetryPolicy, TransferTuning};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub registry: RegistryConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub targets: Vec<BackupTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// SQLite file holding run history and manifests
    pub db_path: PathBuf,

    /// Staging directory for manifests and restores
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One backup target: what to back up, where to, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cron expression (seconds field first), evaluated by the scheduler
    #[serde(default)]
    pub schedule: Option<String>,

    pub backend: BackendParams,

    /// Key prefix every object of this target is stored under
    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub domains: DomainFlags,

    #[serde(default)]
    pub sources: DomainSources,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Size of the transfer worker pool
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,

    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub manifest_format: ManifestFormat,

    /// Notify when a run records at least this many per-file failures
    #[serde(default = "default_notify_threshold")]
    pub notify_failure_threshold: usize,

    /// Names skipped while walking any domain
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFlags {
    #[serde(default = "default_true")]
    pub database: bool,
    #[serde(default = "default_true")]
    pub active_assets: bool,
    #[serde(default)]
    pub archives: bool,
}

impl Default for DomainFlags {
    fn default() -> Self {
        Self {
            database: true,
            active_assets: true,
            archives: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainSources {
    #[serde(default)]
    pub database: Option<DatabaseSource>,
    #[serde(default)]
    pub active_assets: Option<PathBuf>,
    #[serde(default)]
    pub archives: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSource {
    /// Directory the dump is written into; this is the domain root
    pub dump_dir: PathBuf,

    /// SQLite file to snapshot with `VACUUM INTO`
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,

    /// Shell command that writes a dump into `dump_dir`
    #[serde(default)]
    pub dump_command: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age_days.is_none() && self.max_count.is_none()
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    16 * 1024 * 1024
}

fn default_max_parallel_chunks() -> usize {
    4
}

fn default_notify_threshold() -> usize {
    1
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for target in &self.targets {
            if !ids.insert(target.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate target id: {}",
                    target.id
                )));
            }
            target.validate()?;
        }
        Ok(())
    }

    pub fn target(&self, id: &str) -> Option<&BackupTarget> {
        self.targets.iter().find(|t| t.id == id)
    }
}

impl BackupTarget {
    /// Check the target before any transfer begins.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("target id must not be empty".into()));
        }
        self.backend.validate()?;
        if self.concurrency == 0 {
            return Err(self.invalid("concurrency must be at least 1"));
        }
        if self.chunk_size_bytes == 0 || self.max_parallel_chunks == 0 {
            return Err(self.invalid("chunk_size_bytes and max_parallel_chunks must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(self.invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(self.invalid("retry.base_delay_ms exceeds retry.max_delay_ms"));
        }
        if self.retention.max_count == Some(0) {
            return Err(self.invalid("retention.max_count must be at least 1"));
        }
        if self.enabled_domains().is_empty() {
            return Err(self.invalid("no domain enabled"));
        }
        for domain in self.enabled_domains() {
            if self.domain_root(domain).is_none() {
                return Err(self.invalid(&format!("domain {domain} is enabled but has no source")));
            }
        }
        if let Some(db) = &self.sources.database {
            if db.sqlite_path.is_some() && db.dump_command.is_some() {
                return Err(self.invalid("set either sources.database.sqlite_path or dump_command, not both"));
            }
        }
        Ok(())
    }

    fn invalid(&self, message: &str) -> EngineError {
        EngineError::Validation(format!("target {}: {}", self.id, message))
    }

    pub fn enabled_domains(&self) -> Vec<Domain> {
        let mut domains = Vec::new();
        if self.domains.database {
            domains.push(Domain::Database);
        }
        if self.domains.active_assets {
            domains.push(Domain::ActiveAssets);
        }
        if self.domains.archives {
            domains.push(Domain::Archives);
        }
        domains
    }

    /// Directory walked for `domain`.
    pub fn domain_root(&self, domain: Domain) -> Option<&Path> {
        match domain {
            Domain::Database => self.sources.database.as_ref().map(|d| d.dump_dir.as_path()),
            Domain::ActiveAssets => self.sources.active_assets.as_deref(),
            Domain::Archives => self.sources.archives.as_deref(),
        }
    }

    pub fn tuning(&self) -> TransferTuning {
        TransferTuning {
            multipart_threshold_bytes: self.multipart_threshold_bytes,
            chunk_size_bytes: self.chunk_size_bytes,
            max_parallel_chunks: self.max_parallel_chunks,
        }
    }
}
