//! The triggering API used by the HTTP layer and the scheduler.

use crate::config::{BackupTarget, EngineConfig};
use crate::fs::fingerprint_file;
use crate::manifest::{Manifest, ManifestFormat};
use crate::notify::RunNotifier;
use crate::orchestrator::{retention, BackupOrchestrator};
use crate::registry::{BackupRun, FileFailure, RunRegistry, StoredManifest};
use crate::storage::retry::retry_counted;
use crate::storage::{
    keys, open_backend, BackendParams, DownloadOptions, StorageBackend, StorageError, StorageStats,
};
use crate::utils::{EngineError, Result};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// A configured target with its backend already opened.
#[derive(Clone)]
struct LoadedTarget {
    config: BackupTarget,
    backend: Arc<dyn StorageBackend>,
}

/// What a restore wrote.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub run_id: String,
    pub destination: PathBuf,
    pub files_restored: u64,
    pub bytes_restored: u64,
    pub failures: Vec<FileFailure>,
}

pub struct BackupService {
    orchestrator: BackupOrchestrator,
    targets: RwLock<HashMap<String, LoadedTarget>>,
    work_dir: PathBuf,
    runs: TaskTracker,
}

impl BackupService {
    pub fn new(orchestrator: BackupOrchestrator, work_dir: PathBuf) -> Self {
        Self {
            orchestrator,
            targets: RwLock::new(HashMap::new()),
            work_dir,
            runs: TaskTracker::new(),
        }
    }

    /// Open the registry and every configured target.
    pub async fn from_config(config: &EngineConfig, notifier: Arc<dyn RunNotifier>) -> Result<Self> {
        let registry = RunRegistry::open(&config.registry.db_path)?;
        let work_dir = config.registry.work_dir.clone();
        let orchestrator = BackupOrchestrator::new(registry, notifier, work_dir.clone());
        let service = Self::new(orchestrator, work_dir);
        for target in &config.targets {
            target.validate()?;
            service.load_target(target.clone()).await?;
        }
        Ok(service)
    }

    pub fn registry(&self) -> &RunRegistry {
        self.orchestrator.registry()
    }

    /// Startup sweep over runs a previous process left behind.
    pub async fn reconcile_interrupted(&self) -> Result<usize> {
        self.registry().reconcile_interrupted().await
    }

    pub async fn targets(&self) -> Vec<BackupTarget> {
        let targets = self.targets.read().await;
        let mut list: Vec<BackupTarget> = targets.values().map(|t| t.config.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    async fn loaded(&self, target_id: &str) -> Result<LoadedTarget> {
        self.targets
            .read()
            .await
            .get(target_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("target {target_id}")))
    }

    /// Start a run in the background and return its id. Fails immediately
    /// when the target already has a run in progress.
    pub async fn trigger_backup(&self, target_id: &str) -> Result<String> {
        let target = self.loaded(target_id).await?;
        let run = self.orchestrator.start(&target.config).await?;
        let run_id = run.id.clone();

        let orchestrator = self.orchestrator.clone();
        self.runs.spawn(async move {
            let run_id = run.id.clone();
            if let Err(e) = orchestrator.execute(&target.config, target.backend, run).await {
                warn!(run_id = %run_id, error = %e, "Backup run could not be finalized");
            }
        });
        Ok(run_id)
    }

    /// Run a backup to completion on the calling task.
    pub async fn run_backup(&self, target_id: &str) -> Result<BackupRun> {
        let target = self.loaded(target_id).await?;
        self.orchestrator.run(&target.config, target.backend).await
    }

    /// Wait for background runs started by `trigger_backup`.
    pub async fn wait_for_runs(&self) {
        self.runs.close();
        self.runs.wait().await;
        self.runs.reopen();
    }

    pub async fn get_status(&self, run_id: &str) -> Result<BackupRun> {
        self.registry().status(run_id).await
    }

    pub async fn list_history(&self, target_id: &str, page: u32, page_size: u32) -> Result<Vec<BackupRun>> {
        self.registry().history(target_id, page, page_size).await
    }

    /// Materialize every domain of a run under `destination/<domain>/`,
    /// checking each file against its recorded fingerprint.
    pub async fn download_backup(&self, run_id: &str, destination: &Path) -> Result<RestoreSummary> {
        let run = self.registry().status(run_id).await?;
        if !run.status.is_terminal() {
            return Err(EngineError::InUse(format!("run {run_id} is still {}", run.status)));
        }
        let target = self.loaded(&run.target_id).await?;

        let mut summary = RestoreSummary {
            run_id: run_id.to_string(),
            destination: destination.to_path_buf(),
            files_restored: 0,
            bytes_restored: 0,
            failures: Vec::new(),
        };

        for stored in self.registry().manifests_for_run(run_id).await? {
            let manifest = self.fetch_manifest(&target, &stored).await?;
            let domain_dir = destination.join(manifest.domain.as_str());
            tokio::fs::create_dir_all(&domain_dir).await?;
            info!(
                run_id,
                domain = %manifest.domain,
                files = manifest.entries.len(),
                "Restoring domain"
            );

            let results: Vec<_> = stream::iter(manifest.entries.iter())
                .map(|entry| {
                    let target = &target;
                    let domain_dir = &domain_dir;
                    async move {
                        let outcome = restore_entry(target, domain_dir, entry).await;
                        (entry, outcome)
                    }
                })
                .boxed()
                .buffer_unordered(target.config.concurrency.max(1))
                .collect()
                .await;

            for (entry, outcome) in results {
                match outcome {
                    Ok(bytes) => {
                        summary.files_restored += 1;
                        summary.bytes_restored += bytes;
                    }
                    Err(RestoreFailure { error, attempts }) => {
                        warn!(path = %entry.path, error = %error, "Restore of file failed");
                        summary.failures.push(FileFailure {
                            domain: manifest.domain,
                            path: entry.path.clone(),
                            error,
                            attempts,
                        });
                    }
                }
            }
        }

        summary.failures.sort_by(|a, b| (a.domain.as_str(), &a.path).cmp(&(b.domain.as_str(), &b.path)));
        info!(
            run_id,
            files = summary.files_restored,
            failures = summary.failures.len(),
            "Restore finished"
        );
        Ok(summary)
    }

    /// Read the manifest back from the backend so the restore relies on
    /// what was actually stored.
    async fn fetch_manifest(&self, target: &LoadedTarget, stored: &StoredManifest) -> Result<Manifest> {
        let staging = self.work_dir.join("restore");
        tokio::fs::create_dir_all(&staging).await?;
        let local = staging.join(format!("{}.manifest", stored.manifest.id));

        let options = DownloadOptions::default();
        let fetched = retry_counted(&target.config.retry, "download", || {
            target.backend.download(&stored.storage_key, &local, &options)
        })
        .await;
        let decoded = match fetched {
            Ok(_) => {
                let data = tokio::fs::read(&local).await?;
                ManifestFormat::from_key(&stored.storage_key)
                    .unwrap_or_default()
                    .decode(&data)
            }
            Err(e) => Err(e.error.into()),
        };
        let _ = tokio::fs::remove_file(&local).await;

        let manifest = decoded?;
        if manifest.id != stored.manifest.id {
            return Err(EngineError::Validation(format!(
                "manifest at {} has id {}, expected {}",
                stored.storage_key, manifest.id, stored.manifest.id
            )));
        }
        Ok(manifest)
    }

    /// Remove a run, its manifests and the content objects nothing else
    /// references. The target is held under maintenance throughout, so no
    /// run can start and deduplicate against objects being deleted.
    pub async fn delete_backup(&self, run_id: &str) -> Result<()> {
        let run = self.registry().status(run_id).await?;
        if !run.status.is_terminal() {
            return Err(EngineError::InUse(format!("run {run_id} is still {}", run.status)));
        }
        self.with_maintenance(&run.target_id, "deleting a backup", self.delete_locked(&run))
            .await
    }

    async fn delete_locked(&self, run: &BackupRun) -> Result<()> {
        let queued = self.registry().delete_run(&run.id).await?;
        info!(run_id = %run.id, target_id = %run.target_id, queued, "Backup deleted");

        let target = match self.loaded(&run.target_id).await {
            Ok(target) => target,
            Err(_) => {
                warn!(
                    target_id = %run.target_id,
                    "Target no longer configured, stored objects stay queued for deletion"
                );
                return Ok(());
            }
        };
        // The run is gone either way; what the backend did not delete stays
        // queued and is retried by the next pass.
        if let Err(e) = retention::collect_garbage(
            self.registry(),
            target.backend.as_ref(),
            &run.target_id,
            &target.config.prefix,
        )
        .await
        {
            warn!(run_id = %run.id, error = %e, "Stored objects not deleted yet");
        }
        Ok(())
    }

    /// Run `work` while holding the target's maintenance lock.
    async fn with_maintenance<T>(
        &self,
        target_id: &str,
        reason: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.registry().begin_maintenance(target_id, reason).await?;
        let result = work.await;
        if let Err(e) = self.registry().end_maintenance(target_id).await {
            warn!(target_id, error = %e, "Failed to release maintenance lock");
        }
        result
    }

    /// Open a backend from raw parameters and test the connection.
    pub async fn test_backend_connection(&self, params: &BackendParams) -> Result<()> {
        let backend = open_backend(params, Default::default()).await?;
        if backend.test_connection().await? {
            Ok(())
        } else {
            Err(EngineError::Connection(format!("{} backend did not respond", params.kind())))
        }
    }

    /// Add or replace a target. Refused while the target has a run in
    /// progress or another maintenance operation holds it.
    pub async fn update_target(&self, target: BackupTarget) -> Result<()> {
        target.validate()?;
        let target_id = target.id.clone();
        self.with_maintenance(&target_id, "replacing target configuration", self.load_target(target))
            .await
    }

    async fn load_target(&self, target: BackupTarget) -> Result<()> {
        let backend = open_backend(&target.backend, target.tuning()).await?;
        info!(target_id = %target.id, kind = %target.backend.kind(), "Target loaded");
        self.targets.write().await.insert(
            target.id.clone(),
            LoadedTarget {
                config: target,
                backend,
            },
        );
        Ok(())
    }

    pub async fn backend_stats(&self, target_id: &str) -> Result<StorageStats> {
        let target = self.loaded(target_id).await?;
        let prefix = keys::objects_prefix(&target.config.prefix);
        Ok(target.backend.stats(&prefix).await?)
    }
}

struct RestoreFailure {
    error: String,
    attempts: u32,
}

/// Download one entry and check its fingerprint. Returns the bytes written.
async fn restore_entry(
    target: &LoadedTarget,
    domain_dir: &Path,
    entry: &crate::manifest::ManifestEntry,
) -> std::result::Result<u64, RestoreFailure> {
    keys::validate_key(&entry.path).map_err(|e| RestoreFailure {
        error: e.to_string(),
        attempts: 0,
    })?;
    let dest = domain_dir.join(&entry.path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| RestoreFailure {
            error: StorageError::local(parent, e).to_string(),
            attempts: 0,
        })?;
    }

    let key = keys::object_key(&target.config.prefix, &entry.fingerprint);
    let options = DownloadOptions::default();
    let (bytes, attempts) = retry_counted(&target.config.retry, "download", || {
        target.backend.download(&key, &dest, &options)
    })
    .await
    .map_err(|e| RestoreFailure {
        error: e.error.to_string(),
        attempts: e.attempts,
    })?;

    let check_path = dest.clone();
    let actual = tokio::task::spawn_blocking(move || fingerprint_file(&check_path))
        .await
        .map_err(|e| RestoreFailure {
            error: e.to_string(),
            attempts,
        })?
        .map_err(|e| RestoreFailure {
            error: StorageError::local(&dest, e).to_string(),
            attempts,
        })?;
    if actual != entry.fingerprint {
        let _ = tokio::fs::remove_file(&dest).await;
        return Err(RestoreFailure {
            error: format!("fingerprint mismatch: expected {}, got {}", entry.fingerprint, actual),
            attempts,
        });
    }
    Ok(bytes)
}
