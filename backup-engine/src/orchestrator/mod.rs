//! One backup run from lock to notification.
//!
//! For each enabled domain the orchestrator resolves the parent manifest,
//! builds the new manifest, uploads the changed content objects with bounded
//! concurrency, and writes the manifest. A file that keeps failing is
//! recorded and skipped; an authentication failure stops the whole run.

pub mod dump;
pub mod retention;

use crate::config::BackupTarget;
use crate::domain::Domain;
use crate::fs::{copy_with_fingerprint, WalkOptions};
use crate::manifest::{ChangeSet, Manifest, ManifestBuilder};
use crate::notify::{should_notify, RunNotifier};
use crate::registry::{BackupRun, FileFailure, ManifestRef, RunOutcome, RunRegistry, RunStatus};
use crate::storage::retry::TransferFailure;
use crate::storage::{keys, RetryingBackend, StorageBackend, StorageError, UploadOptions};
use crate::transfer::{format_bytes, format_duration, format_speed, TransferTracker};
use crate::utils::{EngineError, Result};
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const CHANGED_DURING_BACKUP: &str = "file content changed while it was being backed up";
const NON_UTF8_PATH: &str = "file path is not valid UTF-8";

/// How the transfer of one content object ended.
#[derive(Debug)]
enum FileOutcome {
    Uploaded { bytes: u64 },
    Deduplicated,
    /// Every source path vanished or changed after the manifest was built.
    NoSource,
    Failed { error: StorageError, attempts: u32 },
    /// Not attempted because the run was cancelled.
    Skipped,
}

/// Paths sharing one fingerprint are uploaded once.
struct TransferJob {
    fingerprint: String,
    paths: Vec<String>,
}

struct JobResult {
    /// Paths that vanished while trying sources in turn.
    vanished: Vec<String>,
    /// Paths whose content no longer matched the fingerprint.
    changed: Vec<String>,
    /// Paths the outcome applies to.
    paths: Vec<String>,
    outcome: FileOutcome,
}

/// Result of backing up one domain.
#[derive(Debug)]
pub struct DomainReport {
    pub domain: Domain,
    pub files_uploaded: u64,
    pub files_deduplicated: u64,
    pub bytes_uploaded: u64,
    pub failures: Vec<FileFailure>,
    pub manifest: Option<ManifestRef>,
    pub error: Option<EngineError>,
}

impl DomainReport {
    fn new(domain: Domain) -> Self {
        Self {
            domain,
            files_uploaded: 0,
            files_deduplicated: 0,
            bytes_uploaded: 0,
            failures: Vec::new(),
            manifest: None,
            error: None,
        }
    }

    fn fail(mut self, error: EngineError) -> Self {
        self.error = Some(error);
        self
    }

    /// An authentication failure ends the run; other domain errors only end
    /// the domain.
    fn aborts_run(&self) -> bool {
        matches!(self.error, Some(EngineError::Auth(_)))
    }
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    registry: RunRegistry,
    notifier: Arc<dyn RunNotifier>,
    work_dir: PathBuf,
}

impl BackupOrchestrator {
    pub fn new(registry: RunRegistry, notifier: Arc<dyn RunNotifier>, work_dir: PathBuf) -> Self {
        Self {
            registry,
            notifier,
            work_dir,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Validate the target and take its single-flight lock. Nothing is
    /// transferred yet.
    pub async fn start(&self, target: &BackupTarget) -> Result<BackupRun> {
        target.validate()?;
        if !target.enabled {
            return Err(EngineError::Validation(format!("target {} is disabled", target.id)));
        }
        let run = self.registry.acquire(&target.id).await?;
        info!(run_id = %run.id, target_id = %target.id, "Backup run started");
        Ok(run)
    }

    /// `start` followed by `execute`.
    pub async fn run(&self, target: &BackupTarget, backend: Arc<dyn StorageBackend>) -> Result<BackupRun> {
        let run = self.start(target).await?;
        self.execute(target, backend, run).await
    }

    /// Drive a started run to its final state, release the lock and notify.
    pub async fn execute(
        &self,
        target: &BackupTarget,
        backend: Arc<dyn StorageBackend>,
        run: BackupRun,
    ) -> Result<BackupRun> {
        let backend = RetryingBackend::new(backend, target.retry);
        let mut reports = Vec::new();

        for domain in target.enabled_domains() {
            let report = self.backup_domain(target, &backend, &run.id, domain).await;
            if let Some(e) = &report.error {
                error!(run_id = %run.id, domain = %domain, error = %e, "Domain backup failed");
            }
            let abort = report.aborts_run();
            reports.push(report);
            if abort {
                break;
            }
        }

        let outcome = summarize(&reports);
        info!(
            run_id = %run.id,
            status = %outcome.status,
            files = outcome.files_transferred,
            bytes = %format_bytes(outcome.bytes_transferred),
            failures = outcome.failures.len(),
            "Backup run complete"
        );

        if outcome.status != RunStatus::Failed {
            let mut current = run.clone();
            current.status = outcome.status;
            if let Err(e) =
                retention::prune(&self.registry, &backend, &current, &target.prefix, &target.retention).await
            {
                warn!(run_id = %run.id, error = %e, "[Retention] Pruning failed");
            }
        }

        self.cleanup_staging(&run.id).await;
        let finished = self.registry.finalize(&run.id, outcome).await?;

        if should_notify(&finished, target.notify_failure_threshold) {
            if let Err(e) = self.notifier.on_run_completed(&finished).await {
                warn!(run_id = %finished.id, error = %e, "[Notify] Notification failed");
            }
        }
        Ok(finished)
    }

    async fn backup_domain(
        &self,
        target: &BackupTarget,
        backend: &RetryingBackend,
        run_id: &str,
        domain: Domain,
    ) -> DomainReport {
        let mut report = DomainReport::new(domain);
        let Some(root) = target.domain_root(domain).map(Path::to_path_buf) else {
            return report.fail(EngineError::Validation(format!("no source configured for {domain}")));
        };

        if domain == Domain::Database {
            if let Some(source) = &target.sources.database {
                if let Err(e) = dump::prepare(source).await {
                    return report.fail(e);
                }
            }
        }

        let parent = match self.registry.latest_successful(&target.id, domain).await {
            Ok(parent) => parent,
            Err(e) => return report.fail(e),
        };

        let builder = ManifestBuilder::new(WalkOptions {
            exclude_names: target.exclude.clone(),
            ..WalkOptions::default()
        });
        let build_root = root.clone();
        let build_run_id = run_id.to_string();
        let built = tokio::task::spawn_blocking(move || {
            let result = builder.build(&build_root, parent.as_ref(), &build_run_id, domain);
            (result, parent)
        })
        .await;
        let (mut manifest, changes, parent) = match built {
            Ok((Ok((manifest, changes)), parent)) => (manifest, changes, parent),
            Ok((Err(e), _)) => return report.fail(e.into()),
            Err(e) => return report.fail(e.into()),
        };

        info!(
            run_id,
            domain = %domain,
            files = manifest.entries.len(),
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            rejected = changes.rejected.len(),
            "Change set computed"
        );
        for path in &changes.rejected {
            report.failures.push(FileFailure {
                domain,
                path: path.clone(),
                error: NON_UTF8_PATH.to_string(),
                attempts: 0,
            });
        }

        let staging = self.staging_dir(run_id).join("objects");
        let cancel = CancellationToken::new();
        let results =
            transfer_changes(target, backend, &root, &staging, &manifest, &changes, &cancel).await;

        let mut dropped = HashSet::new();
        let mut reverted = HashSet::new();
        let mut auth_error = None;
        for result in results {
            dropped.extend(result.vanished);
            for path in result.changed {
                report.failures.push(FileFailure {
                    domain,
                    path: path.clone(),
                    error: CHANGED_DURING_BACKUP.to_string(),
                    attempts: 0,
                });
                reverted.insert(path);
            }
            match result.outcome {
                FileOutcome::Uploaded { bytes } => {
                    report.files_uploaded += 1;
                    report.bytes_uploaded += bytes;
                }
                FileOutcome::Deduplicated => report.files_deduplicated += 1,
                FileOutcome::NoSource => dropped.extend(result.paths),
                FileOutcome::Failed { error, attempts } => {
                    if error.is_auth() && auth_error.is_none() {
                        auth_error = Some(error.to_string());
                    }
                    for path in result.paths {
                        report.failures.push(FileFailure {
                            domain,
                            path: path.clone(),
                            error: error.to_string(),
                            attempts,
                        });
                        reverted.insert(path);
                    }
                }
                FileOutcome::Skipped => reverted.extend(result.paths),
            }
        }
        report.failures.sort_by(|a, b| a.path.cmp(&b.path));

        if let Some(message) = auth_error {
            return report.fail(EngineError::Auth(message));
        }

        settle_entries(&mut manifest, parent.as_ref(), &dropped, &reverted);

        match self.persist_manifest(target, backend, &manifest).await {
            Ok(manifest_ref) => {
                info!(run_id, domain = %domain, key = %manifest_ref.storage_key, "Manifest written");
                report.manifest = Some(manifest_ref);
                report
            }
            Err(e) => report.fail(EngineError::ManifestPersist {
                domain: domain.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Serialize, upload and record the manifest. Only a manifest that made
    /// it to the backend becomes a parent for later runs.
    async fn persist_manifest(
        &self,
        target: &BackupTarget,
        backend: &RetryingBackend,
        manifest: &Manifest,
    ) -> Result<ManifestRef> {
        let format = target.manifest_format;
        let body = format.encode(manifest)?;

        let staging = self.staging_dir(&manifest.run_id);
        tokio::fs::create_dir_all(&staging).await?;
        let local = staging.join(format!("{}.{}", manifest.domain, format.extension()));
        tokio::fs::write(&local, &body).await?;

        let key = keys::manifest_key(
            &target.prefix,
            manifest.domain.as_str(),
            &manifest.run_id,
            format.extension(),
        );
        let options = UploadOptions {
            content_type: Some(format.content_type().to_string()),
            metadata: HashMap::from([
                ("manifest-id".to_string(), manifest.id.clone()),
                ("run-id".to_string(), manifest.run_id.clone()),
            ]),
            progress: None,
        };
        let uploaded = backend.upload(&local, &key, &options).await;
        let _ = tokio::fs::remove_file(&local).await;
        uploaded?;

        if let Err(e) = self.registry.save_manifest(&target.id, manifest, &key).await {
            // Keep the backend consistent with the registry.
            if let Err(cleanup) = backend.delete(&key).await {
                warn!(key = %key, error = %cleanup, "Failed to remove unrecorded manifest");
            }
            return Err(e);
        }

        Ok(ManifestRef {
            domain: manifest.domain,
            manifest_id: manifest.id.clone(),
            storage_key: key,
        })
    }

    fn staging_dir(&self, run_id: &str) -> PathBuf {
        self.work_dir.join("staging").join(run_id)
    }

    async fn cleanup_staging(&self, run_id: &str) {
        match tokio::fs::remove_dir_all(self.staging_dir(run_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(run_id, error = %e, "Failed to remove staging directory"),
        }
    }
}

/// Upload every changed fingerprint not already stored, at most
/// `target.concurrency` at a time.
async fn transfer_changes(
    target: &BackupTarget,
    backend: &RetryingBackend,
    root: &Path,
    staging: &Path,
    manifest: &Manifest,
    changes: &ChangeSet,
    cancel: &CancellationToken,
) -> Vec<JobResult> {
    let mut by_fingerprint: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in changes.to_transfer() {
        if let Some(entry) = manifest.entry(path) {
            by_fingerprint
                .entry(entry.fingerprint.clone())
                .or_default()
                .push(path.clone());
        }
    }
    let jobs: Vec<TransferJob> = by_fingerprint
        .into_iter()
        .map(|(fingerprint, paths)| TransferJob { fingerprint, paths })
        .collect();
    if jobs.is_empty() {
        return Vec::new();
    }

    let tracker = Arc::new(TransferTracker::new(jobs.len() as u64));
    let done = cancel.child_token();

    let progress_tracker = Arc::clone(&tracker);
    let progress_done = done.clone();
    let domain = manifest.domain;
    let progress_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = progress_done.cancelled() => break,
            }
            let summary = progress_tracker.summary();
            info!(
                domain = %domain,
                percent = %format!("{:.1}", summary.percent_complete()),
                uploaded = summary.files_uploaded,
                deduplicated = summary.files_deduplicated,
                failed = summary.files_failed,
                speed = %format_speed(summary.bytes_per_second()),
                "Transfer progress"
            );
        }
    });

    // Only `concurrency` jobs exist as futures at any time.
    let tracker_ref = tracker.as_ref();
    let results: Vec<JobResult> = stream::iter(jobs)
        .map(|job| async move {
            if cancel.is_cancelled() {
                return skipped(job.paths);
            }
            let key = keys::object_key(&target.prefix, &job.fingerprint);
            let result = transfer_object(backend, root, staging, &key, job).await;

            match &result.outcome {
                FileOutcome::Uploaded { bytes } => tracker_ref.record_uploaded(*bytes),
                FileOutcome::Deduplicated => tracker_ref.record_deduplicated(),
                FileOutcome::Failed { error, attempts } => {
                    tracker_ref.record_failed();
                    warn!(key = %key, attempts, error = %error, "Object transfer failed");
                    if error.is_auth() {
                        cancel.cancel();
                    }
                }
                FileOutcome::NoSource if !result.changed.is_empty() => tracker_ref.record_failed(),
                FileOutcome::NoSource | FileOutcome::Skipped => {}
            }
            result
        })
        .buffer_unordered(target.concurrency.max(1))
        .collect()
        .await;

    done.cancel();
    let _ = progress_task.await;

    let summary = tracker.summary();
    info!(
        domain = %domain,
        uploaded = summary.files_uploaded,
        deduplicated = summary.files_deduplicated,
        failed = summary.files_failed,
        bytes = %format_bytes(summary.bytes_uploaded),
        elapsed = %format_duration(summary.elapsed.as_secs()),
        "Domain transfer finished"
    );
    results
}

fn skipped(paths: Vec<String>) -> JobResult {
    JobResult {
        vanished: Vec::new(),
        changed: Vec::new(),
        paths,
        outcome: FileOutcome::Skipped,
    }
}

/// Copy a source file into the staging area on the blocking pool and return
/// the fingerprint of the staged bytes.
async fn stage_source(source: PathBuf, staged: PathBuf) -> std::io::Result<String> {
    tokio::task::spawn_blocking(move || copy_with_fingerprint(&source, &staged))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
        .map(|(fingerprint, _)| fingerprint)
}

/// Upload one content object unless the backend already holds it.
///
/// Source paths are tried in order. Each is first copied into the staging
/// area and hashed; only a staged copy whose hash matches the job's
/// fingerprint is uploaded, so the object stored under a key always has
/// that key's content.
async fn transfer_object(
    backend: &RetryingBackend,
    root: &Path,
    staging: &Path,
    key: &str,
    job: TransferJob,
) -> JobResult {
    if let Ok(true) = backend.exists(key).await {
        return JobResult {
            vanished: Vec::new(),
            changed: Vec::new(),
            paths: job.paths,
            outcome: FileOutcome::Deduplicated,
        };
    }

    let stage_dir = staging.join(&job.fingerprint);
    if let Err(e) = tokio::fs::create_dir_all(&stage_dir).await {
        return JobResult {
            vanished: Vec::new(),
            changed: Vec::new(),
            outcome: FileOutcome::Failed {
                error: StorageError::local(&stage_dir, e),
                attempts: 0,
            },
            paths: job.paths,
        };
    }

    let options = UploadOptions {
        content_type: Some("application/octet-stream".to_string()),
        metadata: HashMap::from([("fingerprint".to_string(), job.fingerprint.clone())]),
        progress: None,
    };

    let mut vanished = Vec::new();
    let mut changed = Vec::new();
    let mut remaining = job.paths.into_iter();
    let mut finished = None;
    while let Some(path) = remaining.next() {
        let source = root.join(&path);
        let name = Path::new(&path).file_name().unwrap_or_else(|| "content".as_ref());
        let staged = stage_dir.join(name);

        let outcome = match stage_source(source.clone(), staged.clone()).await {
            Ok(fingerprint) if fingerprint == job.fingerprint => {
                match backend.upload_counted(&staged, key, &options).await {
                    Ok((receipt, _)) => FileOutcome::Uploaded { bytes: receipt.size },
                    Err(TransferFailure { error, attempts }) => FileOutcome::Failed { error, attempts },
                }
            }
            Ok(_) => {
                warn!(path = %path, "File content changed after it was fingerprinted");
                changed.push(path);
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path, "File vanished before upload");
                vanished.push(path);
                continue;
            }
            Err(e) => FileOutcome::Failed {
                error: StorageError::local(&source, e),
                attempts: 0,
            },
        };

        let mut paths = vec![path];
        paths.extend(remaining.by_ref());
        finished = Some((paths, outcome));
        break;
    }

    if let Err(e) = tokio::fs::remove_dir_all(&stage_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %stage_dir.display(), error = %e, "Failed to remove staged object");
        }
    }

    let (paths, outcome) = finished.unwrap_or((Vec::new(), FileOutcome::NoSource));
    JobResult {
        vanished,
        changed,
        paths,
        outcome,
    }
}

/// Bring the manifest in line with what the backend actually holds: vanished
/// paths are dropped, paths whose transfer did not succeed fall back to the
/// parent's entry when there is one.
fn settle_entries(
    manifest: &mut Manifest,
    parent: Option<&Manifest>,
    dropped: &HashSet<String>,
    reverted: &HashSet<String>,
) {
    if dropped.is_empty() && reverted.is_empty() {
        return;
    }
    let entries = std::mem::take(&mut manifest.entries);
    manifest.entries = entries
        .into_iter()
        .filter_map(|entry| {
            if dropped.contains(&entry.path) {
                None
            } else if reverted.contains(&entry.path) {
                parent.and_then(|p| p.entry(&entry.path)).cloned()
            } else {
                Some(entry)
            }
        })
        .collect();
}

/// Fold the domain reports into the run's final figures.
fn summarize(reports: &[DomainReport]) -> RunOutcome {
    let mut failures = Vec::new();
    let mut errors = Vec::new();
    let mut files_transferred = 0;
    let mut bytes_transferred = 0;

    for report in reports {
        files_transferred += report.files_uploaded;
        bytes_transferred += report.bytes_uploaded;
        failures.extend(report.failures.iter().cloned());
        if let Some(e) = &report.error {
            errors.push(format!("{}: {}", report.domain, e));
        }
    }

    let status = if !errors.is_empty() {
        RunStatus::Failed
    } else if !failures.is_empty() {
        RunStatus::Partial
    } else {
        RunStatus::Succeeded
    };

    RunOutcome {
        status,
        files_transferred,
        bytes_transferred,
        failures,
        error: (!errors.is_empty()).then(|| errors.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;

    fn entry(path: &str, fp: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.into(),
            size_bytes: 1,
            fingerprint: fp.into(),
            modified_at: None,
        }
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_settle_entries() {
        let parent = Manifest::new("r1", Domain::ActiveAssets, None, vec![entry("a", "1"), entry("b", "2")]);
        let mut manifest = Manifest::new(
            "r2",
            Domain::ActiveAssets,
            Some(parent.id.clone()),
            vec![entry("a", "1"), entry("b", "22"), entry("c", "3"), entry("d", "4")],
        );

        settle_entries(&mut manifest, Some(&parent), &set(&["d"]), &set(&["b", "c"]));

        // b falls back to the stored parent content, c was never stored
        assert_eq!(manifest.entries, vec![entry("a", "1"), entry("b", "2")]);
    }

    #[test]
    fn test_summarize_statuses() {
        let mut ok = DomainReport::new(Domain::Database);
        ok.files_uploaded = 2;
        ok.bytes_uploaded = 10;
        assert_eq!(summarize(&[ok]).status, RunStatus::Succeeded);

        let mut partial = DomainReport::new(Domain::Archives);
        partial.failures.push(FileFailure {
            domain: Domain::Archives,
            path: "x".into(),
            error: "timeout".into(),
            attempts: 3,
        });
        let outcome = summarize(&[DomainReport::new(Domain::Database), partial]);
        assert_eq!(outcome.status, RunStatus::Partial);
        assert!(outcome.error.is_none());

        let failed = DomainReport::new(Domain::ActiveAssets).fail(EngineError::ManifestPersist {
            domain: "active-assets".into(),
            message: "denied".into(),
        });
        let outcome = summarize(&[failed]);
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.unwrap().starts_with("active-assets:"));
    }

    #[test]
    fn test_auth_aborts_run() {
        let report = DomainReport::new(Domain::Database).fail(EngineError::Auth("bad key".into()));
        assert!(report.aborts_run());
        let report = DomainReport::new(Domain::Database).fail(EngineError::Dump("x".into()));
        assert!(!report.aborts_run());
    }
}
