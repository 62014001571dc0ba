//! Retention pruning and content-object garbage collection.

use crate::config::RetentionPolicy;
use crate::registry::{BackupRun, DeletionKind, PendingDeletion, RunRegistry};
use crate::storage::{keys, StorageBackend};
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

/// What a pruning pass removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub runs_deleted: Vec<String>,
    pub garbage: GarbageReport,
}

/// Outcome of draining the pending-deletion journal of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    /// Keys the backend confirmed as deleted.
    pub deleted: usize,
    /// Keys the backend refused; they stay queued.
    pub failed: usize,
    /// Queued objects dropped from the journal because a manifest
    /// references them again.
    pub revived: usize,
}

/// Pick the runs that fall outside the policy. `runs` must be newest first;
/// the newest run is never selected.
pub fn select_expired(runs: &[BackupRun], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<String> {
    let cutoff = policy
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)));

    runs.iter()
        .enumerate()
        .skip(1)
        .filter(|(idx, run)| {
            let over_count = policy.max_count.is_some_and(|max| *idx >= max);
            let too_old = cutoff.is_some_and(|cutoff| run.started_at < cutoff);
            over_count || too_old
        })
        .map(|(_, run)| run.id.clone())
        .collect()
}

/// Apply `policy` to the completed runs of the target, then drain the
/// deletion journal. `current` is the run being finished; it still holds
/// the lock and counts as the newest run.
pub async fn prune(
    registry: &RunRegistry,
    backend: &dyn StorageBackend,
    current: &BackupRun,
    prefix: &str,
    policy: &RetentionPolicy,
) -> Result<PruneReport> {
    let target_id = current.target_id.as_str();
    let mut report = PruneReport::default();

    if !policy.is_unbounded() {
        let mut runs = vec![current.clone()];
        runs.extend(
            registry
                .successful_runs(target_id)
                .await?
                .into_iter()
                .filter(|r| r.id != current.id),
        );
        for run_id in select_expired(&runs, policy, Utc::now()) {
            registry.delete_run(&run_id).await?;
            tracing::info!(target_id, run_id = %run_id, "[Retention] Pruned run");
            report.runs_deleted.push(run_id);
        }
    }

    // Also retries deletions an earlier pass could not finish.
    report.garbage = collect_garbage(registry, backend, target_id, prefix).await?;
    Ok(report)
}

/// Delete everything queued for removal on the target's backend. Objects a
/// manifest references again are dropped from the queue instead. Entries
/// stay queued until the backend confirms their deletion, so a failed or
/// partial pass is retried by the next one.
///
/// Callers must hold the target's run lock or maintenance lock.
pub async fn collect_garbage(
    registry: &RunRegistry,
    backend: &dyn StorageBackend,
    target_id: &str,
    prefix: &str,
) -> Result<GarbageReport> {
    let pending = registry.pending_deletions(target_id).await?;
    if pending.is_empty() {
        return Ok(GarbageReport::default());
    }
    let referenced = registry.referenced_fingerprints(target_id).await?;

    let mut revived = Vec::new();
    let mut queued: Vec<(String, PendingDeletion)> = Vec::with_capacity(pending.len());
    for item in pending {
        match item.kind {
            DeletionKind::Object if referenced.contains(&item.value) => revived.push(item),
            DeletionKind::Object => queued.push((keys::object_key(prefix, &item.value), item)),
            DeletionKind::Manifest => queued.push((item.value.clone(), item)),
        }
    }
    let mut report = GarbageReport {
        revived: registry.clear_deletions(target_id, revived).await?,
        ..GarbageReport::default()
    };
    if queued.is_empty() {
        return Ok(report);
    }

    let keys_to_delete: Vec<String> = queued.iter().map(|(key, _)| key.clone()).collect();
    let deleted = backend
        .delete_many(&keys_to_delete)
        .await
        .map_err(|e| EngineError::RetentionPrune(e.to_string()))?;
    for failure in &deleted.failed {
        tracing::warn!(key = %failure.key, error = %failure.message, "[Retention] Object not deleted");
    }

    let refused: HashSet<&str> = deleted.failed.iter().map(|f| f.key.as_str()).collect();
    let confirmed: Vec<PendingDeletion> = queued
        .into_iter()
        .filter(|(key, _)| !refused.contains(key.as_str()))
        .map(|(_, item)| item)
        .collect();
    report.deleted = confirmed.len();
    report.failed = deleted.failed.len();
    registry.clear_deletions(target_id, confirmed).await?;

    tracing::info!(
        target_id,
        deleted = report.deleted,
        failed = report.failed,
        revived = report.revived,
        "[Retention] Garbage collection finished"
    );
    Ok(report)
}
