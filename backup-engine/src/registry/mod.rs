//! Run history, persisted manifests and the single-flight lock.
//!
//! Query functions in the submodules take a plain `rusqlite::Connection`;
//! [`RunRegistry`] runs them on the blocking pool.

pub mod connection;
pub mod deletions;
pub mod maintenance;
pub mod manifests;
pub mod migrate;
pub mod runs;

pub use deletions::{DeletionKind, PendingDeletion};
pub use manifests::StoredManifest;
pub use runs::{BackupRun, FileFailure, ManifestRef, RunOutcome, RunStatus};

use crate::domain::Domain;
use crate::manifest::Manifest;
use crate::utils::{EngineError, Result};
use chrono::Utc;
use connection::DbPool;
use maintenance::Busy;
use rusqlite::Connection;
use runs::Acquired;
use std::collections::HashSet;
use std::path::Path;

#[derive(Clone)]
pub struct RunRegistry {
    pool: DbPool,
}

impl RunRegistry {
    /// Open (creating if needed) the registry database and apply the schema.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let pool = connection::create_pool(db_path)?;
        migrate::migrate(&pool)?;
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.pool.clone();
        let value = tokio::task::spawn_blocking(move || {
            let mut conn = db.get()?;
            f(&mut conn)
        })
        .await??;
        Ok(value)
    }

    /// Take the single-flight lock for `target_id` by recording a new run in
    /// `running` state.
    pub async fn acquire(&self, target_id: &str) -> Result<BackupRun> {
        let target = target_id.to_string();
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let acquired = self
            .with_conn(move |conn| runs::insert_running(conn, &run_id, &target, &started_at))
            .await?;
        match acquired {
            Acquired::Run(run) => Ok(run),
            Acquired::AlreadyRunning => Err(EngineError::AlreadyRunning(target_id.to_string())),
            Acquired::Maintenance(reason) => Err(EngineError::InUse(format!(
                "target {target_id} is busy: {reason}"
            ))),
        }
    }

    /// Hold `target_id` for an operation that must not overlap a run.
    /// Fails with `InUse` while a run or another maintenance holds it.
    pub async fn begin_maintenance(&self, target_id: &str, reason: &str) -> Result<()> {
        let target = target_id.to_string();
        let why = reason.to_string();
        let busy = self
            .with_conn(move |conn| maintenance::begin(conn, &target, &why))
            .await?;
        match busy {
            None => Ok(()),
            Some(Busy::Running(run_id)) => Err(EngineError::InUse(format!(
                "target {target_id} has run {run_id} in progress"
            ))),
            Some(Busy::Maintenance(other)) => Err(EngineError::InUse(format!(
                "target {target_id} is busy: {other}"
            ))),
        }
    }

    pub async fn end_maintenance(&self, target_id: &str) -> Result<()> {
        let target = target_id.to_string();
        self.with_conn(move |conn| maintenance::end(conn, &target)).await?;
        Ok(())
    }

    /// Write the final status and failures, releasing the lock.
    pub async fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<BackupRun> {
        let id = run_id.to_string();
        self.with_conn(move |conn| {
            runs::finalize(conn, &id, &outcome)?;
            runs::find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("run {id} vanished"))
        })
        .await
    }

    pub async fn save_manifest(&self, target_id: &str, manifest: &Manifest, storage_key: &str) -> Result<()> {
        let target = target_id.to_string();
        let manifest = manifest.clone();
        let key = storage_key.to_string();
        self.with_conn(move |conn| manifests::insert(conn, &target, &manifest, &key))
            .await
    }

    /// Latest manifest of the domain lineage written by a succeeded or
    /// partial run, used as the parent of the next build.
    pub async fn latest_successful(&self, target_id: &str, domain: Domain) -> Result<Option<Manifest>> {
        let target = target_id.to_string();
        let stored = self
            .with_conn(move |conn| manifests::find_latest(conn, &target, domain))
            .await?;
        Ok(stored.map(|s| s.manifest))
    }

    pub async fn manifests_for_run(&self, run_id: &str) -> Result<Vec<StoredManifest>> {
        let id = run_id.to_string();
        self.with_conn(move |conn| manifests::find_by_run(conn, &id)).await
    }

    pub async fn status(&self, run_id: &str) -> Result<BackupRun> {
        let id = run_id.to_string();
        self.with_conn(move |conn| runs::find_by_id(conn, &id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    pub async fn history(&self, target_id: &str, page: u32, page_size: u32) -> Result<Vec<BackupRun>> {
        let target = target_id.to_string();
        self.with_conn(move |conn| runs::find_by_target(conn, &target, page, page_size))
            .await
    }

    /// Runs whose manifests were written, newest first.
    pub async fn successful_runs(&self, target_id: &str) -> Result<Vec<BackupRun>> {
        let target = target_id.to_string();
        self.with_conn(move |conn| runs::find_completed(conn, &target)).await
    }

    /// Delete a run with its manifests and queue the manifest keys and
    /// newly unreferenced objects for removal from the backend.
    pub async fn delete_run(&self, run_id: &str) -> Result<usize> {
        let id = run_id.to_string();
        let deleted = self
            .with_conn(move |conn| deletions::delete_run(conn, &id))
            .await?;
        match deleted {
            Some((target_id, queued)) => {
                tracing::debug!(run_id, target_id = %target_id, queued, "Run deleted");
                Ok(queued)
            }
            None => Err(EngineError::NotFound(format!("run {run_id}"))),
        }
    }

    pub async fn pending_deletions(&self, target_id: &str) -> Result<Vec<PendingDeletion>> {
        let target = target_id.to_string();
        self.with_conn(move |conn| deletions::pending(conn, &target)).await
    }

    /// Forget queued deletions the backend has confirmed.
    pub async fn clear_deletions(&self, target_id: &str, items: Vec<PendingDeletion>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let target = target_id.to_string();
        self.with_conn(move |conn| deletions::clear(conn, &target, &items))
            .await
    }

    pub async fn referenced_fingerprints(&self, target_id: &str) -> Result<HashSet<String>> {
        let target = target_id.to_string();
        self.with_conn(move |conn| manifests::referenced_fingerprints(conn, &target))
            .await
    }

    /// Startup sweep: runs left `running` by a previous process become
    /// `aborted`, and maintenance locks it held are released.
    pub async fn reconcile_interrupted(&self) -> Result<usize> {
        let (changed, released) = self
            .with_conn(|conn| Ok((runs::mark_interrupted(conn)?, maintenance::clear_all(conn)?)))
            .await?;
        if changed > 0 {
            tracing::warn!(count = changed, "Marked interrupted runs as aborted");
        }
        if released > 0 {
            tracing::warn!(count = released, "Released stale maintenance locks");
        }
        Ok(changed)
    }

    pub async fn manifest_lineage(&self, manifest_id: &str) -> Result<Vec<String>> {
        let id = manifest_id.to_string();
        self.with_conn(move |conn| manifests::lineage(conn, &id)).await
    }
}
