use super::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_runs (
  id TEXT PRIMARY KEY,
  target_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('pending','running','succeeded','partial','failed','aborted')),
  started_at TEXT NOT NULL,
  finished_at TEXT,
  files_transferred INTEGER NOT NULL DEFAULT 0,
  bytes_transferred INTEGER NOT NULL DEFAULT 0,
  error TEXT
);

-- At most one running run per target.
CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_runs_single_flight
  ON backup_runs(target_id) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS idx_backup_runs_target ON backup_runs(target_id, started_at DESC);

CREATE TABLE IF NOT EXISTS run_failures (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES backup_runs(id) ON DELETE CASCADE,
  domain TEXT NOT NULL,
  path TEXT NOT NULL,
  error TEXT NOT NULL,
  attempts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_failures_run_id ON run_failures(run_id);

CREATE TABLE IF NOT EXISTS manifests (
  id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL REFERENCES backup_runs(id) ON DELETE CASCADE,
  target_id TEXT NOT NULL,
  domain TEXT NOT NULL,
  parent_id TEXT,
  format_version INTEGER NOT NULL,
  storage_key TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_manifests_lineage ON manifests(target_id, domain, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_manifests_run_id ON manifests(run_id);

CREATE TABLE IF NOT EXISTS manifest_entries (
  manifest_id TEXT NOT NULL REFERENCES manifests(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  fingerprint TEXT NOT NULL,
  modified_at TEXT,
  UNIQUE(manifest_id, path)
);

CREATE INDEX IF NOT EXISTS idx_manifest_entries_fingerprint ON manifest_entries(fingerprint);

-- Held while a backup is deleted or a target replaced. No run may start
-- while a row exists for its target, and no row is taken while one runs.
CREATE TABLE IF NOT EXISTS target_maintenance (
  target_id TEXT PRIMARY KEY,
  reason TEXT NOT NULL,
  started_at TEXT NOT NULL
);

-- Stored objects and manifests whose removal is not yet confirmed.
CREATE TABLE IF NOT EXISTS pending_deletions (
  target_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('manifest','object')),
  value TEXT NOT NULL,
  queued_at TEXT NOT NULL,
  UNIQUE(target_id, kind, value)
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting registry migration...");
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    tracing::info!("[DB] Registry migration complete");
    Ok(())
}
