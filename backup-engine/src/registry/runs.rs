use crate::domain::Domain;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use super::maintenance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "partial" => RunStatus::Partial,
            "failed" => RunStatus::Failed,
            "aborted" => RunStatus::Aborted,
            other => anyhow::bail!("unknown run status: {other}"),
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub domain: Domain,
    pub path: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub domain: Domain,
    pub manifest_id: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub target_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub manifests: Vec<ManifestRef>,
    pub failures: Vec<FileFailure>,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

/// Final figures written when a run ends.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub failures: Vec<FileFailure>,
    pub error: Option<String>,
}

pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_domain(s: &str) -> rusqlite::Result<Domain> {
    s.parse::<Domain>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    Ok(BackupRun {
        id: row.get("id")?,
        target_id: row.get("target_id")?,
        status: status.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        started_at: parse_timestamp(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
        manifests: Vec::new(),
        failures: Vec::new(),
        files_transferred: row.get::<_, i64>("files_transferred")? as u64,
        bytes_transferred: row.get::<_, i64>("bytes_transferred")? as u64,
        error: row.get("error")?,
    })
}

fn row_to_failure(row: &Row) -> rusqlite::Result<FileFailure> {
    let domain: String = row.get("domain")?;
    Ok(FileFailure {
        domain: parse_domain(&domain)?,
        path: row.get("path")?,
        error: row.get("error")?,
        attempts: row.get::<_, i64>("attempts")? as u32,
    })
}

fn row_to_manifest_ref(row: &Row) -> rusqlite::Result<ManifestRef> {
    let domain: String = row.get("domain")?;
    Ok(ManifestRef {
        domain: parse_domain(&domain)?,
        manifest_id: row.get("id")?,
        storage_key: row.get("storage_key")?,
    })
}

/// Attach failures and manifest references to a bare run row.
fn hydrate(conn: &Connection, mut run: BackupRun) -> anyhow::Result<BackupRun> {
    let mut stmt = conn.prepare(
        "SELECT domain, path, error, attempts FROM run_failures WHERE run_id = ? ORDER BY id",
    )?;
    run.failures = stmt
        .query_map(params![run.id], |row| row_to_failure(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, domain, storage_key FROM manifests WHERE run_id = ? ORDER BY created_at, rowid",
    )?;
    run.manifests = stmt
        .query_map(params![run.id], |row| row_to_manifest_ref(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(run)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_run(row))?;
    match rows.next() {
        Some(run) => Ok(Some(hydrate(conn, run?)?)),
        None => Ok(None),
    }
}

/// Newest first. `page` starts at 1.
pub fn find_by_target(
    conn: &Connection,
    target_id: &str,
    page: u32,
    page_size: u32,
) -> anyhow::Result<Vec<BackupRun>> {
    let page_size = page_size.clamp(1, 500) as i64;
    let offset = (page.max(1) as i64 - 1) * page_size;
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE target_id = ?
         ORDER BY started_at DESC, rowid DESC LIMIT ? OFFSET ?",
    )?;
    let runs = stmt
        .query_map(params![target_id, page_size, offset], |row| row_to_run(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    runs.into_iter().map(|r| hydrate(conn, r)).collect()
}

/// Runs that wrote their manifests (succeeded or partial), newest first.
pub fn find_completed(conn: &Connection, target_id: &str) -> anyhow::Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE target_id = ? AND status IN ('succeeded', 'partial')
         ORDER BY started_at DESC, rowid DESC",
    )?;
    let runs = stmt
        .query_map(params![target_id], |row| row_to_run(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    runs.into_iter().map(|r| hydrate(conn, r)).collect()
}

pub fn find_running(conn: &Connection, target_id: &str) -> anyhow::Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM backup_runs WHERE target_id = ? AND status = 'running'")?;
    let mut rows = stmt.query_map(params![target_id], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

/// What happened when a target was asked to enter `running` state.
#[derive(Debug)]
pub enum Acquired {
    Run(BackupRun),
    AlreadyRunning,
    /// The target is held by a maintenance operation with this reason.
    Maintenance(String),
}

/// Insert a run directly in `running` state, unless another run of the same
/// target holds that state or the target is under maintenance.
pub fn insert_running(
    conn: &mut Connection,
    run_id: &str,
    target_id: &str,
    started_at: &DateTime<Utc>,
) -> anyhow::Result<Acquired> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if let Some(reason) = maintenance::reason(&tx, target_id)? {
        return Ok(Acquired::Maintenance(reason));
    }
    let result = tx.execute(
        "INSERT INTO backup_runs (id, target_id, status, started_at) VALUES (?1, ?2, 'running', ?3)",
        params![run_id, target_id, timestamp(started_at)],
    );
    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Ok(Acquired::AlreadyRunning);
        }
        Err(e) => return Err(e.into()),
    }
    let run = find_by_id(&tx, run_id)?.ok_or_else(|| anyhow::anyhow!("run {run_id} vanished"))?;
    tx.commit()?;
    Ok(Acquired::Run(run))
}

pub fn finalize(conn: &mut Connection, run_id: &str, outcome: &RunOutcome) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE backup_runs SET status = ?1, finished_at = ?2, files_transferred = ?3,
         bytes_transferred = ?4, error = ?5 WHERE id = ?6",
        params![
            outcome.status.as_str(),
            timestamp(&Utc::now()),
            outcome.files_transferred as i64,
            outcome.bytes_transferred as i64,
            outcome.error,
            run_id
        ],
    )?;
    if updated == 0 {
        anyhow::bail!("run {run_id} does not exist");
    }
    {
        let mut stmt = tx.prepare(
            "INSERT INTO run_failures (run_id, domain, path, error, attempts) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for failure in &outcome.failures {
            stmt.execute(params![
                run_id,
                failure.domain.as_str(),
                failure.path,
                failure.error,
                failure.attempts as i64
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Flip every `running` run to `aborted`. Returns how many were changed.
pub fn mark_interrupted(conn: &Connection) -> anyhow::Result<usize> {
    let changed = conn.execute(
        "UPDATE backup_runs SET status = 'aborted', finished_at = ?1,
         error = COALESCE(error, 'interrupted by process shutdown') WHERE status = 'running'",
        params![timestamp(&Utc::now())],
    )?;
    Ok(changed)
}

/// Removes the run together with its failures, manifests and entries.
pub fn delete(conn: &Connection, run_id: &str) -> anyhow::Result<bool> {
    let deleted = conn.execute("DELETE FROM backup_runs WHERE id = ?", params![run_id])?;
    Ok(deleted > 0)
}
