//! Journal of stored objects and manifests waiting to be removed from a
//! backend. Rows are written in the same transaction that drops the last
//! reference and cleared only once the backend confirms the delete.

use super::manifests::{referenced_fingerprints, run_fingerprints};
use super::runs::{self, timestamp};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionKind {
    /// `value` is the storage key of a manifest.
    Manifest,
    /// `value` is a content fingerprint.
    Object,
}

impl DeletionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionKind::Manifest => "manifest",
            DeletionKind::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingDeletion {
    pub kind: DeletionKind,
    pub value: String,
}

fn row_to_pending(row: &Row) -> rusqlite::Result<PendingDeletion> {
    let kind: String = row.get("kind")?;
    let kind = match kind.as_str() {
        "manifest" => DeletionKind::Manifest,
        "object" => DeletionKind::Object,
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown deletion kind: {other}").into(),
            ))
        }
    };
    Ok(PendingDeletion {
        kind,
        value: row.get("value")?,
    })
}

pub fn queue(conn: &Connection, target_id: &str, items: &[PendingDeletion]) -> anyhow::Result<()> {
    let now = timestamp(&Utc::now());
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO pending_deletions (target_id, kind, value, queued_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for item in items {
        stmt.execute(params![target_id, item.kind.as_str(), item.value, now])?;
    }
    Ok(())
}

pub fn pending(conn: &Connection, target_id: &str) -> anyhow::Result<Vec<PendingDeletion>> {
    let mut stmt = conn.prepare(
        "SELECT kind, value FROM pending_deletions WHERE target_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map(params![target_id], |row| row_to_pending(row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn clear(conn: &mut Connection, target_id: &str, items: &[PendingDeletion]) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;
    let mut cleared = 0;
    {
        let mut stmt = tx.prepare(
            "DELETE FROM pending_deletions WHERE target_id = ?1 AND kind = ?2 AND value = ?3",
        )?;
        for item in items {
            cleared += stmt.execute(params![target_id, item.kind.as_str(), item.value])?;
        }
    }
    tx.commit()?;
    Ok(cleared)
}

/// Delete a run and queue what it leaves behind: the keys of its manifests
/// and every fingerprint no remaining manifest of the target references.
/// Returns the target and the number of queued items, or `None` when the
/// run does not exist.
pub fn delete_run(conn: &mut Connection, run_id: &str) -> anyhow::Result<Option<(String, usize)>> {
    let tx = conn.transaction()?;
    let target_id: Option<String> = tx
        .query_row(
            "SELECT target_id FROM backup_runs WHERE id = ?",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(target_id) = target_id else {
        return Ok(None);
    };

    let manifest_keys = {
        let mut stmt = tx.prepare("SELECT storage_key FROM manifests WHERE run_id = ? ORDER BY rowid")?;
        let keys = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        keys
    };
    let fingerprints = run_fingerprints(&tx, run_id)?;
    runs::delete(&tx, run_id)?;
    let still_referenced = referenced_fingerprints(&tx, &target_id)?;

    let mut released: Vec<String> = fingerprints
        .into_iter()
        .filter(|fp| !still_referenced.contains(fp))
        .collect();
    released.sort();

    let items: Vec<PendingDeletion> = manifest_keys
        .into_iter()
        .map(|value| PendingDeletion {
            kind: DeletionKind::Manifest,
            value,
        })
        .chain(released.into_iter().map(|value| PendingDeletion {
            kind: DeletionKind::Object,
            value,
        }))
        .collect();
    queue(&tx, &target_id, &items)?;
    tx.commit()?;
    Ok(Some((target_id, items.len())))
}
