use super::runs::{parse_domain, parse_timestamp, timestamp};
use crate::domain::Domain;
use crate::manifest::{Manifest, ManifestEntry};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

/// A persisted manifest and where its serialized form lives.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredManifest {
    pub target_id: String,
    pub storage_key: String,
    pub manifest: Manifest,
}

struct ManifestRow {
    target_id: String,
    storage_key: String,
    manifest: Manifest,
}

fn row_to_manifest(row: &Row) -> rusqlite::Result<ManifestRow> {
    let domain: String = row.get("domain")?;
    let created_at: String = row.get("created_at")?;
    Ok(ManifestRow {
        target_id: row.get("target_id")?,
        storage_key: row.get("storage_key")?,
        manifest: Manifest {
            format_version: row.get::<_, i64>("format_version")? as u32,
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            domain: parse_domain(&domain)?,
            created_at: parse_timestamp(&created_at)?,
            parent: row.get("parent_id")?,
            entries: Vec::new(),
        },
    })
}

fn row_to_entry(row: &Row) -> rusqlite::Result<ManifestEntry> {
    let modified_at: Option<String> = row.get("modified_at")?;
    Ok(ManifestEntry {
        path: row.get("path")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        fingerprint: row.get("fingerprint")?,
        modified_at: modified_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn load_entries(conn: &Connection, row: ManifestRow) -> anyhow::Result<StoredManifest> {
    let mut stmt = conn.prepare(
        "SELECT path, size_bytes, fingerprint, modified_at FROM manifest_entries
         WHERE manifest_id = ? ORDER BY path",
    )?;
    let entries = stmt
        .query_map(params![row.manifest.id], |r| row_to_entry(r))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut manifest = row.manifest;
    manifest.entries = entries;
    Ok(StoredManifest {
        target_id: row.target_id,
        storage_key: row.storage_key,
        manifest,
    })
}

pub fn insert(
    conn: &mut Connection,
    target_id: &str,
    manifest: &Manifest,
    storage_key: &str,
) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO manifests (id, run_id, target_id, domain, parent_id, format_version, storage_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            manifest.id,
            manifest.run_id,
            target_id,
            manifest.domain.as_str(),
            manifest.parent,
            manifest.format_version as i64,
            storage_key,
            timestamp(&manifest.created_at)
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO manifest_entries (manifest_id, path, size_bytes, fingerprint, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for entry in &manifest.entries {
            stmt.execute(params![
                manifest.id,
                entry.path,
                entry.size_bytes as i64,
                entry.fingerprint,
                entry.modified_at.as_ref().map(timestamp)
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<StoredManifest>> {
    let row = conn
        .query_row("SELECT * FROM manifests WHERE id = ?", params![id], |r| {
            row_to_manifest(r)
        })
        .optional()?;
    row.map(|r| load_entries(conn, r)).transpose()
}

/// Newest manifest of a target's domain lineage written by a run that
/// finished as succeeded or partial. Manifests of failed, aborted or
/// still running runs never become a parent.
pub fn find_latest(
    conn: &Connection,
    target_id: &str,
    domain: Domain,
) -> anyhow::Result<Option<StoredManifest>> {
    let row = conn
        .query_row(
            "SELECT m.* FROM manifests m JOIN backup_runs r ON r.id = m.run_id
             WHERE m.target_id = ? AND m.domain = ? AND r.status IN ('succeeded', 'partial')
             ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1",
            params![target_id, domain.as_str()],
            |r| row_to_manifest(r),
        )
        .optional()?;
    row.map(|r| load_entries(conn, r)).transpose()
}

pub fn find_by_run(conn: &Connection, run_id: &str) -> anyhow::Result<Vec<StoredManifest>> {
    let mut stmt =
        conn.prepare("SELECT * FROM manifests WHERE run_id = ? ORDER BY created_at, rowid")?;
    let rows = stmt
        .query_map(params![run_id], |r| row_to_manifest(r))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(|r| load_entries(conn, r)).collect()
}

/// Every fingerprint referenced by any remaining manifest of the target.
pub fn referenced_fingerprints(conn: &Connection, target_id: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e.fingerprint FROM manifest_entries e
         JOIN manifests m ON m.id = e.manifest_id WHERE m.target_id = ?",
    )?;
    let rows = stmt.query_map(params![target_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
}

/// Fingerprints referenced by the manifests of one run.
pub fn run_fingerprints(conn: &Connection, run_id: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT e.fingerprint FROM manifest_entries e
         JOIN manifests m ON m.id = e.manifest_id WHERE m.run_id = ?",
    )?;
    let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
}

/// Manifest ids from `manifest_id` back to the oldest ancestor still on
/// record. Fails if the parent chain loops.
pub fn lineage(conn: &Connection, manifest_id: &str) -> anyhow::Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(manifest_id.to_string());

    while let Some(id) = current {
        if !seen.insert(id.clone()) {
            anyhow::bail!("manifest lineage contains a cycle at {id}");
        }
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM manifests WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) => {
                chain.push(id);
                current = parent;
            }
            // Parent already pruned
            None => break,
        }
    }
    Ok(chain)
}
