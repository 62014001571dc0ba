use super::runs::{find_running, timestamp};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

/// What holds a target when the maintenance lock cannot be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Busy {
    Running(String),
    Maintenance(String),
}

pub fn reason(conn: &Connection, target_id: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT reason FROM target_maintenance WHERE target_id = ?",
            params![target_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Take the maintenance lock of a target. The check for a running run and
/// the insert share one immediate transaction, so a run cannot start in
/// between. Returns what holds the target when the lock is not taken.
pub fn begin(conn: &mut Connection, target_id: &str, why: &str) -> anyhow::Result<Option<Busy>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if let Some(run_id) = find_running(&tx, target_id)? {
        return Ok(Some(Busy::Running(run_id)));
    }
    if let Some(existing) = reason(&tx, target_id)? {
        return Ok(Some(Busy::Maintenance(existing)));
    }
    tx.execute(
        "INSERT INTO target_maintenance (target_id, reason, started_at) VALUES (?1, ?2, ?3)",
        params![target_id, why, timestamp(&Utc::now())],
    )?;
    tx.commit()?;
    Ok(None)
}

pub fn end(conn: &Connection, target_id: &str) -> anyhow::Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM target_maintenance WHERE target_id = ?",
        params![target_id],
    )?;
    Ok(deleted > 0)
}

/// Drop every lock left by a previous process.
pub fn clear_all(conn: &Connection) -> anyhow::Result<usize> {
    Ok(conn.execute("DELETE FROM target_maintenance", [])?)
}
