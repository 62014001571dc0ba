//! Consistent snapshot of the database domain before it is walked.

use crate::config::DatabaseSource;
use crate::utils::{EngineError, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Stderr lines kept in the error when a dump command fails.
const STDERR_TAIL_LINES: usize = 20;

/// Produce the dump inside `source.dump_dir`. With neither a SQLite file nor a
/// command configured the directory is taken as already populated.
pub async fn prepare(source: &DatabaseSource) -> Result<()> {
    tokio::fs::create_dir_all(&source.dump_dir).await?;

    if let Some(sqlite_path) = &source.sqlite_path {
        let src = sqlite_path.clone();
        let dump_dir = source.dump_dir.clone();
        let written = tokio::task::spawn_blocking(move || snapshot_sqlite(&src, &dump_dir)).await??;
        tracing::info!(path = %written.display(), "[DB Dump] SQLite snapshot written");
        return Ok(());
    }

    if let Some(command) = &source.dump_command {
        run_dump_command(command, &source.dump_dir).await?;
        tracing::info!(dir = %source.dump_dir.display(), "[DB Dump] Dump command finished");
    }
    Ok(())
}

/// `VACUUM INTO` a partial file next to the final one, then rename it over
/// the previous snapshot.
fn snapshot_sqlite(src: &Path, dump_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| EngineError::Validation(format!("not a file path: {}", src.display())))?;
    let target = dump_dir.join(name);
    let partial = dump_dir.join(format!(".partial-{}", name.to_string_lossy()));

    match std::fs::remove_file(&partial) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| EngineError::Dump(format!("{}: {}", src.display(), e)))?;
    if let Err(e) = conn.execute("VACUUM INTO ?1", [partial.to_string_lossy().as_ref()]) {
        let _ = std::fs::remove_file(&partial);
        return Err(EngineError::Dump(format!("{}: {}", src.display(), e)));
    }
    drop(conn);

    std::fs::rename(&partial, &target)?;
    Ok(target)
}

async fn run_dump_command(command: &str, dump_dir: &Path) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dump_dir)
        .env("BACKUP_DUMP_DIR", dump_dir)
        .kill_on_drop(true)
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    Err(EngineError::Dump(format!(
        "command exited with {}: {}",
        output.status,
        tail.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> DatabaseSource {
        DatabaseSource {
            dump_dir: dir.path().join("dump"),
            sqlite_path: None,
            dump_command: None,
        }
    }

    #[tokio::test]
    async fn test_sqlite_snapshot() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("app.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('hello');")
                .unwrap();
        }

        let mut src = source(&dir);
        src.sqlite_path = Some(db_path);
        prepare(&src).await.unwrap();
        // A second snapshot replaces the first
        prepare(&src).await.unwrap();

        let conn = Connection::open(src.dump_dir.join("app.db")).unwrap();
        let value: String = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(value, "hello");
        let leftovers = std::fs::read_dir(&src.dump_dir).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_missing_sqlite_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut src = source(&dir);
        src.sqlite_path = Some(dir.path().join("absent.db"));
        assert!(matches!(prepare(&src).await, Err(EngineError::Dump(_))));
    }

    #[tokio::test]
    async fn test_dump_command() {
        let dir = TempDir::new().unwrap();
        let mut src = source(&dir);
        src.dump_command = Some("echo dumped > \"$BACKUP_DUMP_DIR/out.sql\"".into());
        prepare(&src).await.unwrap();
        let content = std::fs::read_to_string(src.dump_dir.join("out.sql")).unwrap();
        assert_eq!(content.trim(), "dumped");
    }

    #[tokio::test]
    async fn test_failing_dump_command_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let mut src = source(&dir);
        src.dump_command = Some("echo boom >&2; exit 3".into());
        match prepare(&src).await {
            Err(EngineError::Dump(message)) => assert!(message.contains("boom")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
