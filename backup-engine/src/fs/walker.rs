//! Source tree traversal.
//!
//! Symbolic links are followed; a link that points back at one of its own
//! ancestors is skipped, as is anything that vanishes while the walk is in
//! progress.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File or directory names to skip, matched exactly
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: true,
            exclude_names: Vec::new(),
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root, `/`-separated
    pub relative_path: String,

    /// False when some component of the path is not valid UTF-8;
    /// `relative_path` then holds a lossy rendering.
    pub utf8_path: bool,

    pub size: u64,

    pub modified_at: Option<DateTime<Utc>>,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // With follow_links the entry metadata already describes the target.
        let metadata = entry.metadata().map_err(walk_error_to_io)?;
        let path = entry.path().to_path_buf();
        let (relative_path, utf8_path) = match relative_key(&path, root) {
            Ok(key) => (key, true),
            Err(lossy) => (lossy, false),
        };
        Ok(Self {
            relative_path,
            utf8_path,
            size: metadata.len(),
            modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            path,
        })
    }
}

/// `/`-joined path below `root`. Fails with the lossy rendering when a
/// component is not valid UTF-8.
fn relative_key(path: &Path, root: &Path) -> Result<String, String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    match parts {
        Some(parts) => Ok(parts.join("/")),
        None => Err(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")),
    }
}

fn walk_error_to_io(err: walkdir::Error) -> std::io::Error {
    let message = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, message))
}

/// Walk `root` and collect every regular file, sorted by relative path.
///
/// A missing root yields an empty listing. Unreadable directories are
/// reported as errors.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut iter = WalkDir::new(root).follow_links(options.follow_links).into_iter();
    while let Some(next) = iter.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                if let Some(ancestor) = err.loop_ancestor() {
                    tracing::warn!(
                        path = %err.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        ancestor = %ancestor.display(),
                        "Skipping symlink loop"
                    );
                    continue;
                }
                if is_not_found(&err) {
                    tracing::debug!(error = %err, "Entry vanished during walk");
                    continue;
                }
                return Err(walk_error_to_io(err));
            }
        };

        if entry.depth() > 0 && is_excluded(&entry, &options.exclude_names) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(info) => files.push(info),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %entry.path().display(), "File vanished during walk");
            }
            Err(e) => return Err(e),
        }
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or(false)
}

fn is_excluded(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| n.as_str() == file_name)
}
