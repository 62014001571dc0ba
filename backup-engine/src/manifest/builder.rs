use super::{ChangeSet, Manifest, ManifestEntry};
use crate::domain::Domain;
use crate::fs::{fingerprint_file, walk_directory, WalkOptions};
use std::path::Path;

/// Walks a domain root, fingerprints every file and diffs against the parent.
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    walk: WalkOptions,
}

impl ManifestBuilder {
    pub fn new(walk: WalkOptions) -> Self {
        Self { walk }
    }

    /// Blocking; run it on the blocking pool.
    ///
    /// The returned manifest always lists the full tree. Files that disappear
    /// between the walk and fingerprinting are left out, which makes them
    /// show up as removed. Files whose path is not valid UTF-8 have no
    /// stable key; they are left out and listed in `ChangeSet::rejected`.
    pub fn build(
        &self,
        root: &Path,
        parent: Option<&Manifest>,
        run_id: &str,
        domain: Domain,
    ) -> std::io::Result<(Manifest, ChangeSet)> {
        let files = walk_directory(root, &self.walk)?;
        let mut entries = Vec::with_capacity(files.len());
        let mut rejected = Vec::new();

        for file in files {
            if !file.utf8_path {
                tracing::warn!(path = %file.path.display(), "Skipping file with a non UTF-8 path");
                rejected.push(file.relative_path);
                continue;
            }
            match fingerprint_file(&file.path) {
                Ok(fingerprint) => entries.push(ManifestEntry {
                    path: file.relative_path,
                    size_bytes: file.size,
                    fingerprint,
                    modified_at: file.modified_at,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %file.path.display(), "File vanished before fingerprinting");
                }
                Err(e) => return Err(e),
            }
        }

        let mut changes = ChangeSet::between(parent, &entries);
        changes.rejected = rejected;
        let manifest = Manifest::new(run_id, domain, parent.map(|p| p.id.clone()), entries);

        tracing::debug!(
            domain = %domain,
            files = manifest.entries.len(),
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            rejected = changes.rejected.len(),
            "Manifest built"
        );
        Ok((manifest, changes))
    }
}
