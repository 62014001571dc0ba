//! Manifest model, change sets and the on-disk codec.
//!
//! A manifest lists every file of one domain at the time of a run, sorted by
//! relative path. It is immutable once written.

pub mod builder;

pub use builder::ManifestBuilder;

use crate::domain::Domain;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub size_bytes: u64,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format_version: u32,
    #[serde(rename = "manifestId")]
    pub id: String,
    pub run_id: String,
    pub domain: Domain,
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "parentManifestRef",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent: Option<String>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(run_id: &str, domain: Domain, parent: Option<String>, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            format_version: FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            domain,
            created_at: Utc::now(),
            parent,
            entries,
        }
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn fingerprints(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| e.fingerprint.as_str()).collect()
    }
}

/// Paths that differ between a new walk and the parent manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    /// Files left out of the manifest because their path is not valid
    /// UTF-8, shown with replacement characters.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl ChangeSet {
    /// Compare `current` against `parent` by path and fingerprint. Without a
    /// parent every entry is added.
    pub fn between(parent: Option<&Manifest>, current: &[ManifestEntry]) -> Self {
        let previous: HashMap<&str, &str> = parent
            .map(|m| {
                m.entries
                    .iter()
                    .map(|e| (e.path.as_str(), e.fingerprint.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut changes = ChangeSet::default();
        let mut seen = HashSet::with_capacity(current.len());
        for entry in current {
            seen.insert(entry.path.as_str());
            match previous.get(entry.path.as_str()) {
                None => changes.added.push(entry.path.clone()),
                Some(fp) if *fp != entry.fingerprint => changes.modified.push(entry.path.clone()),
                Some(_) => {}
            }
        }
        if let Some(parent) = parent {
            changes.removed = parent
                .entries
                .iter()
                .filter(|e| !seen.contains(e.path.as_str()))
                .map(|e| e.path.clone())
                .collect();
        }

        changes.added.sort();
        changes.modified.sort();
        changes.removed.sort();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Paths whose content has to be transferred.
    pub fn to_transfer(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    #[default]
    Json,
    Yaml,
}

impl ManifestFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ManifestFormat::Json => "json",
            ManifestFormat::Yaml => "yaml",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ManifestFormat::Json => "application/json",
            ManifestFormat::Yaml => "application/yaml",
        }
    }

    /// Pick the format from an object key's extension.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.rsplit_once('.').map(|(_, ext)| ext) {
            Some("json") => Some(ManifestFormat::Json),
            Some("yaml") | Some("yml") => Some(ManifestFormat::Yaml),
            _ => None,
        }
    }

    pub fn encode(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        Ok(match self {
            ManifestFormat::Json => serde_json::to_vec_pretty(manifest)?,
            ManifestFormat::Yaml => serde_yaml::to_string(manifest)?.into_bytes(),
        })
    }

    pub fn decode(&self, data: &[u8]) -> Result<Manifest> {
        let manifest: Manifest = match self {
            ManifestFormat::Json => serde_json::from_slice(data)?,
            ManifestFormat::Yaml => serde_yaml::from_slice(data)?,
        };
        if manifest.format_version > FORMAT_VERSION {
            return Err(EngineError::Serialization(format!(
                "manifest format version {} is newer than supported version {}",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, fp: &str) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            size_bytes: fp.len() as u64,
            fingerprint: fp.to_string(),
            modified_at: None,
        }
    }

    #[test]
    fn test_diff_without_parent_adds_everything() {
        let current = vec![entry("b", "2"), entry("a", "1")];
        let changes = ChangeSet::between(None, &current);
        assert_eq!(changes.added, vec!["a", "b"]);
        assert!(changes.modified.is_empty() && changes.removed.is_empty());
    }

    #[test]
    fn test_diff_classifies_paths() {
        let parent = Manifest::new(
            "run-1",
            Domain::ActiveAssets,
            None,
            vec![entry("A", "aaa"), entry("B", "bbb"), entry("D", "ddd")],
        );
        let current = vec![entry("A", "aaa"), entry("B", "b2"), entry("C", "ccc")];
        let changes = ChangeSet::between(Some(&parent), &current);
        assert_eq!(changes.added, vec!["C"]);
        assert_eq!(changes.modified, vec!["B"]);
        assert_eq!(changes.removed, vec!["D"]);
        let transfer: Vec<&String> = changes.to_transfer().collect();
        assert_eq!(transfer, vec!["C", "B"]);
    }

    #[test]
    fn test_manifest_sorted_and_lookup() {
        let manifest = Manifest::new(
            "run",
            Domain::Archives,
            None,
            vec![entry("z", "1"), entry("a", "22"), entry("m/n", "333")],
        );
        let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "m/n", "z"]);
        assert_eq!(manifest.entry("m/n").unwrap().fingerprint, "333");
        assert!(manifest.entry("missing").is_none());
        assert_eq!(manifest.total_bytes(), 6);
    }

    #[test]
    fn test_codec_round_trip_both_formats() {
        let mut manifest = Manifest::new(
            "run-2",
            Domain::Database,
            Some("parent-id".into()),
            vec![entry("dump.sqlite", "abc"), entry("empty", "e3b0")],
        );
        manifest.entries[0].modified_at = Some(Utc::now());

        for format in [ManifestFormat::Json, ManifestFormat::Yaml] {
            let bytes = format.encode(&manifest).unwrap();
            let decoded = format.decode(&bytes).unwrap();
            assert_eq!(decoded.entries, manifest.entries);
            assert_eq!(decoded.parent.as_deref(), Some("parent-id"));
            assert_eq!(decoded.id, manifest.id);
        }
    }

    #[test]
    fn test_json_uses_camel_case_keys() {
        let manifest = Manifest::new("r", Domain::Database, None, vec![entry("f", "1")]);
        let value: serde_json::Value =
            serde_json::from_slice(&ManifestFormat::Json.encode(&manifest).unwrap()).unwrap();
        assert_eq!(value["formatVersion"], 1);
        assert!(value["manifestId"].is_string());
        assert_eq!(value["runId"], "r");
        assert!(value.get("parentManifestRef").is_none());
        assert_eq!(value["entries"][0]["sizeBytes"], 1);
    }

    #[test]
    fn test_rejects_newer_format_version() {
        let mut manifest = Manifest::new("r", Domain::Database, None, vec![]);
        manifest.format_version = FORMAT_VERSION + 1;
        let bytes = ManifestFormat::Json.encode(&manifest).unwrap();
        assert!(ManifestFormat::Json.decode(&bytes).is_err());
    }

    #[test]
    fn test_format_from_key() {
        assert_eq!(ManifestFormat::from_key("p/m/x.yaml"), Some(ManifestFormat::Yaml));
        assert_eq!(ManifestFormat::from_key("p/m/x.json"), Some(ManifestFormat::Json));
        assert_eq!(ManifestFormat::from_key("p/m/x"), None);
    }
}
