//! Persistent per-model download progress.
//!
//! The journal is what makes interrupted downloads resumable: it records
//! which chunk indices have been fetched and hash-verified, alongside the
//! expected digests from the manifest. It is rewritten atomically after
//! every validated chunk, so a crash at any point leaves a consistent
//! (possibly stale) journal on disk.

use crate::error::Result;
use crate::manifest::Manifest;
use crate::paths::{tmp_sibling, StorageLayout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJournal {
    pub model_id: String,
    /// Expected SHA-256 of the assembled artifact, from the manifest.
    pub whole_hash: String,
    pub file_ext: String,
    pub total_chunks: u32,
    /// index -> expected lowercase hex SHA-256.
    pub chunk_hashes: BTreeMap<u32, String>,
    /// Indices whose chunk files exist on disk and pass hash validation.
    pub validated_chunks: BTreeSet<u32>,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl DownloadJournal {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            model_id: manifest.model_id.clone(),
            whole_hash: manifest.whole_hash.to_lowercase(),
            file_ext: manifest.file_ext.clone(),
            total_chunks: manifest.total_chunks(),
            chunk_hashes: manifest.chunk_hashes(),
            validated_chunks: BTreeSet::new(),
            model_name: manifest.model_name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            category: manifest.category.clone(),
            last_updated: Utc::now(),
        }
    }

    /// Fraction of chunks validated, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.validated_chunks.len() as f64 / self.total_chunks as f64
    }

    pub fn is_complete(&self) -> bool {
        self.validated_chunks.len() as u32 == self.total_chunks && self.total_chunks > 0
    }

    /// A journal only carries over to a new run if the manifest still
    /// describes the same artifact; otherwise prior chunks must be purged.
    pub fn matches_manifest(&self, manifest: &Manifest) -> bool {
        self.whole_hash == manifest.whole_hash.to_lowercase()
            && self.total_chunks == manifest.total_chunks()
    }
}

/// Reads and writes journals under the storage root.
#[derive(Debug, Clone)]
pub struct JournalStore {
    layout: StorageLayout,
}

impl JournalStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Load the journal for a model, if one exists. Unreadable journals are
    /// logged and treated as absent rather than failing the caller.
    pub fn load(&self, model_id: &str) -> Option<DownloadJournal> {
        let path = self.layout.journal_path(model_id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Failed to read journal {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(journal) => Some(journal),
            Err(e) => {
                log::warn!("Discarding unreadable journal {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist the journal, atomically against process crash.
    pub fn save(&self, journal: &DownloadJournal) -> Result<()> {
        let path = self.layout.journal_path(&journal.model_id);
        write_json_atomic(&path, journal)
    }

    /// Remove the journal; absence is not an error.
    pub fn delete(&self, model_id: &str) -> Result<()> {
        let path = self.layout.journal_path(model_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialize `value` as pretty JSON into a sibling temp file, fsync, then
/// rename over the destination.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = tmp_sibling(path);
    let json = serde_json::to_vec_pretty(value)?;
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ChunkSource, SignedUrl};
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        Manifest {
            chunks: (0..3)
                .map(|i| ChunkSource {
                    index: i,
                    url_info: SignedUrl {
                        url: format!("https://cdn.example.com/{i}"),
                        expiration: 1767225600,
                    },
                    hash: format!("{:064x}", i + 1),
                })
                .collect(),
            whole_hash: "AB".repeat(32),
            model_name: "Tiny Test".to_string(),
            model_id: "tiny-test".to_string(),
            version: "1.0".to_string(),
            description: Some("a test model".to_string()),
            category: None,
            file_ext: "bin".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = JournalStore::new(StorageLayout::new(temp_dir.path()));

        let mut journal = DownloadJournal::from_manifest(&sample_manifest());
        journal.validated_chunks.insert(1);
        store.save(&journal).unwrap();

        let loaded = store.load("tiny-test").unwrap();
        assert_eq!(loaded.model_id, "tiny-test");
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(loaded.validated_chunks, BTreeSet::from([1]));
        // whole_hash is normalized to lowercase on creation
        assert_eq!(loaded.whole_hash, "ab".repeat(32));
        assert_eq!(loaded.chunk_hashes.len(), 3);
    }

    #[test]
    fn test_missing_and_corrupt_journals_are_absent() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let store = JournalStore::new(layout.clone());

        assert!(store.load("nothing-here").is_none());

        std::fs::write(layout.journal_path("broken"), b"{not json").unwrap();
        assert!(store.load("broken").is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let store = JournalStore::new(layout.clone());

        let journal = DownloadJournal::from_manifest(&sample_manifest());
        let mut value = serde_json::to_value(&journal).unwrap();
        value["some_future_field"] = serde_json::json!({"x": 1});
        std::fs::write(
            layout.journal_path("tiny-test"),
            serde_json::to_vec(&value).unwrap(),
        )
        .unwrap();

        assert!(store.load("tiny-test").is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = JournalStore::new(StorageLayout::new(temp_dir.path()));

        store.delete("never-existed").unwrap();

        let journal = DownloadJournal::from_manifest(&sample_manifest());
        store.save(&journal).unwrap();
        store.delete("tiny-test").unwrap();
        store.delete("tiny-test").unwrap();
        assert!(store.load("tiny-test").is_none());
    }

    #[test]
    fn test_progress_and_manifest_match() {
        let manifest = sample_manifest();
        let mut journal = DownloadJournal::from_manifest(&manifest);
        assert_eq!(journal.progress(), 0.0);
        assert!(!journal.is_complete());

        journal.validated_chunks.extend([0, 1, 2]);
        assert_eq!(journal.progress(), 1.0);
        assert!(journal.is_complete());

        assert!(journal.matches_manifest(&manifest));

        let mut rotated = manifest.clone();
        rotated.whole_hash = "cd".repeat(32);
        assert!(!journal.matches_manifest(&rotated));

        let mut shrunk = manifest;
        shrunk.chunks.pop();
        assert!(!journal.matches_manifest(&shrunk));
    }
}
