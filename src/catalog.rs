//! Read-only catalog of completed artifacts.
//!
//! The catalog is derived entirely from the on-disk layout: every
//! `<model_id>_metadata` file marks a finished download, paired with either
//! the generic artifact file or the post-processed native directory.
//! Catalog operations never mutate state.

use crate::error::Result;
use crate::paths::{StorageLayout, METADATA_SUFFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Metadata written alongside a finalized artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub model_id: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Lowercase hex SHA-256 of the assembled artifact.
    pub hash: String,
    pub download_date: DateTime<Utc>,
}

/// One completed artifact as seen by [`ModelCatalog::list_all`].
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub metadata: ModelMetadata,
    pub artifact_path: PathBuf,
    pub metadata_path: PathBuf,
    /// On-disk size; recursive for directory artifacts.
    pub size_bytes: u64,
}

/// Result of an existence query by id or name.
#[derive(Debug, Clone)]
pub struct ExistenceResult {
    pub exists: bool,
    pub artifact_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub metadata: Option<ModelMetadata>,
}

impl ExistenceResult {
    pub(crate) fn absent() -> Self {
        Self {
            exists: false,
            artifact_path: None,
            metadata_path: None,
            metadata: None,
        }
    }
}

pub struct ModelCatalog {
    layout: StorageLayout,
    native_ext: String,
}

impl ModelCatalog {
    pub fn new(layout: StorageLayout, native_ext: impl Into<String>) -> Self {
        Self {
            layout,
            native_ext: native_ext.into(),
        }
    }

    /// Snapshot of all completed artifacts, newest download first.
    pub fn list_all(&self) -> Result<Vec<CatalogEntry>> {
        let read_dir = match std::fs::read_dir(self.layout.root()) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(model_id) = name.strip_suffix(METADATA_SUFFIX) else {
                continue;
            };
            if model_id.is_empty() {
                continue;
            }
            if let Some(entry) = self.entry_for(model_id) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| b.metadata.download_date.cmp(&a.metadata.download_date));
        Ok(entries)
    }

    /// Look up a completed artifact by model id.
    pub fn find_by_id(&self, model_id: &str) -> ExistenceResult {
        match self.entry_for(model_id) {
            Some(entry) => ExistenceResult {
                exists: true,
                artifact_path: Some(entry.artifact_path),
                metadata_path: Some(entry.metadata_path),
                metadata: Some(entry.metadata),
            },
            None => ExistenceResult::absent(),
        }
    }

    /// First completed artifact whose `model_name` matches exactly.
    pub fn find_by_name(&self, model_name: &str) -> Result<ExistenceResult> {
        for entry in self.list_all()? {
            if entry.metadata.model_name == model_name {
                return Ok(ExistenceResult {
                    exists: true,
                    artifact_path: Some(entry.artifact_path),
                    metadata_path: Some(entry.metadata_path),
                    metadata: Some(entry.metadata),
                });
            }
        }
        Ok(ExistenceResult::absent())
    }

    /// Total bytes attributable to completed artifacts.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_all()?.iter().map(|e| e.size_bytes).sum())
    }

    fn entry_for(&self, model_id: &str) -> Option<CatalogEntry> {
        let metadata_path = self.layout.metadata_path(model_id);
        let metadata = read_metadata(&metadata_path)?;

        // Prefer the native form when present
        let native = self.layout.native_artifact_path(model_id, &self.native_ext);
        let generic = self.layout.artifact_path(model_id);
        let artifact_path = if native.exists() {
            native
        } else if generic.exists() {
            generic
        } else {
            log::warn!("Metadata without artifact for model {}", model_id);
            return None;
        };

        let size_bytes = artifact_size(&artifact_path);
        Some(CatalogEntry {
            metadata,
            artifact_path,
            metadata_path,
            size_bytes,
        })
    }
}

fn read_metadata(path: &Path) -> Option<ModelMetadata> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Failed to read metadata {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            log::warn!("Skipping unreadable metadata {}: {}", path.display(), e);
            None
        }
    }
}

/// File length, or the recursive sum for directory artifacts.
fn artifact_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    let Ok(read_dir) = std::fs::read_dir(path) else {
        return 0;
    };
    read_dir
        .flatten()
        .map(|entry| artifact_size(&entry.path()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn write_completed(
        layout: &StorageLayout,
        model_id: &str,
        model_name: &str,
        day: u32,
        native: bool,
    ) {
        let metadata = ModelMetadata {
            model_name: model_name.to_string(),
            model_id: model_id.to_string(),
            version: "1.0".to_string(),
            description: None,
            category: None,
            hash: "00".repeat(32),
            download_date: Utc.with_ymd_and_hms(2026, 7, day, 12, 0, 0).unwrap(),
        };
        std::fs::write(
            layout.metadata_path(model_id),
            serde_json::to_vec_pretty(&metadata).unwrap(),
        )
        .unwrap();

        if native {
            let dir = layout.native_artifact_path(model_id, "mlmodelc");
            std::fs::create_dir_all(dir.join("weights")).unwrap();
            std::fs::write(dir.join("net.bin"), vec![0u8; 64]).unwrap();
            std::fs::write(dir.join("weights").join("w.bin"), vec![0u8; 100]).unwrap();
        } else {
            std::fs::write(layout.artifact_path(model_id), vec![0u8; 500]).unwrap();
        }
    }

    #[test]
    fn test_list_all_orders_by_date_desc() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let catalog = ModelCatalog::new(layout.clone(), "mlmodelc");

        write_completed(&layout, "older", "Older Model", 1, false);
        write_completed(&layout, "newer", "Newer Model", 20, false);

        let entries = catalog.list_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].metadata.model_id, "newer");
        assert_eq!(entries[1].metadata.model_id, "older");
        assert_eq!(entries[0].size_bytes, 500);
    }

    #[test]
    fn test_native_artifact_preferred_and_sized_recursively() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let catalog = ModelCatalog::new(layout.clone(), "mlmodelc");

        write_completed(&layout, "compiled", "Compiled Model", 5, true);

        let result = catalog.find_by_id("compiled");
        assert!(result.exists);
        assert_eq!(
            result.artifact_path.unwrap(),
            layout.native_artifact_path("compiled", "mlmodelc")
        );

        let entries = catalog.list_all().unwrap();
        assert_eq!(entries[0].size_bytes, 164);
    }

    #[test]
    fn test_find_by_name_exact_match_only() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let catalog = ModelCatalog::new(layout.clone(), "mlmodelc");

        write_completed(&layout, "tiny-1", "Tiny", 3, false);

        assert!(catalog.find_by_name("Tiny").unwrap().exists);
        assert!(!catalog.find_by_name("tiny").unwrap().exists);
        assert!(!catalog.find_by_name("Tin").unwrap().exists);
    }

    #[test]
    fn test_metadata_without_artifact_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let catalog = ModelCatalog::new(layout.clone(), "mlmodelc");

        let metadata = ModelMetadata {
            model_name: "Orphan".to_string(),
            model_id: "orphan".to_string(),
            version: "1.0".to_string(),
            description: None,
            category: None,
            hash: "00".repeat(32),
            download_date: Utc::now(),
        };
        std::fs::write(
            layout.metadata_path("orphan"),
            serde_json::to_vec(&metadata).unwrap(),
        )
        .unwrap();

        assert!(catalog.list_all().unwrap().is_empty());
        assert!(!catalog.find_by_id("orphan").exists);
    }

    #[test]
    fn test_missing_root_lists_empty() {
        let catalog = ModelCatalog::new(StorageLayout::new("/definitely/not/here"), "mlmodelc");
        assert!(catalog.list_all().unwrap().is_empty());
    }
}
