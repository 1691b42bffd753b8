//! Deterministic on-disk layout for chunks, journals, artifacts and metadata.
//!
//! All files for all models share one flat storage directory; the suffix
//! conventions below keep the kinds disjoint. Pure path math, no I/O.

use crate::error::{DownloadError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) const CHUNK_INFIX: &str = "_chunk_";
pub(crate) const JOURNAL_SUFFIX: &str = "_progress";
pub(crate) const METADATA_SUFFIX: &str = "_metadata";

const MAX_MODEL_ID_LEN: usize = 128;

/// Resolves every per-model file location under a single storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot for a single validated chunk: `<model_id>_chunk_<index>`.
    pub fn chunk_path(&self, model_id: &str, index: u32) -> PathBuf {
        self.root.join(format!("{model_id}{CHUNK_INFIX}{index}"))
    }

    /// Per-model progress journal: `<model_id>_progress`.
    pub fn journal_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}{JOURNAL_SUFFIX}"))
    }

    /// Assembled artifact in its generic form: `<model_id>`.
    pub fn artifact_path(&self, model_id: &str) -> PathBuf {
        self.root.join(model_id)
    }

    /// Post-processed artifact directory: `<model_id>.<ext>`.
    pub fn native_artifact_path(&self, model_id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{model_id}.{ext}"))
    }

    /// Metadata written alongside a finalized artifact: `<model_id>_metadata`.
    pub fn metadata_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}{METADATA_SUFFIX}"))
    }
}

/// Sibling temp path used for atomic writes: `<name>.tmp` in the same
/// directory, so the final rename never crosses filesystems.
pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Reject model ids that could escape the storage directory or collide with
/// the suffix conventions above.
pub fn validate_model_id(model_id: &str) -> Result<()> {
    if model_id.is_empty() {
        return Err(DownloadError::InvalidModelId("empty".to_string()));
    }
    if model_id.len() > MAX_MODEL_ID_LEN {
        return Err(DownloadError::InvalidModelId(format!(
            "longer than {MAX_MODEL_ID_LEN} characters"
        )));
    }
    if model_id.contains("..") {
        return Err(DownloadError::InvalidModelId(model_id.to_string()));
    }
    if model_id
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || !c.is_ascii_graphic())
    {
        return Err(DownloadError::InvalidModelId(model_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data/models");
        assert_eq!(
            layout.chunk_path("phi-2", 7),
            PathBuf::from("/data/models/phi-2_chunk_7")
        );
        assert_eq!(
            layout.journal_path("phi-2"),
            PathBuf::from("/data/models/phi-2_progress")
        );
        assert_eq!(layout.artifact_path("phi-2"), PathBuf::from("/data/models/phi-2"));
        assert_eq!(
            layout.native_artifact_path("phi-2", "mlmodelc"),
            PathBuf::from("/data/models/phi-2.mlmodelc")
        );
        assert_eq!(
            layout.metadata_path("phi-2"),
            PathBuf::from("/data/models/phi-2_metadata")
        );
    }

    #[test]
    fn test_tmp_sibling_preserves_dots_in_name() {
        // with_extension would truncate "v1.2_progress" at the dot
        let tmp = tmp_sibling(Path::new("/data/v1.2_progress"));
        assert_eq!(tmp, PathBuf::from("/data/v1.2_progress.tmp"));
    }

    #[test]
    fn test_model_id_validation() {
        assert!(validate_model_id("phi-2-q4").is_ok());
        assert!(validate_model_id("Model_1.2.3").is_ok());

        assert!(validate_model_id("").is_err());
        assert!(validate_model_id("a/b").is_err());
        assert!(validate_model_id("a\\b").is_err());
        assert!(validate_model_id("../escape").is_err());
        assert!(validate_model_id("has space").is_err());
        assert!(validate_model_id("tab\there").is_err());
        assert!(validate_model_id(&"x".repeat(129)).is_err());
    }
}
