//! Client configuration.
//!
//! Credentials are plain configuration passed to [`crate::ModelCache::new`];
//! there is no process-wide singleton to initialize.

use std::path::{Path, PathBuf};

/// Reports the free space of the volume holding `path`, or `None` when it
/// cannot be determined.
pub type FreeSpaceProbe = fn(&Path) -> Option<u64>;

/// Coordination-service credentials, sent as `Bearer <access>:<secret>`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

/// Configuration for a [`crate::ModelCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Base URL of the coordination service, without a trailing slash.
    pub base_url: String,
    pub credentials: Credentials,
    /// Flat directory holding artifacts, chunks, journals and metadata for
    /// all models. Must be writable and stable across restarts.
    pub storage_root: PathBuf,
    /// Manifest `file_ext` value that triggers the post-process hook. The
    /// post-processed artifact lands at `<model_id>.<native_file_ext>`.
    pub native_file_ext: String,
    /// Overrides how free disk space is measured, for platforms where the
    /// system report is unreliable (containers, network mounts). Defaults
    /// to querying the platform.
    pub free_space_probe: Option<FreeSpaceProbe>,
}

impl CacheConfig {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            storage_root: default_storage_root(),
            native_file_ext: "mlmodelc".to_string(),
            free_space_probe: None,
        }
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub fn with_native_file_ext(mut self, ext: impl Into<String>) -> Self {
        self.native_file_ext = ext.into();
        self
    }

    pub fn with_free_space_probe(mut self, probe: FreeSpaceProbe) -> Self {
        self.free_space_probe = Some(probe);
        self
    }
}

fn default_storage_root() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edgen-models")
}
