//! Public entry point: download, cancel, existence and status queries.

use crate::catalog::{CatalogEntry, ExistenceResult, ModelCatalog};
use crate::config::CacheConfig;
use crate::download::{ChunkFetcher, REQUEST_TIMEOUT};
use crate::engine::{purge_partial_state, remove_artifact, DownloadEngine, DownloadOutcome};
use crate::error::{DownloadError, Result};
use crate::journal::{DownloadJournal, JournalStore};
use crate::manifest::ManifestClient;
use crate::paths::{validate_model_id, StorageLayout};
use crate::postprocess::PostProcess;
use crate::progress::ProgressCallback;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Read-only snapshot of resumable progress for a model.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    pub has_progress: bool,
    pub journal: Option<DownloadJournal>,
    /// Journal-validated chunk indices whose files are present on disk.
    pub existing_chunks: BTreeSet<u32>,
    pub missing_chunks: BTreeSet<u32>,
}

/// Main model cache manager: drives downloads and answers catalog queries.
///
/// One download per model id is admitted at a time; downloads of distinct
/// models may run concurrently and share nothing beyond the storage root.
pub struct ModelCache {
    layout: StorageLayout,
    journals: JournalStore,
    catalog: ModelCatalog,
    engine: DownloadEngine,
    active: DashMap<String, CancellationToken>,
}

impl ModelCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Like [`ModelCache::new`], with a hook that turns finalized artifacts
    /// into their platform-native inference format.
    pub fn with_post_process(config: CacheConfig, hook: Arc<dyn PostProcess>) -> Result<Self> {
        Self::build(config, Some(hook))
    }

    fn build(config: CacheConfig, hook: Option<Arc<dyn PostProcess>>) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_root)?;
        let layout = StorageLayout::new(&config.storage_root);

        let client = reqwest::Client::builder()
            .user_agent(concat!("edgen-model-cache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(REQUEST_TIMEOUT)
            .read_timeout(REQUEST_TIMEOUT)
            .build()?;

        let manifests = ManifestClient::new(
            client.clone(),
            config.base_url.clone(),
            config.credentials.clone(),
        );
        let fetcher = ChunkFetcher::new(client, layout.clone());
        let engine = DownloadEngine::new(
            layout.clone(),
            manifests,
            fetcher,
            hook,
            config.native_file_ext.clone(),
            config.free_space_probe,
        );

        Ok(Self {
            journals: JournalStore::new(layout.clone()),
            catalog: ModelCatalog::new(layout.clone(), config.native_file_ext),
            layout,
            engine,
            active: DashMap::new(),
        })
    }

    /// Download a model, resuming from any prior validated chunks. Returns
    /// the artifact and metadata paths. If the model is already complete the
    /// cached paths are returned without any network I/O.
    ///
    /// A second concurrent call for the same id fails fast with
    /// [`DownloadError::Busy`].
    pub async fn download(
        &self,
        model_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        validate_model_id(model_id)?;

        let existing = self.catalog.find_by_id(model_id);
        if let (Some(artifact_path), Some(metadata_path)) =
            (existing.artifact_path, existing.metadata_path)
        {
            log::info!("Model {} already present, skipping download", model_id);
            return Ok(DownloadOutcome {
                artifact_path,
                metadata_path,
            });
        }

        let token = CancellationToken::new();
        match self.active.entry(model_id.to_string()) {
            Entry::Occupied(_) => return Err(DownloadError::Busy(model_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let _guard = ActiveGuard {
            active: &self.active,
            model_id,
        };

        self.engine.run(model_id, on_progress, &token).await
    }

    /// Cancel any in-flight download for `model_id` and remove its resume
    /// state. Idempotent; unknown ids are a no-op.
    pub fn cancel(&self, model_id: &str) -> Result<()> {
        validate_model_id(model_id)?;
        if let Some(entry) = self.active.get(model_id) {
            // The running engine purges on-disk state as it unwinds
            entry.value().cancel();
            return Ok(());
        }
        purge_partial_state(&self.layout, model_id)
    }

    /// Whether a completed artifact exists for `model_id`.
    pub fn exists(&self, model_id: &str) -> Result<ExistenceResult> {
        validate_model_id(model_id)?;
        Ok(self.catalog.find_by_id(model_id))
    }

    /// Look up a completed artifact by its human-readable name.
    pub fn find_by_name(&self, model_name: &str) -> Result<ExistenceResult> {
        self.catalog.find_by_name(model_name)
    }

    /// Read-only view of resumable progress: which chunks are on disk and
    /// which are still missing.
    pub fn status(&self, model_id: &str) -> Result<DownloadStatus> {
        validate_model_id(model_id)?;
        let Some(journal) = self.journals.load(model_id) else {
            return Ok(DownloadStatus {
                has_progress: false,
                journal: None,
                existing_chunks: BTreeSet::new(),
                missing_chunks: BTreeSet::new(),
            });
        };

        let existing: BTreeSet<u32> = journal
            .validated_chunks
            .iter()
            .copied()
            .filter(|&index| self.layout.chunk_path(model_id, index).exists())
            .collect();
        let missing: BTreeSet<u32> = (0..journal.total_chunks)
            .filter(|index| !existing.contains(index))
            .collect();

        Ok(DownloadStatus {
            has_progress: true,
            journal: Some(journal),
            existing_chunks: existing,
            missing_chunks: missing,
        })
    }

    /// Snapshot of all completed artifacts, newest first.
    pub fn list_models(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.list_all()
    }

    /// Total bytes used by completed artifacts.
    pub fn storage_size(&self) -> Result<u64> {
        self.catalog.total_size()
    }

    /// Remove a completed artifact and its metadata.
    pub fn delete(&self, model_id: &str) -> Result<()> {
        validate_model_id(model_id)?;
        let existing = self.catalog.find_by_id(model_id);
        if !existing.exists {
            return Err(DownloadError::ModelNotFound(model_id.to_string()));
        }
        if let Some(artifact) = existing.artifact_path {
            remove_artifact(&artifact)?;
        }
        if let Some(metadata) = existing.metadata_path {
            match std::fs::remove_file(&metadata) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        log::info!("Deleted model {}", model_id);
        Ok(())
    }

    /// The configured storage directory.
    pub fn storage_root(&self) -> &std::path::Path {
        self.layout.root()
    }
}

/// Releases the per-model admission slot when a download finishes, errors
/// or is cancelled.
struct ActiveGuard<'a> {
    active: &'a DashMap<String, CancellationToken>,
    model_id: &'a str,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(self.model_id);
    }
}
