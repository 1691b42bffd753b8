//! Resumable, integrity-verified chunked model downloads.
//!
//! Given a model id, [`ModelCache::download`] obtains a manifest of
//! pre-signed chunk URLs from the coordination service, pulls the chunks
//! concurrently with retry and adaptive throttling, validates every chunk
//! against its SHA-256 digest, journals progress so interrupted downloads
//! resume without re-fetching verified bytes, assembles and re-validates
//! the final artifact, and maintains a catalog of completed models on disk.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod engine;
pub mod error;
pub mod hash;
pub mod journal;
pub mod manifest;
pub mod paths;
pub mod postprocess;
pub mod progress;

pub use cache::{DownloadStatus, ModelCache};
pub use catalog::{CatalogEntry, ExistenceResult, ModelCatalog, ModelMetadata};
pub use config::{CacheConfig, Credentials, FreeSpaceProbe};
pub use coordinator::ChunkTracker;
pub use download::ChunkFetcher;
pub use engine::DownloadOutcome;
pub use error::{DownloadError, Result};
pub use journal::{DownloadJournal, JournalStore};
pub use manifest::{ChunkSource, Manifest, ManifestClient, SignedUrl};
pub use paths::{validate_model_id, StorageLayout};
pub use postprocess::PostProcess;
pub use progress::{DetailedProgress, DownloadPhase, ProgressCallback};
