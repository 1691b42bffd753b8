//! Optional post-processing of finalized artifacts.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Transforms the generic assembled artifact into its platform-native
/// inference format and returns the canonical on-disk path.
///
/// Invoked by the engine when the manifest's `file_ext` equals the
/// configured native extension. Implementations own the conversion (for
/// example handing the file to a native compiler); on success the engine
/// removes the generic source file if the hook has not already consumed it.
#[async_trait]
pub trait PostProcess: Send + Sync {
    async fn transform(&self, source: &Path, model_id: &str) -> Result<PathBuf>;
}
