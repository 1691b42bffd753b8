//! The download state machine.
//!
//! Plan, fetch, assemble, validate, finalize. Chunk fetches run as a
//! backfilled task set whose admission level follows the observed failure
//! ratio; the journal is rewritten after every validated chunk so a crash
//! or restart resumes without re-fetching verified bytes. Cancellation is
//! checked at every suspension point and before shared-state mutation.

use crate::catalog::ModelMetadata;
use crate::config::FreeSpaceProbe;
use crate::coordinator::ChunkTracker;
use crate::download::ChunkFetcher;
use crate::error::{DownloadError, Result};
use crate::hash;
use crate::journal::{write_json_atomic, DownloadJournal, JournalStore};
use crate::manifest::{ChunkSource, Manifest, ManifestClient};
use crate::paths::{tmp_sibling, StorageLayout, CHUNK_INFIX, JOURNAL_SUFFIX};
use crate::postprocess::PostProcess;
use crate::progress::{
    estimate_total_bytes, DownloadPhase, ProgressCallback, ProgressEmitter,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Paths produced by a successful download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub artifact_path: PathBuf,
    pub metadata_path: PathBuf,
}

pub(crate) struct DownloadEngine {
    layout: StorageLayout,
    journals: JournalStore,
    manifests: ManifestClient,
    fetcher: Arc<ChunkFetcher>,
    post_process: Option<Arc<dyn PostProcess>>,
    native_file_ext: String,
    free_space_probe: Option<FreeSpaceProbe>,
}

impl DownloadEngine {
    pub fn new(
        layout: StorageLayout,
        manifests: ManifestClient,
        fetcher: ChunkFetcher,
        post_process: Option<Arc<dyn PostProcess>>,
        native_file_ext: String,
        free_space_probe: Option<FreeSpaceProbe>,
    ) -> Self {
        Self {
            journals: JournalStore::new(layout.clone()),
            layout,
            manifests,
            fetcher: Arc::new(fetcher),
            post_process,
            native_file_ext,
            free_space_probe,
        }
    }

    /// Drive one download to completion. On cancellation all chunk files and
    /// the journal are removed; on other failures they are kept so a later
    /// run can resume.
    pub async fn run(
        &self,
        model_id: &str,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let result = self.run_inner(model_id, callback, cancel).await;
        if matches!(result, Err(DownloadError::Cancelled)) {
            log::info!("Download of {} cancelled, purging partial state", model_id);
            if let Err(e) = purge_partial_state(&self.layout, model_id) {
                log::warn!("Cleanup after cancellation failed for {}: {}", model_id, e);
            }
            // An assembled artifact without metadata is this run's leftover
            if !self.layout.metadata_path(model_id).exists() {
                let _ = remove_artifact(&self.layout.artifact_path(model_id));
            }
        }
        result
    }

    async fn run_inner(
        &self,
        model_id: &str,
        callback: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        ProgressEmitter::emit_initializing(&callback);

        let manifest = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            m = self.manifests.fetch(model_id) => m?,
        };

        let mut journal = self.plan(model_id, &manifest, cancel).await?;

        let compile_hook = if manifest.file_ext == self.native_file_ext {
            self.post_process.clone()
        } else {
            None
        };
        if manifest.file_ext == self.native_file_ext && compile_hook.is_none() {
            log::warn!(
                "Model {} requests native post-processing but no hook is configured; keeping the generic artifact",
                model_id
            );
        }
        let will_compile = compile_hook.is_some();
        let total_chunks = manifest.total_chunks();
        let emitter = ProgressEmitter::new(callback, total_chunks, will_compile);

        // Seed the tracker with chunks that survived re-validation
        let tracker = Arc::new(ChunkTracker::new());
        for &index in &journal.validated_chunks {
            let size = std::fs::metadata(self.layout.chunk_path(model_id, index))
                .map(|m| m.len())
                .unwrap_or(0);
            tracker.mark_validated(index, size);
        }
        emitter.reset_baseline(tracker.downloaded_bytes());

        emitter.emit_phase(
            DownloadPhase::Downloading,
            tracker.completed_chunks(),
            tracker.downloaded_bytes(),
            estimate_total_bytes(
                tracker.downloaded_bytes(),
                tracker.completed_chunks(),
                total_chunks,
            ),
        );

        // With resumed chunks the size estimate is already known, so the
        // space guard can run before any fetch is launched
        let mut guard_done = false;
        if tracker.completed_chunks() > 0 {
            self.enforce_disk_space(&tracker, total_chunks)?;
            guard_done = true;
        }

        let pending: VecDeque<ChunkSource> = manifest
            .chunks
            .iter()
            .filter(|c| !tracker.is_validated(c.index))
            .cloned()
            .collect();
        self.fetch_all(
            model_id,
            pending,
            &mut journal,
            Arc::clone(&tracker),
            &emitter,
            cancel,
            guard_done,
        )
        .await?;

        let downloaded = tracker.downloaded_bytes();

        // Merging
        emitter.emit_phase(DownloadPhase::Merging, total_chunks, downloaded, downloaded);
        let generic = self.layout.artifact_path(model_id);
        let artifact_tmp = tmp_sibling(&generic);
        if let Err(err) = self
            .merge_chunks(model_id, &journal, &artifact_tmp, cancel)
            .await
        {
            let _ = std::fs::remove_file(&artifact_tmp);
            return Err(err);
        }

        // Validating
        emitter.emit_phase(DownloadPhase::Validating, total_chunks, downloaded, downloaded);
        let digest = hash::sha256_file_async(&artifact_tmp).await?;
        if digest != journal.whole_hash {
            log::error!(
                "Assembled artifact for {} hashes to {} but manifest expects {}",
                model_id,
                digest,
                journal.whole_hash
            );
            let _ = std::fs::remove_file(&artifact_tmp);
            return Err(DownloadError::WholeHashMismatch);
        }
        remove_artifact(&generic)?;
        std::fs::rename(&artifact_tmp, &generic)?;

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        // Post-processing
        let artifact_path = if let Some(hook) = compile_hook {
            emitter.emit_phase(DownloadPhase::Compiling, total_chunks, downloaded, downloaded);
            match hook.transform(&generic, model_id).await {
                Ok(final_path) => {
                    if final_path != generic && generic.exists() {
                        remove_artifact(&generic)?;
                    }
                    final_path
                }
                // Artifact and journal stay on disk for inspection
                Err(DownloadError::PostProcessFailed(reason)) => {
                    return Err(DownloadError::PostProcessFailed(reason))
                }
                Err(err) => return Err(DownloadError::PostProcessFailed(err.to_string())),
            }
        } else {
            generic.clone()
        };

        // Finalizing: metadata appears, then resume state goes away
        let metadata = ModelMetadata {
            model_name: journal.model_name.clone(),
            model_id: model_id.to_string(),
            version: journal.version.clone(),
            description: journal.description.clone(),
            category: journal.category.clone(),
            hash: journal.whole_hash.clone(),
            download_date: Utc::now(),
        };
        let metadata_path = self.layout.metadata_path(model_id);
        write_json_atomic(&metadata_path, &metadata)?;
        self.journals.delete(model_id)?;
        purge_partial_state(&self.layout, model_id)?;

        emitter.emit_phase(DownloadPhase::Complete, total_chunks, downloaded, downloaded);
        log::info!(
            "Model {} downloaded: {} bytes in {} chunks",
            model_id,
            downloaded,
            total_chunks
        );
        Ok(DownloadOutcome {
            artifact_path,
            metadata_path,
        })
    }

    /// Reconcile any prior journal with the fresh manifest. A changed
    /// manifest invalidates all prior progress.
    async fn plan(
        &self,
        model_id: &str,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<DownloadJournal> {
        if let Some(journal) = self.journals.load(model_id) {
            if journal.matches_manifest(manifest) {
                return self.revalidate(model_id, journal, cancel).await;
            }
            log::info!("Manifest changed for {}; discarding prior progress", model_id);
            purge_partial_state(&self.layout, model_id)?;
        }
        let journal = DownloadJournal::from_manifest(manifest);
        self.journals.save(&journal)?;
        Ok(journal)
    }

    /// Re-hash every chunk the journal claims is validated, dropping the
    /// ones that are missing or no longer match.
    async fn revalidate(
        &self,
        model_id: &str,
        mut journal: DownloadJournal,
        cancel: &CancellationToken,
    ) -> Result<DownloadJournal> {
        let claimed: Vec<u32> = journal.validated_chunks.iter().copied().collect();
        for index in claimed {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let path = self.layout.chunk_path(model_id, index);
            let expected = journal.chunk_hashes.get(&index).cloned().unwrap_or_default();
            let keep = match hash::sha256_file_async(&path).await {
                Ok(digest) => digest == expected,
                Err(_) => false,
            };
            if !keep {
                log::warn!(
                    "Dropping chunk {} of {}: missing or invalid on disk",
                    index,
                    model_id
                );
                journal.validated_chunks.remove(&index);
                let _ = std::fs::remove_file(&path);
            }
        }
        journal.last_updated = Utc::now();
        self.journals.save(&journal)?;
        Ok(journal)
    }

    /// Concurrent fetch loop with adaptive admission. New fetches are
    /// backfilled as others complete, never exceeding the current level.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_all(
        &self,
        model_id: &str,
        mut pending: VecDeque<ChunkSource>,
        journal: &mut DownloadJournal,
        tracker: Arc<ChunkTracker>,
        emitter: &ProgressEmitter,
        cancel: &CancellationToken,
        mut guard_done: bool,
    ) -> Result<()> {
        let total_chunks = journal.total_chunks;
        let mut tasks: JoinSet<(u32, Result<u64>)> = JoinSet::new();

        loop {
            while tasks.len() < tracker.concurrency_level() {
                let Some(chunk) = pending.pop_front() else { break };
                let fetcher = Arc::clone(&self.fetcher);
                let task_tracker = Arc::clone(&tracker);
                let task_cancel = cancel.clone();
                let task_model_id = model_id.to_string();
                tasks.spawn(async move {
                    let index = chunk.index;
                    let result = fetcher
                        .fetch(&task_model_id, &chunk, &task_tracker, &task_cancel)
                        .await;
                    (index, result)
                });
            }

            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    // Drain aborted tasks so none is still mid-write when the
                    // caller purges chunk files
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(DownloadError::Cancelled);
                }
                j = tasks.join_next() => match j {
                    Some(j) => j,
                    // Empty task set with level >= 1 means pending is drained
                    None => break,
                },
            };

            // Dropping the JoinSet on any error path aborts in-flight fetches
            let (index, result) = joined.map_err(|e| DownloadError::Disk(std::io::Error::other(e)))?;
            let size = result?;

            tracker.mark_validated(index, size);
            journal.validated_chunks.insert(index);
            journal.last_updated = Utc::now();
            self.journals.save(journal)?;
            emitter.emit_chunk(tracker.completed_chunks(), tracker.downloaded_bytes());

            if !guard_done {
                self.enforce_disk_space(&tracker, total_chunks)?;
                guard_done = true;
            }
        }
        Ok(())
    }

    /// Concatenate chunk files in index order into `dest`, re-hashing each
    /// chunk as it is written.
    async fn merge_chunks(
        &self,
        model_id: &str,
        journal: &DownloadJournal,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let layout = self.layout.clone();
        let journal = journal.clone();
        let dest = dest.to_path_buf();
        let model_id = model_id.to_string();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut out = std::fs::File::create(&dest)?;
            let mut buf = vec![0u8; hash::HASH_BUF_SIZE];
            for index in 0..journal.total_chunks {
                // chunk boundaries are the cancellation points during assembly
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                let Some(expected) = journal.chunk_hashes.get(&index) else {
                    return Err(DownloadError::ChunkCorrupted { chunk: index });
                };
                let mut chunk_file = std::fs::File::open(layout.chunk_path(&model_id, index))?;
                let mut hasher = Sha256::new();
                loop {
                    let n = chunk_file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n])?;
                }
                if hash::hex_string(&hasher.finalize()) != *expected {
                    return Err(DownloadError::ChunkCorrupted { chunk: index });
                }
            }
            out.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| DownloadError::Disk(std::io::Error::other(e)))?
    }

    fn enforce_disk_space(&self, tracker: &ChunkTracker, total_chunks: u32) -> Result<()> {
        let estimated = estimate_total_bytes(
            tracker.downloaded_bytes(),
            tracker.completed_chunks(),
            total_chunks,
        );
        if estimated == 0 {
            return Ok(());
        }
        let required = estimated.saturating_mul(2);
        let probe = self.free_space_probe.unwrap_or(available_space);
        let Some(available) = probe(self.layout.root()) else {
            log::warn!(
                "Could not determine free space under {}",
                self.layout.root().display()
            );
            return Ok(());
        };
        check_disk_space(required, available)
    }
}

/// The guard requires headroom for both the chunk set and the assembled
/// copy that briefly coexist on disk.
pub(crate) fn check_disk_space(required: u64, available: u64) -> Result<()> {
    if available < required {
        return Err(DownloadError::InsufficientDiskSpace {
            required,
            available,
        });
    }
    Ok(())
}

fn available_space(path: &Path) -> Option<u64> {
    use sysinfo::Disks;
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Remove every resume-state file for a model: chunk slots, the journal,
/// and stray temp files. Finished artifacts and metadata are untouched.
pub(crate) fn purge_partial_state(layout: &StorageLayout, model_id: &str) -> Result<()> {
    let read_dir = match std::fs::read_dir(layout.root()) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let chunk_prefix = format!("{model_id}{CHUNK_INFIX}");
    let journal_name = format!("{model_id}{JOURNAL_SUFFIX}");
    let journal_tmp = format!("{journal_name}.tmp");
    let artifact_tmp = format!("{model_id}.tmp");

    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        let matches = if let Some(rest) = name.strip_prefix(&chunk_prefix) {
            rest.trim_end_matches(".tmp").parse::<u32>().is_ok()
        } else {
            name == journal_name || name == journal_tmp || name == artifact_tmp
        };
        if !matches {
            continue;
        }
        if let Err(e) = std::fs::remove_file(entry.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", entry.path().display(), e);
            }
        }
    }
    Ok(())
}

/// Remove a finished artifact, whether it is a file or a directory.
pub(crate) fn remove_artifact(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
