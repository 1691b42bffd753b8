//! Single-chunk download: HTTP GET of a pre-signed URL, digest verification,
//! atomic placement into the chunk slot, retry with exponential backoff.

use crate::coordinator::ChunkTracker;
use crate::error::{DownloadError, Result};
use crate::hash;
use crate::manifest::ChunkSource;
use crate::paths::{tmp_sibling, StorageLayout};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Inactivity timeout applied at the HTTP client level.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Ceiling for one complete chunk transfer.
pub(crate) const RESOURCE_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_ATTEMPTS: u32 = 3;

pub struct ChunkFetcher {
    client: reqwest::Client,
    layout: StorageLayout,
}

impl ChunkFetcher {
    pub fn new(client: reqwest::Client, layout: StorageLayout) -> Self {
        Self { client, layout }
    }

    /// Download one chunk into its slot, verifying its digest. Recoverable
    /// failures are retried up to 3 attempts with `2^k` second backoff.
    /// Returns the chunk byte length.
    pub async fn fetch(
        &self,
        model_id: &str,
        chunk: &ChunkSource,
        tracker: &ChunkTracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            tracker.record_attempt();
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                r = self.try_fetch(model_id, chunk) => r,
            };
            match result {
                Ok(len) => {
                    log::debug!("Chunk {} stored ({} bytes)", chunk.index, len);
                    return Ok(len);
                }
                Err(err) => {
                    tracker.record_failure();
                    attempt += 1;
                    if !err.recoverable() || attempt >= MAX_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = Duration::from_secs(1u64 << attempt);
                    log::warn!(
                        "Chunk {} attempt {} failed, retrying in {:?}: {}",
                        chunk.index,
                        attempt,
                        delay,
                        err
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_fetch(&self, model_id: &str, chunk: &ChunkSource) -> Result<u64> {
        let response = self
            .client
            .get(&chunk.url_info.url)
            .timeout(RESOURCE_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DownloadError::ServerStatus(response.status().as_u16()));
        }

        let slot = self.layout.chunk_path(model_id, chunk.index);
        let tmp = tmp_sibling(&slot);
        match self.stream_verified(response, &tmp, chunk).await {
            Ok(len) => {
                // Replace any prior slot contents, then rename into place
                match tokio::fs::remove_file(&slot).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&tmp).await;
                        return Err(e.into());
                    }
                }
                tokio::fs::rename(&tmp, &slot).await?;
                Ok(len)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err)
            }
        }
    }

    /// Stream the response body into `tmp`, hashing as bytes arrive.
    async fn stream_verified(
        &self,
        response: reqwest::Response,
        tmp: &Path,
        chunk: &ChunkSource,
    ) -> Result<u64> {
        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut len = 0u64;

        while let Some(piece) = stream.next().await {
            let piece = piece?;
            hasher.update(&piece);
            file.write_all(&piece).await?;
            len += piece.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        let digest = hash::hex_string(&hasher.finalize());
        if digest != chunk.hash.to_lowercase() {
            log::warn!(
                "Chunk {} digest {} does not match expected {}",
                chunk.index,
                digest,
                chunk.hash
            );
            return Err(DownloadError::HashMismatch { chunk: chunk.index });
        }
        Ok(len)
    }
}
