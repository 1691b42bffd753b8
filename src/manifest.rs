//! Chunk manifest wire types and the coordination-service client.

use crate::config::Credentials;
use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pre-signed URL for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    /// Unix timestamp after which the URL is no longer valid.
    pub expiration: i64,
}

/// One downloadable chunk as described by the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSource {
    /// Zero-based, contiguous chunk index.
    #[serde(rename = "chunkIndex")]
    pub index: u32,
    #[serde(rename = "urlInfo")]
    pub url_info: SignedUrl,
    /// Lowercase hex SHA-256 of the chunk's exact bytes.
    #[serde(rename = "chunkHash")]
    pub hash: String,
}

/// Manifest returned by `POST /initDownload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "urlInfoList")]
    pub chunks: Vec<ChunkSource>,
    /// Lowercase hex SHA-256 of the fully assembled artifact.
    #[serde(rename = "hash")]
    pub whole_hash: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(rename = "fileExt")]
    pub file_ext: String,
}

impl Manifest {
    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk_hashes(&self) -> BTreeMap<u32, String> {
        self.chunks
            .iter()
            .map(|c| (c.index, c.hash.to_lowercase()))
            .collect()
    }
}

/// Authenticated client for the coordination service.
///
/// One request, no retries; retry policy belongs to the layers above.
pub struct ManifestClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl ManifestClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            credentials,
        }
    }

    /// Fetch the chunk manifest for a model id.
    pub async fn fetch(&self, model_id: &str) -> Result<Manifest> {
        let url = format!("{}/initDownload", self.base_url);
        log::debug!("Requesting manifest for {} from {}", model_id, url);

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!(
                    "Bearer {}:{}",
                    self.credentials.access_key, self.credentials.secret_key
                ),
            )
            .json(&serde_json::json!({ "modelId": model_id }))
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(DownloadError::ServerStatus(response.status().as_u16()));
        }

        let mut manifest: Manifest = response.json().await?;
        manifest.chunks.sort_by_key(|c| c.index);
        manifest.whole_hash = manifest.whole_hash.to_lowercase();

        log::info!(
            "Manifest for {}: {} chunks, ext {}",
            model_id,
            manifest.chunks.len(),
            manifest.file_ext
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_format() {
        let body = r#"{
            "urlInfoList": [
                { "chunkIndex": 1,
                  "urlInfo": { "url": "https://cdn.example.com/c1", "expiration": 1767225600 },
                  "chunkHash": "BBBB" },
                { "chunkIndex": 0,
                  "urlInfo": { "url": "https://cdn.example.com/c0", "expiration": 1767225600 },
                  "chunkHash": "aaaa" }
            ],
            "hash": "FFEE",
            "modelName": "Tiny Test",
            "modelId": "tiny-test",
            "version": "1.0",
            "description": null,
            "category": "llm",
            "fileExt": "bin"
        }"#;

        let manifest: Manifest = serde_json::from_str(body).unwrap();
        assert_eq!(manifest.total_chunks(), 2);
        assert_eq!(manifest.whole_hash, "FFEE");
        assert_eq!(manifest.model_id, "tiny-test");
        assert_eq!(manifest.description, None);
        assert_eq!(manifest.category.as_deref(), Some("llm"));
        assert_eq!(manifest.chunks[0].url_info.url, "https://cdn.example.com/c1");

        // Hash map is lowercased; keys follow chunkIndex
        let hashes = manifest.chunk_hashes();
        assert_eq!(hashes.get(&0).map(String::as_str), Some("aaaa"));
        assert_eq!(hashes.get(&1).map(String::as_str), Some("bbbb"));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let body = r#"{
            "urlInfoList": [],
            "hash": "00",
            "modelName": "m",
            "modelId": "m",
            "version": "1",
            "fileExt": "bin",
            "futureField": {"nested": true}
        }"#;
        let manifest: Manifest = serde_json::from_str(body).unwrap();
        assert_eq!(manifest.total_chunks(), 0);
    }
}
