use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned HTTP {0}")]
    ServerStatus(u16),

    #[error("Chunk {chunk} hash mismatch")]
    HashMismatch { chunk: u32 },

    #[error("Assembled file hash does not match the manifest")]
    WholeHashMismatch,

    #[error("Chunk {chunk} corrupted on disk")]
    ChunkCorrupted { chunk: u32 },

    #[error("Insufficient disk space: {required} bytes required, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("I/O error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model id: {0}")]
    InvalidModelId(String),

    #[error("Download already in progress for model: {0}")]
    Busy(String),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Post-processing failed: {0}")]
    PostProcessFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),
}

impl DownloadError {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn recoverable(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::ServerStatus(code) => *code == 429 || (500..600).contains(code),
            DownloadError::HashMismatch { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(DownloadError::ServerStatus(500).recoverable());
        assert!(DownloadError::ServerStatus(503).recoverable());
        assert!(DownloadError::ServerStatus(429).recoverable());
        assert!(!DownloadError::ServerStatus(404).recoverable());
        assert!(!DownloadError::ServerStatus(401).recoverable());

        assert!(DownloadError::HashMismatch { chunk: 3 }.recoverable());
        assert!(!DownloadError::WholeHashMismatch.recoverable());
        assert!(!DownloadError::ChunkCorrupted { chunk: 0 }.recoverable());
        assert!(!DownloadError::Cancelled.recoverable());
        assert!(!DownloadError::InsufficientDiskSpace {
            required: 20,
            available: 15
        }
        .recoverable());
    }
}
