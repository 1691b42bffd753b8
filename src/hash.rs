//! SHA-256 helpers for chunk and artifact validation.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer size for streaming file hashes. Bounds peak memory when
/// hashing multi-gigabyte artifacts.
pub(crate) const HASH_BUF_SIZE: usize = 1024 * 1024;

/// SHA-256 of a byte slice as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_string(&Sha256::digest(data))
}

/// Streaming SHA-256 of a file as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

/// Async wrapper around [`sha256_file`] so engine tasks never block the
/// runtime on a large read.
pub async fn sha256_file_async(path: impl Into<PathBuf>) -> Result<String> {
    let path = path.into();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| std::io::Error::other(e))?
}

pub(crate) fn hex_string(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        write!(&mut out, "{b:02x}").unwrap();
    }
    out
}
