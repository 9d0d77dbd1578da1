//! Content hashing
//!
//! SHA-256 over the file bytes, read in 1 MB chunks on a blocking thread so
//! multi-hundred-megabyte frames neither load fully into memory nor stall
//! the async runtime.

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::ContentHash;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Hash a file synchronously
pub fn hash_file_blocking(path: &Path) -> ArchiveResult<ContentHash> {
    let mut file = File::open(path).map_err(|e| {
        ArchiveError::Io(std::io::Error::new(
            e.kind(),
            format!("open {} for hashing: {}", path.display(), e),
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash::from_stored(format!("{:x}", hasher.finalize())))
}

/// Hash a file on the blocking thread pool
pub async fn hash_file(path: &Path) -> ArchiveResult<ContentHash> {
    let owned = path.to_path_buf();
    let hash = tokio::task::spawn_blocking(move || hash_file_blocking(&owned))
        .await
        .map_err(|e| ArchiveError::Common(afm_common::Error::Internal(format!("hash task failed: {}", e))))??;

    tracing::debug!(path = %path.display(), hash = %hash.short(), "Hashed file");
    Ok(hash)
}
