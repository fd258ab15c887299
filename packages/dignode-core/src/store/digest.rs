//! # Digest & Chunker
//!
//! SHA-256 digesting and chunked reads over content files. All reads are
//! streaming; a file is never loaded whole.

use bytes::Bytes;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::Result;

/// Read buffer for streaming digests.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Whether `s` is a well-formed content digest: 64 lowercase hex chars.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// SHA-256 of a byte slice, hex-encoded.
pub fn bytes_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 of a file's full contents, hex-encoded.
pub async fn file_digest(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 accumulator over the first `bytes` bytes of a file.
///
/// Used for resume: the returned hasher continues where the existing
/// prefix left off. Errors if the file is shorter than `bytes`.
pub async fn prefix_hasher(path: &Path, bytes: u64) -> Result<Sha256> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut remaining = bytes;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(READ_BUF_SIZE as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(crate::error::Error::Io(format!(
                "file {} shorter than expected prefix of {} bytes",
                path.display(),
                bytes
            )));
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hasher)
}

/// Number of chunks covering `size` bytes. A zero-byte file has zero chunks.
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if size == 0 {
        0
    } else {
        (size + chunk_size as u64 - 1) / chunk_size as u64
    }
}

/// Read chunk `index` of a file.
///
/// Chunk `i` covers bytes `[i*chunk_size, min(size, (i+1)*chunk_size))`.
/// Returns `None` when the chunk starts at or past end-of-file.
pub async fn read_chunk(path: &Path, index: u64, chunk_size: u32) -> Result<Option<Bytes>> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let offset = index * chunk_size as u64;
    if offset >= size {
        return Ok(None);
    }
    let len = (size - offset).min(chunk_size as u64) as usize;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

// ============================================================================
// TESTS
// ============================================================================
