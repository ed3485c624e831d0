//! Checksum computation and verification.
//!
//! MD5 is used per chunk (fast), SHA-256 per whole file (strong). File
//! digests are computed by streaming the file in fixed-size reads so that
//! multi-gigabyte backups are never loaded into memory.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// Read buffer used when hashing files.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// MD5 and SHA-256 of one file, computed in a single read pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    /// Lowercase hex MD5
    pub md5: String,
    /// Lowercase hex SHA-256
    pub sha256: String,
    /// Number of bytes hashed
    pub size: u64,
}

/// Compute the MD5 of a byte buffer as lowercase hex.
pub fn md5_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Compute the SHA-256 of a byte buffer as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Compare two hex digests, ignoring case and surrounding whitespace.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Check a byte buffer against an expected MD5.
pub fn verify_bytes(data: &[u8], expected_md5: &str) -> bool {
    digests_match(&md5_bytes(data), expected_md5)
}

/// Compute the MD5 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn md5_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Compute the SHA-256 of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute MD5 and SHA-256 of a file in one read loop.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn file_digests(path: &Path) -> Result<FileDigests> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut md5_context = md5::Context::new();
    let mut sha256_hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        md5_context.consume(&buffer[..n]);
        sha256_hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok(FileDigests {
        md5: format!("{:x}", md5_context.compute()),
        sha256: format!("{:x}", sha256_hasher.finalize()),
        size,
    })
}

/// Validate a file against optional expected digests.
///
/// With no expected digest supplied no validation was requested and the
/// result is `true`. When both are supplied the file is read only once.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn validate_file_integrity(
    path: &Path,
    expected_md5: Option<&str>,
    expected_sha256: Option<&str>,
) -> Result<bool> {
    match (expected_md5, expected_sha256) {
        (None, None) => Ok(true),
        (Some(md5), None) => Ok(digests_match(&md5_file(path).await?, md5)),
        (None, Some(sha256)) => Ok(digests_match(&sha256_file(path).await?, sha256)),
        (Some(md5), Some(sha256)) => {
            let digests = file_digests(path).await?;
            Ok(digests_match(&digests.md5, md5) && digests_match(&digests.sha256, sha256))
        }
    }
}
