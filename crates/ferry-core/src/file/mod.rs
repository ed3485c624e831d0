//! File operations for Ferry.
//!
//! This module handles:
//! - Computing file metadata (size and digests) before an upload
//! - Choosing a chunking strategy for a file
//! - Reading a file chunk by chunk, with skipping for resumed transfers
//! - Path sanitization

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::checksum;
use crate::error::{Error, Result};

/// Metadata describing a file to upload.
///
/// Created by the sender before a transfer starts and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// File name (no directory components)
    pub file_name: String,
    /// Size in bytes
    pub file_size: u64,
    /// Lowercase hex MD5 of the whole file
    #[serde(rename = "checksumMD5")]
    pub checksum_md5: String,
    /// Lowercase hex SHA-256 of the whole file
    #[serde(rename = "checksumSHA256")]
    pub checksum_sha256: String,
    /// When the metadata was computed
    pub created_at: DateTime<Utc>,
}

impl FileMetadata {
    /// Compute metadata for a local file.
    ///
    /// Both digests are computed in a single read pass.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileNotFound` if the path does not exist or is not a
    /// regular file, or an I/O error if it cannot be read.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::FileNotFound(path.display().to_string()))?;

        let digests = checksum::file_digests(path).await?;

        Ok(Self {
            file_name,
            file_size: digests.size,
            checksum_md5: digests.md5,
            checksum_sha256: digests.sha256,
            created_at: Utc::now(),
        })
    }

    /// Whether two metadata records describe the same file content.
    ///
    /// The creation timestamp is ignored since it is recomputed per attempt.
    pub fn same_content(&self, other: &Self) -> bool {
        self.file_name == other.file_name
            && self.file_size == other.file_size
            && checksum::digests_match(&self.checksum_md5, &other.checksum_md5)
            && checksum::digests_match(&self.checksum_sha256, &other.checksum_sha256)
    }
}

/// How a file is split into chunks.
///
/// Chosen once per transfer and fixed for that transfer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingStrategy {
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Reserved for parallel chunk uploads; always 1 today
    pub max_concurrent_chunks: u32,
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::with_chunk_size(crate::MIN_CHUNK_SIZE)
    }
}

impl ChunkingStrategy {
    /// Create a strategy with a fixed chunk size.
    #[must_use]
    pub const fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            max_concurrent_chunks: 1,
        }
    }

    /// Choose a strategy for a file: larger files get larger chunks.
    #[must_use]
    pub const fn for_file_size(file_size: u64) -> Self {
        const MIB: u64 = 1024 * 1024;
        const GIB: u64 = 1024 * MIB;

        let chunk_size = if file_size <= 100 * MIB {
            MIB
        } else if file_size <= GIB {
            4 * MIB
        } else if file_size <= 10 * GIB {
            16 * MIB
        } else {
            crate::MAX_CHUNK_SIZE
        };

        Self::with_chunk_size(chunk_size)
    }

    /// Number of chunks a file of `file_size` bytes splits into.
    #[must_use]
    pub const fn chunk_count(&self, file_size: u64) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        file_size.div_ceil(self.chunk_size)
    }

    /// Whether the file is small enough to go over the direct (unchunked) path.
    #[must_use]
    pub const fn is_direct(&self, file_size: u64) -> bool {
        file_size <= self.chunk_size
    }

    /// Byte offset and length of chunk `index` in a file of `file_size` bytes.
    #[must_use]
    pub fn chunk_range(&self, index: u64, file_size: u64) -> (u64, u64) {
        let offset = index.saturating_mul(self.chunk_size);
        let len = file_size.saturating_sub(offset).min(self.chunk_size);
        (offset, len)
    }

    /// Check the strategy is usable on the wire.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a zero or oversized chunk size.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > crate::MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig {
                key: "chunk_size".to_string(),
                reason: format!(
                    "must be between 1 and {} bytes, got {}",
                    crate::MAX_CHUNK_SIZE,
                    self.chunk_size
                ),
            });
        }
        Ok(())
    }
}

/// Sequential chunk reader for the sender.
#[derive(Debug)]
pub struct ChunkReader {
    file: tokio::fs::File,
    strategy: ChunkingStrategy,
    file_size: u64,
    position: u64,
}

impl ChunkReader {
    /// Open a file for chunked reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(path: &Path, strategy: ChunkingStrategy, file_size: u64) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        Ok(Self {
            file,
            strategy,
            file_size,
            position: 0,
        })
    }

    /// Read the bytes of chunk `index`, which must be the next chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the file is shorter than declared.
    pub async fn read_chunk(&mut self, index: u64) -> Result<Vec<u8>> {
        let (offset, len) = self.strategy.chunk_range(index, self.file_size);
        self.expect_position(offset)?;

        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf).await?;
        self.position += len;
        Ok(buf)
    }

    /// Advance past chunk `index` without reading it.
    ///
    /// # Errors
    ///
    /// Returns an error if seeking fails.
    pub async fn skip_chunk(&mut self, index: u64) -> Result<()> {
        let (offset, len) = self.strategy.chunk_range(index, self.file_size);
        self.expect_position(offset)?;

        #[allow(clippy::cast_possible_wrap)]
        self.file.seek(SeekFrom::Current(len as i64)).await?;
        self.position += len;
        Ok(())
    }

    /// Current read offset.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    fn expect_position(&self, offset: u64) -> Result<()> {
        if offset == self.position {
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "chunk reader at offset {} but chunk starts at {offset}",
                self.position
            )))
        }
    }
}

/// Sanitize a path to prevent directory traversal attacks.
///
/// # Returns
///
/// The sanitized absolute path, or None if the path is invalid.
#[must_use]
pub fn sanitize_path(base: &Path, relative: &Path) -> Option<PathBuf> {
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }

    let full_path = base.join(relative);

    if full_path.starts_with(base) {
        Some(full_path)
    } else {
        None
    }
}

/// Reduce a client-supplied file name to a single safe path component.
///
/// # Errors
///
/// Returns an error if nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    if candidate.is_empty() || candidate == "." || candidate == ".." || candidate.contains('\0') {
        return Err(crate::error::ProtocolViolation::Malformed(format!(
            "unusable file name: {name:?}"
        ))
        .into());
    }

    Ok(candidate.to_string())
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
