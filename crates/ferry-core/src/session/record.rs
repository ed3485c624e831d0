//! Persisted session records.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::file::FileMetadata;

/// File name suffix of persisted session records.
pub const SESSION_FILE_SUFFIX: &str = ".session.json";

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting chunks
    Active,
    /// Every chunk written and the file moved into place
    Finalized,
}

/// Server-side state of one chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable session identifier
    pub session_id: Uuid,
    /// Transfer currently attached to the session; changes on restore
    pub transfer_id: Uuid,
    /// Token handed to the client for re-attaching
    pub resume_token: String,
    /// Owning client
    pub client_id: String,
    /// File being received
    pub metadata: FileMetadata,
    /// Chunk size fixed at initialization
    pub chunk_size: u64,
    /// Expected number of chunks
    pub chunk_count: u64,
    /// Indices durably written and verified
    pub completed_chunks: BTreeSet<u64>,
    /// Partial file receiving chunk bytes
    pub partial_path: PathBuf,
    /// Final location after finalize
    pub destination: PathBuf,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Lowest index not yet completed, or `chunk_count` if all are done.
    #[must_use]
    pub fn next_expected_chunk(&self) -> u64 {
        let completed = self.completed_chunks.len() as u64;
        // `n` distinct indices whose largest is `n - 1` are exactly `0..n`.
        match self.completed_chunks.last() {
            None => 0,
            Some(&last) if last + 1 == completed => completed.min(self.chunk_count),
            Some(_) => (0..self.chunk_count)
                .find(|index| !self.completed_chunks.contains(index))
                .unwrap_or(self.chunk_count),
        }
    }

    /// Whether every chunk index has been completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_chunks.len() as u64 == self.chunk_count
            && self.next_expected_chunk() == self.chunk_count
    }

    /// Completed indices in ascending order.
    #[must_use]
    pub fn completed_list(&self) -> Vec<u64> {
        self.completed_chunks.iter().copied().collect()
    }

    /// Bytes covered by the completed chunks.
    #[must_use]
    pub fn bytes_completed(&self) -> u64 {
        self.completed_chunks
            .iter()
            .map(|&index| {
                let offset = index.saturating_mul(self.chunk_size);
                self.metadata
                    .file_size
                    .saturating_sub(offset)
                    .min(self.chunk_size)
            })
            .sum()
    }
}

/// Path of the partial file for a destination.
///
/// The id keeps concurrent uploads of the same name apart.
#[must_use]
pub fn partial_path_for(destination: &Path, id: &Uuid) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    destination.with_file_name(format!("{name}.{}.part", id.simple()))
}

/// Path of the persisted record for a session.
pub(crate) fn record_path(state_dir: &Path, session_id: &Uuid) -> PathBuf {
    state_dir.join(format!("{session_id}{SESSION_FILE_SUFFIX}"))
}

/// Persist a record atomically.
pub(crate) async fn save_record(state_dir: &Path, record: &SessionRecord) -> Result<()> {
    let path = record_path(state_dir, &record.session_id);

    let json = serde_json::to_string(record)
        .map_err(|e| Error::Serialization(format!("Failed to serialize session record: {e}")))?;

    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, &path).await?;

    tracing::trace!(
        session_id = %record.session_id,
        completed = record.completed_chunks.len(),
        "Saved session record"
    );

    Ok(())
}

/// Load a record from disk.
pub(crate) async fn load_record(path: &Path) -> Result<SessionRecord> {
    let contents = fs::read_to_string(path).await?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Serialization(format!("Failed to parse session record: {e}")))
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
