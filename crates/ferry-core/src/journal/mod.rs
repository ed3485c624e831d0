//! Client-side resume journal.
//!
//! When a chunked upload is interrupted the client keeps the resume token
//! the server issued, so that `ferry resume <file>` can re-attach later,
//! even from a new process. Entries are keyed by a hash of the source path
//! and removed once the upload succeeds.
//!
//! Journal files are stored in platform-specific directories:
//! - Linux: `~/.local/share/ferry/journal/`
//! - macOS: `~/Library/Application Support/Ferry/journal/`
//! - Windows: `%APPDATA%\Ferry\journal\`

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::checksum;
use crate::error::{Error, Result};

/// File extension for journal entries.
pub const JOURNAL_FILE_EXTENSION: &str = "ferry-resume";

/// Default expiry of journal entries (7 days).
const DEFAULT_EXPIRY_DAYS: i64 = 7;

/// One interrupted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Transfer id of the last attempt
    pub transfer_id: Uuid,
    /// Absolute path of the source file
    pub source_path: PathBuf,
    /// Server endpoint the upload targets
    pub server: String,
    /// Resume token issued by the server
    pub resume_token: String,
    /// SHA-256 of the source at upload time
    pub sha256: String,
    /// Size of the source at upload time
    pub file_size: u64,
    /// Chunk size used by the upload
    pub chunk_size: u64,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Directory of journal entries.
#[derive(Debug, Clone)]
pub struct ResumeJournal {
    dir: PathBuf,
}

impl ResumeJournal {
    /// Open the journal in the default platform-specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open_default() -> Result<Self> {
        Self::open(Self::default_dir()).await
    }

    /// Open the journal in `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "Failed to create journal directory {}: {e}",
                dir.display()
            )))
        })?;
        Ok(Self { dir })
    }

    /// Default platform-specific journal directory.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        directories::ProjectDirs::from("com", "ferry", "Ferry")
            .map_or_else(|| PathBuf::from(".ferry"), |dirs| dirs.data_dir().to_path_buf())
            .join("journal")
    }

    /// Journal directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, source: &Path) -> PathBuf {
        let key = checksum::sha256_bytes(source.to_string_lossy().as_bytes());
        self.dir
            .join(format!("{}.{JOURNAL_FILE_EXTENSION}", &key[..32]))
    }

    /// Save an entry, replacing any previous one for the same source.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    pub async fn save(&self, entry: &JournalEntry) -> Result<()> {
        let path = self.entry_path(&entry.source_path);
        let json = serde_json::to_string_pretty(entry)
            .map_err(|e| Error::Serialization(format!("Failed to serialize journal entry: {e}")))?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;

        tracing::debug!(
            transfer_id = %entry.transfer_id,
            source = %entry.source_path.display(),
            "Saved resume journal entry"
        );

        Ok(())
    }

    /// Load the entry for a source file.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but cannot be read or parsed.
    pub async fn load(&self, source: &Path) -> Result<Option<JournalEntry>> {
        let path = self.entry_path(source);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        load_entry(&path).await.map(Some)
    }

    /// Delete the entry for a source file, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be deleted.
    pub async fn delete(&self, source: &Path) -> Result<()> {
        let path = self.entry_path(source);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(source = %source.display(), "Deleted resume journal entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable entries, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != JOURNAL_FILE_EXTENSION) {
                continue;
            }
            if let Ok(entry) = load_entry(&path).await {
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }

    /// Remove entries older than the default expiry (7 days).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_older_than(chrono::Duration::days(DEFAULT_EXPIRY_DAYS))
            .await
    }

    /// Remove entries older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_older_than(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut cleaned = 0;

        for entry in self.list().await? {
            if entry.updated_at >= cutoff {
                continue;
            }
            let path = self.entry_path(&entry.source_path);
            if let Err(e) = fs::remove_file(&path).await {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete expired journal entry"
                );
            } else {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "Cleaned up expired resume journal entries");
        }

        Ok(cleaned)
    }
}

async fn load_entry(path: &Path) -> Result<JournalEntry> {
    let contents = fs::read_to_string(path).await?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Serialization(format!("Failed to parse journal entry: {e}")))
}
