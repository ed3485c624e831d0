//! Server-side chunk session manager.
//!
//! Tracks, per transfer, which chunk indices have been durably written and
//! verified, and persists that state under a state directory so that a
//! client can resume after either side restarts.
//!
//! ## Table layout
//!
//! Sessions live in an arena keyed by a stable session id. A separate index
//! maps resume tokens to session ids. Both maps sit behind one lock, which is
//! never held across disk I/O. Callers only ever receive clones or handles.
//!
//! A session is owned by at most one connection at a time: `initialize` and
//! `restore` attach it, `release`, `finalize` and `cleanup` detach it.

mod record;

pub use record::{partial_path_for, SessionRecord, SessionStatus, SESSION_FILE_SUFFIX};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checksum;
use crate::error::{Error, ProtocolViolation, Result};
use crate::protocol::{ChunkData, ChunkResult, TransferRequest};

/// What a connection handler gets back from `initialize` / `restore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session identifier
    pub session_id: Uuid,
    /// Token the client can use to re-attach
    pub resume_token: String,
    /// Chunks already completed, ascending
    pub completed_chunks: Vec<u64>,
    /// Whether this handle came from a restore
    pub restored: bool,
}

/// Resume progress of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    /// Session identifier
    pub session_id: Uuid,
    /// Chunks already completed, ascending
    pub completed_chunks: Vec<u64>,
    /// Expected number of chunks
    pub chunk_count: u64,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<Uuid, SessionRecord>,
    resume_index: HashMap<String, Uuid>,
    attached: HashSet<Uuid>,
}

impl SessionTable {
    fn insert(&mut self, record: SessionRecord) {
        if record.status == SessionStatus::Active {
            self.resume_index
                .insert(record.resume_token.clone(), record.session_id);
        }
        self.sessions.insert(record.session_id, record);
    }

    fn remove(&mut self, session_id: &Uuid) -> Option<SessionRecord> {
        let record = self.sessions.remove(session_id)?;
        self.resume_index.remove(&record.resume_token);
        self.attached.remove(session_id);
        Some(record)
    }
}

/// Chunk session manager shared by all connection handlers.
#[derive(Debug)]
pub struct SessionManager {
    state_dir: PathBuf,
    table: Mutex<SessionTable>,
}

impl SessionManager {
    /// Open a manager over `state_dir`, reloading persisted sessions.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).await.map_err(|e| {
            Error::Io(std::io::Error::other(format!(
                "Failed to create session state directory {}: {e}",
                state_dir.display()
            )))
        })?;

        let mut table = SessionTable::default();
        let mut entries = fs::read_dir(&state_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !filename.ends_with(SESSION_FILE_SUFFIX) {
                continue;
            }

            match record::load_record(&path).await {
                Ok(record) => table.insert(record),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable session record"
                ),
            }
        }

        if !table.sessions.is_empty() {
            tracing::info!(
                count = table.sessions.len(),
                state_dir = %state_dir.display(),
                "Restored persisted transfer sessions"
            );
        }

        Ok(Self {
            state_dir,
            table: Mutex::new(table),
        })
    }

    /// Directory holding session records.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Create a new session for a chunked transfer and attach it.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunking strategy is invalid or the partial
    /// file or record cannot be created.
    pub async fn initialize(
        &self,
        request: &TransferRequest,
        destination: PathBuf,
    ) -> Result<SessionHandle> {
        request.chunking_strategy.validate()?;

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let record = SessionRecord {
            session_id,
            transfer_id: request.transfer_id,
            resume_token: generate_resume_token(),
            client_id: request.client_id.clone(),
            metadata: request.metadata.clone(),
            chunk_size: request.chunking_strategy.chunk_size,
            chunk_count: request.chunk_count(),
            completed_chunks: BTreeSet::new(),
            partial_path: partial_path_for(&destination, &session_id),
            destination,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };

        fs::File::create(&record.partial_path).await?;
        record::save_record(&self.state_dir, &record).await?;

        let handle = SessionHandle {
            session_id,
            resume_token: record.resume_token.clone(),
            completed_chunks: Vec::new(),
            restored: false,
        };

        tracing::debug!(
            session_id = %session_id,
            transfer_id = %record.transfer_id,
            chunk_count = record.chunk_count,
            "Initialized transfer session"
        );

        let mut table = self.table.lock().await;
        table.attached.insert(session_id);
        table.insert(record);

        Ok(handle)
    }

    /// Re-attach a previous session by resume token.
    ///
    /// The session is re-keyed to the request's transfer id; the resume
    /// token keeps pointing at it.
    ///
    /// # Errors
    ///
    /// - `Error::SessionNotFound` if no active session has this token
    /// - `Error::ResumeMismatch` if the session belongs to another client,
    ///   describes different content or chunking, is attached to another
    ///   connection, or its partial file has disappeared
    pub async fn restore(
        &self,
        resume_token: &str,
        request: &TransferRequest,
    ) -> Result<SessionHandle> {
        let mut record = {
            let mut table = self.table.lock().await;
            let session_id = *table
                .resume_index
                .get(resume_token)
                .ok_or_else(|| Error::SessionNotFound("unknown resume token".to_string()))?;
            let record = table
                .sessions
                .get(&session_id)
                .cloned()
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

            check_compatible(&record, request)?;

            if !table.attached.insert(session_id) {
                return Err(Error::ResumeMismatch(format!(
                    "session {session_id} is in use by another connection"
                )));
            }
            record
        };

        if !fs::try_exists(&record.partial_path).await.unwrap_or(false) {
            self.release(record.session_id).await;
            return Err(Error::ResumeMismatch(format!(
                "partial file {} is missing",
                record.partial_path.display()
            )));
        }

        let previous = record.transfer_id;
        record.transfer_id = request.transfer_id;
        record.updated_at = Utc::now();
        record::save_record(&self.state_dir, &record).await?;

        tracing::info!(
            session_id = %record.session_id,
            previous_transfer_id = %previous,
            transfer_id = %record.transfer_id,
            completed = record.completed_chunks.len(),
            chunk_count = record.chunk_count,
            "Restored transfer session"
        );

        let handle = SessionHandle {
            session_id: record.session_id,
            resume_token: record.resume_token.clone(),
            completed_chunks: record.completed_list(),
            restored: true,
        };

        self.table.lock().await.insert(record);
        Ok(handle)
    }

    /// Resume progress for a token.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if no active session has this token.
    pub async fn resume_info(&self, resume_token: &str) -> Result<ResumeInfo> {
        let table = self.table.lock().await;
        let record = table
            .resume_index
            .get(resume_token)
            .and_then(|id| table.sessions.get(id))
            .ok_or_else(|| Error::SessionNotFound("unknown resume token".to_string()))?;

        Ok(ResumeInfo {
            session_id: record.session_id,
            completed_chunks: record.completed_list(),
            chunk_count: record.chunk_count,
        })
    }

    /// Snapshot of a session.
    pub async fn get(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.table.lock().await.sessions.get(&session_id).cloned()
    }

    /// Next chunk index the session will accept.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for an unknown session.
    pub async fn next_expected_chunk(&self, session_id: Uuid) -> Result<u64> {
        self.table
            .lock()
            .await
            .sessions
            .get(&session_id)
            .map(SessionRecord::next_expected_chunk)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Verify and durably write one chunk, then mark it completed.
    ///
    /// Chunks must arrive in strict index order.
    ///
    /// # Errors
    ///
    /// - `ProtocolViolation::OutOfOrder` if the index is not the next expected
    /// - `ProtocolViolation::Malformed` for a foreign transfer id, an index out
    ///   of range, a wrong length or a misplaced last-chunk flag
    /// - `Error::ChecksumMismatch` if the MD5 does not match
    /// - I/O errors from writing the partial file or the record
    pub async fn record_chunk(&self, session_id: Uuid, chunk: &ChunkData) -> Result<ChunkResult> {
        let (partial_path, offset) = {
            let table = self.table.lock().await;
            let record = table
                .sessions
                .get(&session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            validate_chunk(record, chunk)?
        };

        let actual = checksum::md5_bytes(&chunk.data);
        if !checksum::digests_match(&actual, &chunk.chunk_checksum) {
            return Err(Error::ChecksumMismatch {
                target: format!("chunk {}", chunk.chunk_index),
                expected: chunk.chunk_checksum.clone(),
                actual,
            });
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&partial_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&chunk.data).await?;
        file.sync_data().await?;
        drop(file);

        let snapshot = {
            let mut table = self.table.lock().await;
            let record = table
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            record.completed_chunks.insert(chunk.chunk_index);
            record.updated_at = Utc::now();
            record.clone()
        };
        record::save_record(&self.state_dir, &snapshot).await?;

        tracing::trace!(
            session_id = %session_id,
            chunk_index = chunk.chunk_index,
            "Recorded chunk"
        );

        Ok(ChunkResult::ok(chunk.chunk_index))
    }

    /// Move the completed file into place.
    ///
    /// Calling this again on a finalized session returns the same path and
    /// leaves the file untouched.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if chunks are missing, or an I/O error if
    /// the rename fails.
    pub async fn finalize(&self, session_id: Uuid) -> Result<PathBuf> {
        let record = {
            let table = self.table.lock().await;
            table
                .sessions
                .get(&session_id)
                .cloned()
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
        };

        if record.status == SessionStatus::Finalized {
            tracing::debug!(session_id = %session_id, "Session already finalized");
            return Ok(record.destination);
        }

        if !record.is_complete() {
            return Err(ProtocolViolation::Malformed(format!(
                "cannot finalize session {session_id}: {} of {} chunks completed",
                record.completed_chunks.len(),
                record.chunk_count
            ))
            .into());
        }

        fs::rename(&record.partial_path, &record.destination).await?;

        let snapshot = {
            let mut table = self.table.lock().await;
            table.resume_index.remove(&record.resume_token);
            table.attached.remove(&session_id);
            let entry = table
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            entry.status = SessionStatus::Finalized;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        record::save_record(&self.state_dir, &snapshot).await?;

        tracing::info!(
            session_id = %session_id,
            transfer_id = %snapshot.transfer_id,
            path = %snapshot.destination.display(),
            "Finalized transfer session"
        );

        Ok(snapshot.destination)
    }

    /// Detach a session from its connection without changing its state.
    pub async fn release(&self, session_id: Uuid) {
        self.table.lock().await.attached.remove(&session_id);
    }

    /// Remove a session, its partial file and its record.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be removed.
    pub async fn cleanup(&self, session_id: Uuid) -> Result<()> {
        let Some(record) = self.table.lock().await.remove(&session_id) else {
            return Ok(());
        };

        if record.status == SessionStatus::Active {
            record::remove_if_exists(&record.partial_path).await?;
        }
        record::remove_if_exists(&record::record_path(&self.state_dir, &session_id)).await?;

        tracing::debug!(
            session_id = %session_id,
            status = ?record.status,
            "Cleaned up transfer session"
        );

        Ok(())
    }

    /// Remove detached sessions not touched for `max_age`.
    ///
    /// Returns the number of sessions removed.
    ///
    /// # Errors
    ///
    /// Returns the first removal error after attempting all sessions.
    pub async fn cleanup_expired(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - max_age;

        let expired: Vec<Uuid> = {
            let table = self.table.lock().await;
            table
                .sessions
                .values()
                .filter(|r| r.updated_at < cutoff && !table.attached.contains(&r.session_id))
                .map(|r| r.session_id)
                .collect()
        };

        let mut cleaned = 0;
        let mut first_error = None;
        for session_id in expired {
            match self.cleanup(session_id).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Failed to clean up expired session"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "Cleaned up expired transfer sessions");
        }

        match first_error {
            Some(e) if cleaned == 0 => Err(e),
            _ => Ok(cleaned),
        }
    }

    /// Number of sessions in the table.
    pub async fn len(&self) -> usize {
        self.table.lock().await.sessions.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start the periodic expiry task.
    #[must_use]
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration, max_age: Duration) -> CleanupTask {
        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup_expired(max_age).await {
                            tracing::warn!(error = %e, "Session cleanup pass failed");
                        }
                    }
                }
            }

            tracing::debug!("Session cleanup task stopped");
        });

        CleanupTask { cancel, handle }
    }
}

/// Handle to the periodic session expiry task.
#[derive(Debug)]
pub struct CleanupTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Session cleanup task ended abnormally");
        }
    }
}

fn generate_resume_token() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn check_compatible(record: &SessionRecord, request: &TransferRequest) -> Result<()> {
    if record.status != SessionStatus::Active {
        return Err(Error::SessionNotFound(format!(
            "session {} is already finalized",
            record.session_id
        )));
    }
    if record.client_id != request.client_id {
        return Err(Error::ResumeMismatch(
            "resume token belongs to another client".to_string(),
        ));
    }
    if !record.metadata.same_content(&request.metadata) {
        return Err(Error::ResumeMismatch(format!(
            "file '{}' ({} bytes) does not match the stored session for '{}' ({} bytes)",
            request.metadata.file_name,
            request.metadata.file_size,
            record.metadata.file_name,
            record.metadata.file_size
        )));
    }
    if record.chunk_size != request.chunking_strategy.chunk_size {
        return Err(Error::ResumeMismatch(format!(
            "chunk size {} differs from the stored {}",
            request.chunking_strategy.chunk_size, record.chunk_size
        )));
    }
    Ok(())
}

/// Check a chunk against the session; returns the partial path and offset.
fn validate_chunk(record: &SessionRecord, chunk: &ChunkData) -> Result<(PathBuf, u64)> {
    if record.status != SessionStatus::Active {
        return Err(ProtocolViolation::Malformed(format!(
            "session {} is already finalized",
            record.session_id
        ))
        .into());
    }
    if chunk.transfer_id != record.transfer_id {
        return Err(ProtocolViolation::Malformed(format!(
            "chunk for transfer {} sent on transfer {}",
            chunk.transfer_id, record.transfer_id
        ))
        .into());
    }

    let expected = record.next_expected_chunk();
    if chunk.chunk_index != expected {
        return Err(ProtocolViolation::OutOfOrder {
            expected,
            actual: chunk.chunk_index,
        }
        .into());
    }

    let offset = chunk.chunk_index * record.chunk_size;
    let expected_len = record
        .metadata
        .file_size
        .saturating_sub(offset)
        .min(record.chunk_size);
    if chunk.data.len() as u64 != expected_len {
        return Err(ProtocolViolation::Malformed(format!(
            "chunk {} carries {} bytes, expected {expected_len}",
            chunk.chunk_index,
            chunk.data.len()
        ))
        .into());
    }

    let is_last = chunk.chunk_index + 1 == record.chunk_count;
    if chunk.is_last_chunk != is_last {
        return Err(ProtocolViolation::Malformed(format!(
            "chunk {} has last-chunk flag {} but the transfer has {} chunks",
            chunk.chunk_index, chunk.is_last_chunk, record.chunk_count
        ))
        .into());
    }

    Ok((record.partial_path.clone(), offset))
}
