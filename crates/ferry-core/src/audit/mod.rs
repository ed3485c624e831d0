//! Transfer audit trail.
//!
//! The receiver reports every transfer milestone to an [`AuditSink`].
//! Recording never blocks a transfer: [`JsonlAuditLog`] queues events on a
//! bounded channel and a background task appends them to a JSON Lines file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// Default queue depth of the write-behind log.
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditAction {
    /// Handshake accepted
    TransferStarted {
        /// File name
        file_name: String,
        /// Declared size
        file_size: u64,
        /// Number of chunks (0 for the direct path)
        chunk_count: u64,
        /// Whether a previous session was restored
        resumed: bool,
    },
    /// One chunk durably written
    ChunkCompleted {
        /// Chunk index
        chunk_index: u64,
    },
    /// File verified and moved into place
    TransferCompleted {
        /// Final path
        path: PathBuf,
        /// Bytes received on this connection
        bytes_received: u64,
    },
    /// Request rejected before any data was read
    TransferRejected {
        /// Failure classification
        kind: ErrorKind,
        /// Error message
        message: String,
    },
    /// Transfer failed after data started flowing
    TransferFailed {
        /// Failure classification
        kind: ErrorKind,
        /// Error message
        message: String,
    },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Transfer the event belongs to
    pub transfer_id: Uuid,
    /// Authenticated client, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// What happened
    #[serde(flatten)]
    pub action: AuditAction,
}

impl AuditEvent {
    /// Build an event stamped with the current time.
    pub fn new(transfer_id: Uuid, client_id: Option<&str>, action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            transfer_id,
            client_id: client_id.map(str::to_string),
            action,
        }
    }

    /// Failure event built from an error.
    pub fn failure(transfer_id: Uuid, client_id: Option<&str>, error: &Error, rejected: bool) -> Self {
        let kind = error.kind();
        let message = error.to_string();
        let action = if rejected {
            AuditAction::TransferRejected { kind, message }
        } else {
            AuditAction::TransferFailed { kind, message }
        };
        Self::new(transfer_id, client_id, action)
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record an event without blocking.
    fn record(&self, event: AuditEvent);
}

/// Sink that writes audit events to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let client_id = event.client_id.as_deref().unwrap_or("-");
        match &event.action {
            AuditAction::TransferStarted {
                file_name,
                file_size,
                chunk_count,
                resumed,
            } => tracing::info!(
                target: "ferry::audit",
                transfer_id = %event.transfer_id,
                client_id,
                file_name = %file_name,
                file_size,
                chunk_count,
                resumed,
                "transfer started"
            ),
            AuditAction::ChunkCompleted { chunk_index } => tracing::debug!(
                target: "ferry::audit",
                transfer_id = %event.transfer_id,
                client_id,
                chunk_index,
                "chunk completed"
            ),
            AuditAction::TransferCompleted {
                path,
                bytes_received,
            } => tracing::info!(
                target: "ferry::audit",
                transfer_id = %event.transfer_id,
                client_id,
                path = %path.display(),
                bytes_received,
                "transfer completed"
            ),
            AuditAction::TransferRejected { kind, message } => tracing::warn!(
                target: "ferry::audit",
                transfer_id = %event.transfer_id,
                client_id,
                kind = %kind,
                message = %message,
                "transfer rejected"
            ),
            AuditAction::TransferFailed { kind, message } => tracing::warn!(
                target: "ferry::audit",
                transfer_id = %event.transfer_id,
                client_id,
                kind = %kind,
                message = %message,
                "transfer failed"
            ),
        }
    }
}

/// Write-behind JSON Lines audit log.
#[derive(Debug)]
pub struct JsonlAuditLog {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

/// Background task appending queued events to the log file.
#[derive(Debug)]
pub struct AuditWriter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl JsonlAuditLog {
    /// Open (or create) the log file and start the writer task.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<(Self, AuditWriter)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(write_loop(file, path, rx, cancel.clone()));

        Ok((
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            AuditWriter { cancel, handle },
        ))
    }

    /// Events discarded because the queue was full or the writer had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(error = %e, dropped = total, "Audit event dropped");
        }
    }
}

impl AuditWriter {
    /// Flush queued events and stop the writer.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Audit writer ended abnormally");
        }
    }
}

async fn write_loop(
    file: tokio::fs::File,
    path: PathBuf,
    mut rx: mpsc::Receiver<AuditEvent>,
    cancel: CancellationToken,
) {
    let mut writer = tokio::io::BufWriter::new(file);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    append(&mut writer, &path, &event).await;
                }
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                append(&mut writer, &path, &event).await;
                while let Ok(event) = rx.try_recv() {
                    append(&mut writer, &path, &event).await;
                }
                if let Err(e) = writer.flush().await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to flush audit log");
                }
            }
        }
    }

    if let Err(e) = writer.flush().await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to flush audit log");
    }
}

async fn append<W>(writer: &mut W, path: &Path, event: &AuditEvent)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut line = match serde_json::to_vec(event) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize audit event");
            return;
        }
    };
    line.push(b'\n');

    if let Err(e) = writer.write_all(&line).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to append audit event");
    }
}
