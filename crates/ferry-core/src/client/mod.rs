//! Transfer client.
//!
//! [`TcpTransferClient`] runs the sender state machine over one TCP
//! connection:
//!
//! ```text
//! Idle → Connecting → AwaitingAck → Sending → AwaitingFinal → Done
//!                                                           ↘ Failed
//! ```
//!
//! Cross-cutting behaviour is layered on with wrappers that implement the
//! same [`TransferClient`] trait, composed outermost first:
//!
//! ```rust,ignore
//! let client = WithTimeout::new(
//!     WithRetry::new(
//!         WithCredentials::new(TcpTransferClient::new(server, options), id, secret),
//!         RetryCoordinator::new(policy).with_probe_target(server),
//!     ),
//!     Duration::from_secs(3600),
//! );
//! ```
//!
//! Every attempt shares the job's [`ResumeSlot`], so a retry after an
//! interrupted chunked upload re-attaches to the server session instead of
//! starting over.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::encode_bearer_token;
use crate::config::ClientConfig;
use crate::error::{Error, ProtocolViolation, Result, TimeoutLayer};
use crate::file::{ChunkReader, ChunkingStrategy, FileMetadata};
use crate::protocol::{
    self, ChunkData, ChunkResult, MessageLimit, TransferRequest, TransferResponse,
};
use crate::retry::RetryCoordinator;

/// Buffer used when streaming a direct-path body.
const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Sender state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not started
    Idle,
    /// Establishing the TCP connection
    Connecting,
    /// Request sent, waiting for the acknowledgment
    AwaitingAck,
    /// Streaming the body or chunks
    Sending,
    /// Waiting for the final confirmation
    AwaitingFinal,
    /// Upload confirmed
    Done,
    /// Upload failed
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingAck => "awaiting_ack",
            Self::Sending => "sending",
            Self::AwaitingFinal => "awaiting_final",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Upload progress published on the client's watch channel.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    /// Current state
    pub state: ClientState,
    /// File being uploaded
    pub file_name: String,
    /// Bytes confirmed by the server, including chunks skipped on resume
    pub bytes_done: u64,
    /// File size
    pub total_bytes: u64,
    /// Chunks confirmed, including skipped ones (0 on the direct path)
    pub chunks_done: u64,
    /// Number of chunks (0 on the direct path)
    pub chunk_count: u64,
    /// When the current attempt started
    pub started_at: Instant,
}

impl UploadProgress {
    fn new(file_name: &str, total_bytes: u64, chunk_count: u64) -> Self {
        Self {
            state: ClientState::Idle,
            file_name: file_name.to_string(),
            bytes_done: 0,
            total_bytes,
            chunks_done: 0,
            chunk_count,
            started_at: Instant::now(),
        }
    }

    /// Overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Resume token shared by every attempt of one upload.
///
/// Filled in from the server's acknowledgment so that a later attempt (or a
/// later process, via the resume journal) can re-attach to the session.
#[derive(Clone, Default)]
pub struct ResumeSlot(Arc<Mutex<Option<String>>>);

impl ResumeSlot {
    /// Current token, if the server issued one.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store a token.
    pub fn set(&self, token: impl Into<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Forget the token.
    pub fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for ResumeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = self.get().is_some();
        f.debug_tuple("ResumeSlot").field(&present).finish()
    }
}

/// One file to upload.
#[derive(Clone)]
pub struct UploadJob {
    /// Local source file
    pub source: PathBuf,
    /// Metadata computed from the source
    pub metadata: FileMetadata,
    /// Chunking strategy for this upload
    pub strategy: ChunkingStrategy,
    /// Identity presented to the receiver
    pub client_id: String,
    /// Bearer token
    pub token: String,
    /// Identifier of the next attempt
    pub transfer_id: Uuid,
    /// Token to re-attach to an existing session on the first attempt
    pub resume_token: Option<String>,
    /// Token issued by the server during this upload
    pub resume: ResumeSlot,
}

impl fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadJob")
            .field("source", &self.source)
            .field("metadata", &self.metadata)
            .field("strategy", &self.strategy)
            .field("client_id", &self.client_id)
            .field("token", &"<redacted>")
            .field("transfer_id", &self.transfer_id)
            .field("resume_token", &self.resume_token.as_ref().map(|_| "<redacted>"))
            .field("resume", &self.resume)
            .finish()
    }
}

impl UploadJob {
    /// Hash the source and choose a chunking strategy for it.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileNotFound` if the source is missing, or an I/O error
    /// if it cannot be read.
    pub async fn prepare(
        source: impl AsRef<Path>,
        client_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let source = source.as_ref().to_path_buf();
        let metadata = FileMetadata::from_path(&source).await?;
        let strategy = ChunkingStrategy::for_file_size(metadata.file_size);

        tracing::debug!(
            source = %source.display(),
            file_size = metadata.file_size,
            chunk_size = strategy.chunk_size,
            "Prepared upload"
        );

        Ok(Self {
            source,
            metadata,
            strategy,
            client_id: client_id.into(),
            token: token.into(),
            transfer_id: Uuid::new_v4(),
            resume_token: None,
            resume: ResumeSlot::default(),
        })
    }

    /// Use a fixed chunk size instead of the size-based default.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.strategy = ChunkingStrategy::with_chunk_size(chunk_size);
        self
    }

    /// Re-attach to an existing server session on the first attempt.
    #[must_use]
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.resume.set(token.clone());
        self.resume_token = Some(token);
        self
    }

    /// Whether the file goes over the direct (unchunked) path.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.strategy.is_direct(self.metadata.file_size)
    }

    /// Number of chunks on the chunked path.
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.strategy.chunk_count(self.metadata.file_size)
    }

    /// The handshake request for this job.
    #[must_use]
    pub fn request(&self) -> TransferRequest {
        TransferRequest {
            transfer_id: self.transfer_id,
            authentication_token: self.token.clone(),
            client_id: self.client_id.clone(),
            metadata: self.metadata.clone(),
            chunking_strategy: self.strategy,
            resume_transfer: self.resume_token.is_some(),
            resume_token: self.resume_token.clone(),
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Transfer identifier of the successful attempt
    pub transfer_id: Uuid,
    /// File bytes sent by the successful attempt
    pub bytes_sent: u64,
    /// Chunks sent by the successful attempt
    pub chunks_sent: u64,
    /// Chunks the server already had
    pub chunks_skipped: u64,
    /// Whether the direct path was used
    pub direct: bool,
    /// Session token the server issued, if any
    pub resume_token: Option<String>,
    /// Wall time of the successful attempt
    pub elapsed: Duration,
}

/// Something that can upload a file.
pub trait TransferClient: Send + Sync {
    /// Upload one file.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the upload.
    fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<TransferOutcome>> + Send;
}

/// Client tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-message socket timeout
    pub io_timeout: Duration,
    /// Bytes between progress reports
    pub progress_interval: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
            progress_interval: crate::PROGRESS_INTERVAL,
        }
    }
}

/// Base client: one attempt over one TCP connection.
#[derive(Debug)]
pub struct TcpTransferClient {
    target: String,
    options: ClientOptions,
    progress_tx: watch::Sender<UploadProgress>,
}

impl TcpTransferClient {
    /// Create a client for `target` (`host:port`).
    pub fn new(target: impl Into<String>, options: ClientOptions) -> Self {
        let (progress_tx, _) = watch::channel(UploadProgress::new("", 0, 0));
        Self {
            target: target.into(),
            options,
            progress_tx,
        }
    }

    /// Receiver endpoint.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Subscribe to progress updates.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress_tx.subscribe()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<TcpStream> {
        let limit = self.options.connect_timeout;
        let stream = protocol::cancellable(cancel, async {
            tokio::time::timeout(limit, TcpStream::connect(&self.target))
                .await
                .map_err(|_| {
                    Error::timeout(
                        format!("connect to {}", self.target),
                        TimeoutLayer::Connect,
                        limit,
                    )
                })?
                .map_err(Error::from)
        })
        .await?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        if let Err(e) = crate::server::configure_tcp_keepalive(&stream) {
            tracing::debug!(error = %e, "Failed to enable TCP keep-alive");
        }
        Ok(stream)
    }

    async fn run_attempt(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
        attempt: &mut Attempt<'_>,
    ) -> Result<TransferOutcome> {
        attempt.enter(ClientState::Connecting);
        let mut stream = self.connect(cancel).await?;
        let io_timeout = self.options.io_timeout;

        attempt.enter(ClientState::AwaitingAck);
        let request = job.request();
        protocol::cancellable(
            cancel,
            protocol::send_json_with_timeout(&mut stream, &request, io_timeout),
        )
        .await?;
        let ack: TransferResponse = protocol::cancellable(
            cancel,
            protocol::recv_json_with_timeout(&mut stream, MessageLimit::Control, io_timeout),
        )
        .await?;
        let ack = ack.into_result()?;

        if let Some(token) = &ack.resume_token {
            job.resume.set(token.clone());
        }

        attempt.enter(ClientState::Sending);
        let (bytes_sent, chunks_sent, chunks_skipped) = if job.is_direct() {
            let sent = self.send_direct(&mut stream, job, cancel, attempt).await?;
            (sent, 0, 0)
        } else {
            let completed = if request.resume_transfer {
                ack.completed_chunks()?
            } else {
                Vec::new()
            };
            self.send_chunks(&mut stream, job, &completed, cancel, attempt)
                .await?
        };

        attempt.enter(ClientState::AwaitingFinal);
        let confirmation: TransferResponse = protocol::cancellable(
            cancel,
            protocol::recv_json_with_timeout(&mut stream, MessageLimit::Control, io_timeout),
        )
        .await?;
        confirmation.into_result()?;

        let _ = stream.shutdown().await;

        Ok(TransferOutcome {
            transfer_id: job.transfer_id,
            bytes_sent,
            chunks_sent,
            chunks_skipped,
            direct: job.is_direct(),
            resume_token: ack.resume_token,
            elapsed: attempt.started.elapsed(),
        })
    }

    async fn send_direct(
        &self,
        stream: &mut TcpStream,
        job: &UploadJob,
        cancel: &CancellationToken,
        attempt: &mut Attempt<'_>,
    ) -> Result<u64> {
        let io_timeout = self.options.io_timeout;
        let file_size = job.metadata.file_size;
        let mut file = tokio::fs::File::open(&job.source)
            .await
            .map_err(|_| Error::FileNotFound(job.source.display().to_string()))?;

        let mut buffer = vec![0u8; SEND_BUFFER_SIZE];
        let mut sent = 0u64;

        while sent < file_size {
            #[allow(clippy::cast_possible_truncation)]
            let want = (file_size - sent).min(SEND_BUFFER_SIZE as u64) as usize;
            let n = file.read(&mut buffer[..want]).await?;
            if n == 0 {
                return Err(Error::Internal(format!(
                    "{} shrank during upload: {sent} of {file_size} bytes read",
                    job.source.display()
                )));
            }

            protocol::cancellable(cancel, async {
                tokio::time::timeout(io_timeout, stream.write_all(&buffer[..n]))
                    .await
                    .map_err(|_| {
                        Error::timeout("send file data", TimeoutLayer::Socket, io_timeout)
                    })?
                    .map_err(Error::from)
            })
            .await?;

            sent += n as u64;
            attempt.advance(n as u64, 0);
        }

        stream.flush().await?;
        Ok(sent)
    }

    async fn send_chunks(
        &self,
        stream: &mut TcpStream,
        job: &UploadJob,
        completed: &[u64],
        cancel: &CancellationToken,
        attempt: &mut Attempt<'_>,
    ) -> Result<(u64, u64, u64)> {
        let io_timeout = self.options.io_timeout;
        let chunk_count = job.chunk_count();
        let completed: BTreeSet<u64> = completed.iter().copied().collect();

        if let Some(&bad) = completed.iter().find(|&&index| index >= chunk_count) {
            return Err(ProtocolViolation::Malformed(format!(
                "server reports chunk {bad} completed but the file has {chunk_count} chunks"
            ))
            .into());
        }

        let mut reader =
            ChunkReader::open(&job.source, job.strategy, job.metadata.file_size).await?;
        let mut bytes_sent = 0u64;
        let mut chunks_sent = 0u64;
        let mut chunks_skipped = 0u64;

        for index in 0..chunk_count {
            let (_, len) = job.strategy.chunk_range(index, job.metadata.file_size);

            if completed.contains(&index) {
                reader.skip_chunk(index).await?;
                chunks_skipped += 1;
                attempt.advance(len, 1);
                continue;
            }

            let data = reader.read_chunk(index).await?;
            let chunk = ChunkData::new(job.transfer_id, index, data, index + 1 == chunk_count);

            protocol::cancellable(
                cancel,
                protocol::send_json_with_timeout(stream, &chunk, io_timeout),
            )
            .await?;
            let result: ChunkResult = protocol::cancellable(
                cancel,
                protocol::recv_json_with_timeout(stream, MessageLimit::Control, io_timeout),
            )
            .await?;
            result.into_result(index)?;

            bytes_sent += len;
            chunks_sent += 1;
            attempt.advance(len, 1);
        }

        if chunks_skipped > 0 {
            tracing::info!(
                transfer_id = %job.transfer_id,
                chunks_skipped,
                chunks_sent,
                "Resumed upload skipped chunks the server already had"
            );
        }

        Ok((bytes_sent, chunks_sent, chunks_skipped))
    }
}

impl TransferClient for TcpTransferClient {
    async fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let chunk_count = if job.is_direct() { 0 } else { job.chunk_count() };
        let mut attempt = Attempt::new(self, job, chunk_count);

        match self.run_attempt(job, cancel, &mut attempt).await {
            Ok(outcome) => {
                attempt.enter(ClientState::Done);
                tracing::info!(
                    transfer_id = %job.transfer_id,
                    file_name = %job.metadata.file_name,
                    bytes_sent = outcome.bytes_sent,
                    chunks_sent = outcome.chunks_sent,
                    chunks_skipped = outcome.chunks_skipped,
                    elapsed = ?outcome.elapsed,
                    "Upload completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let failed_in = attempt.state;
                attempt.enter(ClientState::Failed);
                tracing::warn!(
                    transfer_id = %job.transfer_id,
                    client_id = %job.client_id,
                    state = %failed_in,
                    kind = %e.kind(),
                    error = %e,
                    "Upload attempt failed"
                );
                Err(e)
            }
        }
    }
}

/// State and progress of one attempt.
struct Attempt<'a> {
    progress_tx: &'a watch::Sender<UploadProgress>,
    transfer_id: Uuid,
    state: ClientState,
    started: Instant,
    interval: u64,
    last_reported: u64,
}

impl<'a> Attempt<'a> {
    fn new(client: &'a TcpTransferClient, job: &UploadJob, chunk_count: u64) -> Self {
        let progress = UploadProgress::new(
            &job.metadata.file_name,
            job.metadata.file_size,
            chunk_count,
        );
        let started = progress.started_at;
        client.progress_tx.send_replace(progress);

        Self {
            progress_tx: &client.progress_tx,
            transfer_id: job.transfer_id,
            state: ClientState::Idle,
            started,
            interval: client.options.progress_interval.max(1),
            last_reported: 0,
        }
    }

    fn enter(&mut self, next: ClientState) {
        tracing::debug!(
            transfer_id = %self.transfer_id,
            from = %self.state,
            to = %next,
            "Client state transition"
        );
        self.state = next;
        self.progress_tx.send_modify(|p| p.state = next);
    }

    fn advance(&mut self, bytes: u64, chunks: u64) {
        let mut snapshot = None;
        self.progress_tx.send_modify(|p| {
            p.bytes_done += bytes;
            p.chunks_done += chunks;
            snapshot = Some((p.bytes_done, p.total_bytes, p.percentage()));
        });

        let Some((done, total, percent)) = snapshot else {
            return;
        };
        if done - self.last_reported >= self.interval || (done == total && done != self.last_reported)
        {
            self.last_reported = done;
            tracing::info!(
                transfer_id = %self.transfer_id,
                bytes_done = done,
                total_bytes = total,
                percent = format!("{percent:.1}"),
                "Upload progress"
            );
        }
    }
}

/// Attaches client credentials to every upload.
#[derive(Clone)]
pub struct WithCredentials<C> {
    inner: C,
    client_id: String,
    secret: String,
}

impl<C> fmt::Debug for WithCredentials<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl<C: TransferClient> WithCredentials<C> {
    /// Wrap `inner`, presenting `client_id` / `secret` as a bearer token.
    pub fn new(inner: C, client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            inner,
            client_id: client_id.into(),
            secret: secret.into(),
        }
    }

    /// Wrapped client.
    pub const fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: TransferClient> TransferClient for WithCredentials<C> {
    async fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let mut job = job.clone();
        job.client_id.clone_from(&self.client_id);
        job.token = encode_bearer_token(&self.client_id, &self.secret);
        self.inner.upload(&job, cancel).await
    }
}

/// Retries uploads through a [`RetryCoordinator`].
///
/// Attempts after the first use a fresh transfer id and, when the server
/// issued one, the job's resume token.
#[derive(Debug, Clone)]
pub struct WithRetry<C> {
    inner: C,
    coordinator: RetryCoordinator,
}

impl<C: TransferClient> WithRetry<C> {
    /// Wrap `inner`.
    pub const fn new(inner: C, coordinator: RetryCoordinator) -> Self {
        Self { inner, coordinator }
    }

    /// Wrapped client.
    pub const fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: TransferClient> TransferClient for WithRetry<C> {
    async fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let operation = format!("upload {}", job.metadata.file_name);
        let inner = &self.inner;

        self.coordinator
            .run(&operation, cancel, |attempt| {
                let mut attempt_job = job.clone();
                if attempt > 1 {
                    attempt_job.transfer_id = Uuid::new_v4();
                    if let Some(token) = job.resume.get() {
                        attempt_job.resume_token = Some(token);
                    }
                    tracing::debug!(
                        attempt,
                        transfer_id = %attempt_job.transfer_id,
                        resuming = attempt_job.resume_token.is_some(),
                        "Starting retry attempt"
                    );
                }
                async move { inner.upload(&attempt_job, cancel).await }
            })
            .await
    }
}

/// Bounds a whole upload, retries included when wrapping [`WithRetry`].
#[derive(Debug, Clone)]
pub struct WithTimeout<C> {
    inner: C,
    limit: Duration,
}

impl<C: TransferClient> WithTimeout<C> {
    /// Wrap `inner` with a hard limit.
    pub const fn new(inner: C, limit: Duration) -> Self {
        Self { inner, limit }
    }

    /// Wrapped client.
    pub const fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: TransferClient> TransferClient for WithTimeout<C> {
    async fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        tokio::time::timeout(self.limit, self.inner.upload(job, cancel))
            .await
            .map_err(|_| {
                tracing::warn!(
                    file_name = %job.metadata.file_name,
                    limit = ?self.limit,
                    "Upload timed out"
                );
                Error::timeout(
                    format!("upload {}", job.metadata.file_name),
                    TimeoutLayer::Operation,
                    self.limit,
                )
            })?
    }
}
