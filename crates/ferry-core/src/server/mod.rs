//! Transfer receiver.
//!
//! [`Server`] accepts connections and runs one [`TransferReceiver`] state
//! machine per connection on its own task:
//!
//! ```text
//! AwaitingRequest → Authenticating → Authorizing → PreparingSession
//!     → AwaitingData → Validating → Done
//!                                  ↘ Rejected (from any state)
//! ```
//!
//! Nothing touches storage before the client is authenticated and
//! authorized. Chunked transfers are recorded through the shared
//! [`SessionManager`]; direct transfers stream into a partial file that is
//! verified against both digests before it is moved into place.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::auth::{AuthorizationContext, Authenticator, Permission};
use crate::checksum;
use crate::config::ServerConfig;
use crate::error::{Error, ErrorKind, ProtocolViolation, Result};
use crate::protocol::{
    self, ChunkData, ChunkResult, MessageLimit, TransferRequest, TransferResponse,
};
use crate::session::{partial_path_for, SessionHandle, SessionManager};
use crate::storage::{self, StorageProvider};

/// Receiver state machine, one per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Waiting for the `TransferRequest`
    AwaitingRequest,
    /// Checking the bearer token
    Authenticating,
    /// Checking the upload permission
    Authorizing,
    /// Resolving the destination and creating or restoring the session
    PreparingSession,
    /// Receiving file bytes or chunk envelopes
    AwaitingData,
    /// Verifying the file and moving it into place
    Validating,
    /// File in place, confirmation sent
    Done,
    /// Transfer refused or aborted
    Rejected,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingRequest => "awaiting_request",
            Self::Authenticating => "authenticating",
            Self::Authorizing => "authorizing",
            Self::PreparingSession => "preparing_session",
            Self::AwaitingData => "awaiting_data",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Receiver tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Socket timeout for every protocol read and write
    pub read_timeout: Duration,
    /// Fail resume requests whose session cannot be restored
    pub strict_resume: bool,
    /// Most chunks one transfer may declare
    pub max_chunk_count: u64,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ReceiverOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            strict_resume: config.strict_resume,
            max_chunk_count: config.max_chunk_count,
        }
    }
}

/// Shared services every connection handler uses.
#[derive(Clone)]
pub struct ReceiverServices {
    /// Chunk session table
    pub sessions: Arc<SessionManager>,
    /// Authentication gate
    pub authenticator: Authenticator,
    /// Destination and free-space services
    pub storage: Arc<dyn StorageProvider>,
    /// Audit trail
    pub audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for ReceiverServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverServices")
            .field("sessions", &self.sessions)
            .field("authenticator", &self.authenticator)
            .finish_non_exhaustive()
    }
}

/// Result of one successful receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// Transfer identifier from the request
    pub transfer_id: Uuid,
    /// Authenticated client
    pub client_id: String,
    /// Final location of the file
    pub path: PathBuf,
    /// File bytes received on this connection
    pub bytes_received: u64,
    /// Chunk envelopes received on this connection (0 on the direct path)
    pub chunks_received: u64,
    /// Whether a previous session was restored
    pub resumed: bool,
}

/// Per-connection bookkeeping for logs and audit events.
#[derive(Debug)]
struct ConnectionContext {
    peer: String,
    state: ReceiverState,
    transfer_id: Uuid,
    client_id: Option<String>,
    chunk_rejection_sent: bool,
}

impl ConnectionContext {
    fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            state: ReceiverState::AwaitingRequest,
            transfer_id: Uuid::nil(),
            client_id: None,
            chunk_rejection_sent: false,
        }
    }

    fn enter(&mut self, next: ReceiverState) {
        tracing::debug!(
            peer = %self.peer,
            transfer_id = %self.transfer_id,
            client_id = self.client_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "Receiver state transition"
        );
        self.state = next;
    }

    const fn data_started(&self) -> bool {
        matches!(
            self.state,
            ReceiverState::AwaitingData | ReceiverState::Validating | ReceiverState::Done
        )
    }
}

/// What `prepare` resolved for the data phase.
enum Prepared {
    Direct { destination: PathBuf },
    Chunked { handle: SessionHandle },
}

/// Connection handler implementing the receiver state machine.
#[derive(Debug)]
pub struct TransferReceiver {
    options: ReceiverOptions,
    services: ReceiverServices,
}

impl TransferReceiver {
    /// Create a handler.
    #[must_use]
    pub const fn new(options: ReceiverOptions, services: ReceiverServices) -> Self {
        Self { options, services }
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &ReceiverServices {
        &self.services
    }

    /// Run one connection to completion.
    ///
    /// Failures are reported to the peer (where the stream still allows it),
    /// logged and audited before being returned.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the transfer.
    pub async fn handle_connection<S>(
        &self,
        stream: &mut S,
        peer: &str,
        cancel: &CancellationToken,
    ) -> Result<ReceiveOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ctx = ConnectionContext::new(peer);

        let request: TransferRequest = match protocol::cancellable(
            cancel,
            protocol::recv_json_with_timeout(stream, MessageLimit::Control, self.options.read_timeout),
        )
        .await
        {
            Ok(request) => request,
            Err(e) => {
                ctx.enter(ReceiverState::Rejected);
                if matches!(e, Error::Protocol(ProtocolViolation::ConnectionClosed)) {
                    tracing::debug!(peer, "Connection closed before a request arrived");
                } else {
                    tracing::warn!(peer, error = %e, "Failed to read transfer request");
                    self.respond_failure(stream, &e).await;
                }
                return Err(e);
            }
        };

        ctx.transfer_id = request.transfer_id;
        tracing::info!(
            peer,
            transfer_id = %request.transfer_id,
            client_id = %request.client_id,
            file_name = %request.metadata.file_name,
            file_size = request.metadata.file_size,
            resume = request.resume_transfer,
            "Transfer request received"
        );

        match self.run_transfer(stream, &mut ctx, &request, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(stream, &mut ctx, &e).await;
                Err(e)
            }
        }
    }

    async fn run_transfer<S>(
        &self,
        stream: &mut S,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceiveOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let context = self.admit(ctx, request)?;
        let prepared = self.prepare(ctx, request, &context).await?;

        let resumed = matches!(&prepared, Prepared::Chunked { handle } if handle.restored);
        let ack = match &prepared {
            Prepared::Direct { .. } => TransferResponse::accepted(),
            Prepared::Chunked { handle } => {
                TransferResponse::accepted_chunked(&handle.completed_chunks, &handle.resume_token)?
            }
        };

        if let Err(e) = self.send(stream, &ack, cancel).await {
            if let Prepared::Chunked { handle } = &prepared {
                self.services.sessions.release(handle.session_id).await;
            }
            return Err(e);
        }

        self.services.audit.record(AuditEvent::new(
            request.transfer_id,
            Some(&context.client_id),
            AuditAction::TransferStarted {
                file_name: request.metadata.file_name.clone(),
                file_size: request.metadata.file_size,
                chunk_count: match &prepared {
                    Prepared::Direct { .. } => 0,
                    Prepared::Chunked { .. } => request.chunk_count(),
                },
                resumed,
            },
        ));

        ctx.enter(ReceiverState::AwaitingData);

        let (path, bytes_received, chunks_received) = match prepared {
            Prepared::Direct { destination } => {
                let bytes = self
                    .receive_direct(stream, ctx, request, &destination, cancel)
                    .await?;
                (destination, bytes, 0)
            }
            Prepared::Chunked { handle } => {
                let (bytes, chunks) = self
                    .receive_chunked(stream, ctx, request, &handle, cancel)
                    .await?;
                ctx.enter(ReceiverState::Validating);
                let path = match self.services.sessions.finalize(handle.session_id).await {
                    Ok(path) => path,
                    Err(e) => {
                        self.services.sessions.release(handle.session_id).await;
                        return Err(e);
                    }
                };
                (path, bytes, chunks)
            }
        };

        self.send(stream, &TransferResponse::accepted(), cancel)
            .await?;
        ctx.enter(ReceiverState::Done);

        tracing::info!(
            transfer_id = %request.transfer_id,
            client_id = %context.client_id,
            path = %path.display(),
            bytes_received,
            chunks_received,
            resumed,
            "Transfer completed"
        );
        self.services.audit.record(AuditEvent::new(
            request.transfer_id,
            Some(&context.client_id),
            AuditAction::TransferCompleted {
                path: path.clone(),
                bytes_received,
            },
        ));

        Ok(ReceiveOutcome {
            transfer_id: request.transfer_id,
            client_id: context.client_id,
            path,
            bytes_received,
            chunks_received,
            resumed,
        })
    }

    /// Authenticate and authorize.
    fn admit(
        &self,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
    ) -> Result<AuthorizationContext> {
        ctx.enter(ReceiverState::Authenticating);
        let context = self
            .services
            .authenticator
            .authenticate(&request.authentication_token)?;

        if context.client_id != request.client_id {
            return Err(Error::AuthenticationFailed(format!(
                "token belongs to '{}', request claims '{}'",
                context.client_id, request.client_id
            )));
        }
        ctx.client_id = Some(context.client_id.clone());

        ctx.enter(ReceiverState::Authorizing);
        Authenticator::authorize(&context, Permission::UploadBackup)?;

        Ok(context)
    }

    /// Resolve the destination, check space and create or restore the session.
    async fn prepare(
        &self,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        context: &AuthorizationContext,
    ) -> Result<Prepared> {
        ctx.enter(ReceiverState::PreparingSession);

        request.chunking_strategy.validate()?;
        if !request.is_direct() {
            let count = request.chunk_count();
            if count > self.options.max_chunk_count {
                return Err(ProtocolViolation::TooManyChunks {
                    count,
                    limit: self.options.max_chunk_count,
                }
                .into());
            }
        }

        let storage = Arc::clone(&self.services.storage);
        let client_id = context.client_id.clone();
        let metadata = request.metadata.clone();
        let (destination, available) = tokio::task::spawn_blocking(move || {
            let destination = storage.destination_for(&client_id, &metadata)?;
            let available = storage.available_space(&destination)?;
            Ok::<_, Error>((destination, available))
        })
        .await
        .map_err(|e| Error::Internal(format!("storage task failed: {e}")))??;
        storage::ensure_space(request.metadata.file_size, available)?;

        if request.is_direct() {
            return Ok(Prepared::Direct { destination });
        }

        let sessions = &self.services.sessions;
        let handle = match request.resume_token.as_deref() {
            Some(token) if request.resume_transfer => {
                match sessions.restore(token, request).await {
                    Ok(handle) => handle,
                    Err(e) if self.options.strict_resume => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            transfer_id = %request.transfer_id,
                            client_id = %context.client_id,
                            error = %e,
                            "Could not restore session, starting a new one"
                        );
                        sessions.initialize(request, destination).await?
                    }
                }
            }
            _ => sessions.initialize(request, destination).await?,
        };

        Ok(Prepared::Chunked { handle })
    }

    async fn receive_direct<S>(
        &self,
        stream: &mut S,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let partial = partial_path_for(destination, &request.transfer_id);

        match self
            .receive_direct_into(stream, ctx, request, &partial, cancel)
            .await
        {
            Ok(bytes) => {
                tokio::fs::rename(&partial, destination).await?;
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            path = %partial.display(),
                            error = %remove_err,
                            "Failed to remove partial file"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn receive_direct_into<S>(
        &self,
        stream: &mut S,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut file = tokio::fs::File::create(partial).await?;
        let received = protocol::cancellable(
            cancel,
            protocol::copy_exact_with_timeout(
                stream,
                &mut file,
                request.metadata.file_size,
                self.options.read_timeout,
            ),
        )
        .await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        ctx.enter(ReceiverState::Validating);
        let digests = checksum::file_digests(partial).await?;
        let metadata = &request.metadata;

        if !metadata.checksum_md5.is_empty()
            && !checksum::digests_match(&digests.md5, &metadata.checksum_md5)
        {
            return Err(Error::ChecksumMismatch {
                target: metadata.file_name.clone(),
                expected: metadata.checksum_md5.clone(),
                actual: digests.md5,
            });
        }
        if !metadata.checksum_sha256.is_empty()
            && !checksum::digests_match(&digests.sha256, &metadata.checksum_sha256)
        {
            return Err(Error::ChecksumMismatch {
                target: metadata.file_name.clone(),
                expected: metadata.checksum_sha256.clone(),
                actual: digests.sha256,
            });
        }

        Ok(received)
    }

    async fn receive_chunked<S>(
        &self,
        stream: &mut S,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        handle: &SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sessions = &self.services.sessions;
        let session_id = handle.session_id;

        let result = self
            .receive_chunks(stream, ctx, request, session_id, cancel)
            .await;

        if let Err(e) = &result {
            let cleanup = if matches!(e, Error::ChecksumMismatch { .. }) {
                sessions.cleanup(session_id).await
            } else {
                sessions.release(session_id).await;
                Ok(())
            };
            if let Err(cleanup_err) = cleanup {
                tracing::warn!(
                    session_id = %session_id,
                    error = %cleanup_err,
                    "Failed to clean up session"
                );
            }
        }

        result
    }

    async fn receive_chunks<S>(
        &self,
        stream: &mut S,
        ctx: &mut ConnectionContext,
        request: &TransferRequest,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sessions = &self.services.sessions;
        let chunk_count = request.chunk_count();
        let mut expected = sessions.next_expected_chunk(session_id).await?;
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        while expected < chunk_count {
            let chunk: ChunkData = protocol::cancellable(
                cancel,
                protocol::recv_json_with_timeout(stream, MessageLimit::Chunk, self.options.read_timeout),
            )
            .await?;

            let result = match sessions.record_chunk(session_id, &chunk).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(
                        transfer_id = %request.transfer_id,
                        client_id = ctx.client_id.as_deref().unwrap_or("-"),
                        chunk_index = chunk.chunk_index,
                        expected,
                        error = %e,
                        "Chunk rejected"
                    );
                    let failed = ChunkResult::failed(chunk.chunk_index, &e);
                    match self.send(stream, &failed, cancel).await {
                        Ok(()) => ctx.chunk_rejection_sent = true,
                        Err(send_err) => {
                            tracing::debug!(error = %send_err, "Failed to send chunk rejection");
                        }
                    }
                    return Err(e);
                }
            };

            self.send(stream, &result, cancel).await?;

            bytes += chunk.data.len() as u64;
            chunks += 1;
            self.services.audit.record(AuditEvent::new(
                request.transfer_id,
                ctx.client_id.as_deref(),
                AuditAction::ChunkCompleted {
                    chunk_index: chunk.chunk_index,
                },
            ));

            expected = sessions.next_expected_chunk(session_id).await?;
        }

        Ok((bytes, chunks))
    }

    async fn send<S, T>(&self, stream: &mut S, message: &T, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        protocol::cancellable(
            cancel,
            protocol::send_json_with_timeout(stream, message, self.options.read_timeout),
        )
        .await
    }

    /// Report, log and audit a failure.
    async fn fail<S>(&self, stream: &mut S, ctx: &mut ConnectionContext, error: &Error)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let rejected = !ctx.data_started();
        let failed_in = ctx.state;
        ctx.enter(ReceiverState::Rejected);

        let client_id = ctx.client_id.as_deref().unwrap_or("-");
        if error.kind() == ErrorKind::Unexpected {
            tracing::error!(
                transfer_id = %ctx.transfer_id,
                client_id,
                state = %failed_in,
                error = ?error,
                "Transfer failed unexpectedly"
            );
        } else {
            tracing::warn!(
                transfer_id = %ctx.transfer_id,
                client_id,
                state = %failed_in,
                kind = %error.kind(),
                error = %error,
                "Transfer failed"
            );
        }

        self.services.audit.record(AuditEvent::failure(
            ctx.transfer_id,
            ctx.client_id.as_deref(),
            error,
            rejected,
        ));

        // A peer that sent a bad chunk already got its ChunkResult.
        if !ctx.chunk_rejection_sent {
            self.respond_failure(stream, error).await;
        }
    }

    async fn respond_failure<S>(&self, stream: &mut S, error: &Error)
    where
        S: AsyncWrite + Unpin,
    {
        if !peer_can_hear(error) {
            return;
        }
        if let Err(e) = protocol::send_json_with_timeout(
            stream,
            &TransferResponse::rejected(error),
            self.options.read_timeout,
        )
        .await
        {
            tracing::debug!(error = %e, "Failed to send rejection");
        }
    }
}

/// Whether the stream is still usable for a rejection message.
const fn peer_can_hear(error: &Error) -> bool {
    !matches!(
        error,
        Error::Cancelled
            | Error::Timeout { .. }
            | Error::Protocol(
                ProtocolViolation::ConnectionClosed | ProtocolViolation::Truncated { .. }
            )
    )
}

/// TCP front end for a [`TransferReceiver`].
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    receiver: Arc<TransferReceiver>,
}

impl Server {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        options: ReceiverOptions,
        services: ReceiverServices,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Transfer receiver listening");
        Ok(Self {
            listener,
            receiver: Arc::new(TransferReceiver::new(options, services)),
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connection handler used by this server.
    #[must_use]
    pub fn receiver(&self) -> &Arc<TransferReceiver> {
        &self.receiver
    }

    /// Accept connections until `cancel` fires, then wait for in-flight
    /// transfers to wind down.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(peer = %peer_addr, "Connection accepted");
                    let receiver = Arc::clone(&self.receiver);
                    let conn_cancel = cancel.child_token();
                    connections.spawn(async move {
                        serve_stream(&receiver, stream, peer_addr, &conn_cancel).await;
                    });
                }
            }
        }

        tracing::info!(
            in_flight = connections.len(),
            "Receiver shutting down"
        );
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Connection task panicked");
            }
        }

        Ok(())
    }
}

async fn serve_stream(
    receiver: &TransferReceiver,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: &CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = configure_tcp_keepalive(&stream) {
        tracing::debug!(peer = %peer_addr, error = %e, "Failed to enable TCP keep-alive");
    }

    let peer = peer_addr.to_string();
    // Failures are already logged and audited by the handler.
    let _ = receiver.handle_connection(&mut stream, &peer, cancel).await;
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(peer = %peer_addr, error = %e, "Failed to shut down connection");
    }
}

/// Enable TCP keep-alive so half-open connections are noticed.
pub(crate) fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    use socket2::{SockRef, TcpKeepalive};

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::auth::{encode_bearer_token, ClientCredential, MemoryCredentialStore};
    use crate::file::{ChunkingStrategy, FileMetadata};
    use crate::storage::LocalStorage;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn receiver(dir: &TempDir) -> TransferReceiver {
        let store = MemoryCredentialStore::new()
            .with_credential(ClientCredential::new(
                "db-01",
                "s3cret",
                vec![Permission::UploadBackup],
            ))
            .with_credential(ClientCredential::new(
                "reader",
                "s3cret",
                vec![Permission::ReadStatus],
            ));
        let sessions = SessionManager::open(dir.path().join("state"))
            .await
            .expect("open sessions");

        TransferReceiver::new(
            ReceiverOptions {
                read_timeout: Duration::from_secs(5),
                strict_resume: false,
                max_chunk_count: 8,
            },
            ReceiverServices {
                sessions: Arc::new(sessions),
                authenticator: Authenticator::credentials_only(Arc::new(store)),
                storage: Arc::new(LocalStorage::new(dir.path().join("store"))),
                audit: Arc::new(TracingAuditSink),
            },
        )
    }

    fn request(client_id: &str, data: &[u8]) -> TransferRequest {
        TransferRequest {
            transfer_id: Uuid::new_v4(),
            authentication_token: encode_bearer_token(client_id, "s3cret"),
            client_id: client_id.to_string(),
            metadata: FileMetadata {
                file_name: "small.bin".into(),
                file_size: data.len() as u64,
                checksum_md5: checksum::md5_bytes(data),
                checksum_sha256: checksum::sha256_bytes(data),
                created_at: Utc::now(),
            },
            chunking_strategy: ChunkingStrategy::default(),
            resume_transfer: false,
            resume_token: None,
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ReceiverState::PreparingSession.to_string(), "preparing_session");
        assert_eq!(ReceiverState::Rejected.to_string(), "rejected");
    }

    #[test]
    fn test_peer_can_hear() {
        assert!(peer_can_hear(&Error::AuthenticationFailed("x".into())));
        assert!(!peer_can_hear(&Error::Protocol(
            ProtocolViolation::ConnectionClosed
        )));
        assert!(!peer_can_hear(&Error::Cancelled));
    }

    #[tokio::test]
    async fn test_direct_transfer_over_duplex() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let data = b"a small backup".to_vec();
        let req = request("db-01", &data);

        let client_side = async {
            protocol::send_json(&mut client, &req).await.expect("send request");
            let ack: TransferResponse = protocol::recv_json(&mut client, MessageLimit::Control)
                .await
                .expect("ack");
            assert!(ack.success);
            client.write_all(&data).await.expect("write body");
            let done: TransferResponse = protocol::recv_json(&mut client, MessageLimit::Control)
                .await
                .expect("final");
            assert!(done.success);
        };

        let (outcome, ()) = tokio::join!(
            receiver.handle_connection(&mut server, "test", &cancel),
            client_side
        );
        let outcome = outcome.expect("receive");
        assert_eq!(outcome.bytes_received, data.len() as u64);
        assert_eq!(std::fs::read(&outcome.path).expect("read"), data);
    }

    #[tokio::test]
    async fn test_missing_permission_is_rejected() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let req = request("reader", b"x");

        let client_side = async {
            protocol::send_json(&mut client, &req).await.expect("send request");
            let ack: TransferResponse = protocol::recv_json(&mut client, MessageLimit::Control)
                .await
                .expect("ack");
            assert!(!ack.success);
            assert_eq!(ack.error_kind, Some(ErrorKind::AuthorizationFailed));
        };

        let (result, ()) = tokio::join!(
            receiver.handle_connection(&mut server, "test", &cancel),
            client_side
        );
        assert!(matches!(result, Err(Error::AuthorizationFailed { .. })));
        assert!(!dir.path().join("store").join("reader").exists());
    }

    #[tokio::test]
    async fn test_client_id_must_match_token() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let mut req = request("db-01", b"x");
        req.client_id = "someone-else".into();

        protocol::send_json(&mut client, &req).await.expect("send request");
        let result = receiver.handle_connection(&mut server, "test", &cancel).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_tiny_chunk_size_is_rejected_before_storage() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let mut req = request("db-01", &[0u8; 1000]);
        req.chunking_strategy = ChunkingStrategy::with_chunk_size(1);

        let client_side = async {
            protocol::send_json(&mut client, &req).await.expect("send request");
            let ack: TransferResponse = protocol::recv_json(&mut client, MessageLimit::Control)
                .await
                .expect("ack");
            assert!(!ack.success);
            assert_eq!(ack.error_kind, Some(ErrorKind::ProtocolViolation));
        };

        let (result, ()) = tokio::join!(
            receiver.handle_connection(&mut server, "test", &cancel),
            client_side
        );
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::TooManyChunks {
                count: 1000,
                limit: 8
            }))
        ));
        assert!(receiver.services.sessions.is_empty().await);
        assert!(!dir.path().join("store").join("db-01").exists());
    }

    #[tokio::test]
    async fn test_serve_stream_survives_vanished_peer() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer_addr) = listener.accept().await.expect("accept");
        drop(client);

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            serve_stream(&receiver, stream, peer_addr, &cancel),
        )
        .await
        .expect("connection handler returns");
        assert!(receiver.services.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_request() {
        let dir = TempDir::new().expect("create temp dir");
        let receiver = receiver(&dir).await;
        let (_client, mut server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = receiver.handle_connection(&mut server, "test", &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
