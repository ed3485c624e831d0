//! Ferry wire protocol implementation.
//!
//! Ferry runs over a plain TCP stream with no transport-level framing, so
//! every message carries its own length prefix.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │    Length    │                Payload                   │
//! │   4 bytes    │   UTF-8 JSON, `Length` bytes             │
//! │ little-endian│                                          │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! - Control messages (`TransferRequest`, `TransferResponse`, `ChunkResult`)
//!   are capped at 1 MiB.
//! - Chunk envelopes (`ChunkData`) are capped at 100 MiB; the chunk bytes are
//!   base64 inside the JSON document.
//! - On the direct path the file's raw bytes follow the handshake
//!   acknowledgment with no framing at all.
//!
//! ## Exchange
//!
//! ```text
//! client                              server
//!   │ ── TransferRequest ───────────────▶ │
//!   │ ◀─────────────── TransferResponse ─ │  (ack, resume info)
//!   │ ── ChunkData[i] ──────────────────▶ │  ┐
//!   │ ◀──────────────────── ChunkResult ─ │  ┘ repeated, strictly in order
//!   │ ◀─────────────── TransferResponse ─ │  (final confirmation)
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checksum;
use crate::error::{Error, ErrorKind, ProtocolViolation, Result, TimeoutLayer};
use crate::file::{ChunkingStrategy, FileMetadata};

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum control message size (1 MiB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum chunk envelope size (100 MiB)
pub const MAX_CHUNK_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Buffer used when streaming direct-path bytes.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Size cap applied when reading a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLimit {
    /// Handshake, acknowledgment and confirmation messages
    Control,
    /// Chunk envelopes carrying file bytes
    Chunk,
}

impl MessageLimit {
    /// The cap in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Control => MAX_CONTROL_MESSAGE_SIZE,
            Self::Chunk => MAX_CHUNK_MESSAGE_SIZE,
        }
    }
}

/// Request sent once by the client to open a transfer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Identifier of this transfer attempt
    pub transfer_id: Uuid,
    /// Bearer token: base64 `clientId:clientSecret` or an opaque session token
    pub authentication_token: String,
    /// Client identifier
    pub client_id: String,
    /// File being uploaded
    pub metadata: FileMetadata,
    /// Chunking strategy for this transfer
    pub chunking_strategy: ChunkingStrategy,
    /// Whether the client wants to re-attach to a previous session
    #[serde(default)]
    pub resume_transfer: bool,
    /// Resume token from a previous acknowledgment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("transfer_id", &self.transfer_id)
            .field("authentication_token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("metadata", &self.metadata)
            .field("chunking_strategy", &self.chunking_strategy)
            .field("resume_transfer", &self.resume_transfer)
            .field("resume_token", &self.resume_token)
            .finish()
    }
}

impl TransferRequest {
    /// Whether this transfer uses the direct (unchunked) path.
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.chunking_strategy.is_direct(self.metadata.file_size)
    }

    /// Number of chunks in this transfer.
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.chunking_strategy.chunk_count(self.metadata.file_size)
    }
}

/// Handshake acknowledgment and final confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    /// Whether the step succeeded
    pub success: bool,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// JSON array of completed chunk indices on a resume acknowledgment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
    /// Token the client can use to re-attach to this transfer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Failure classification, so the client can decide whether to retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl TransferResponse {
    /// Successful acknowledgment or confirmation.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Successful acknowledgment of a chunked transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the index list cannot be serialized.
    pub fn accepted_chunked(completed_chunks: &[u64], resume_token: &str) -> Result<Self> {
        let info = serde_json::to_string(completed_chunks)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self {
            success: true,
            additional_info: Some(info),
            resume_token: Some(resume_token.to_string()),
            ..Self::default()
        })
    }

    /// Rejection carrying the error's message and classification.
    #[must_use]
    pub fn rejected(error: &Error) -> Self {
        Self {
            success: false,
            error_message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Self::default()
        }
    }

    /// Completed chunk indices carried in `additional_info`.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the field is not a JSON index array.
    pub fn completed_chunks(&self) -> Result<Vec<u64>> {
        match &self.additional_info {
            None => Ok(Vec::new()),
            Some(info) if info.trim().is_empty() => Ok(Vec::new()),
            Some(info) => serde_json::from_str(info).map_err(|e| {
                ProtocolViolation::Malformed(format!("invalid resume chunk list: {e}")).into()
            }),
        }
    }

    /// Turn a failed response into `Error::Rejected`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` when `success` is false.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Rejected {
                kind: self.error_kind.unwrap_or(ErrorKind::Unexpected),
                message: self
                    .error_message
                    .unwrap_or_else(|| "no reason given".to_string()),
            })
        }
    }
}

/// One chunk of file data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkData {
    /// Transfer this chunk belongs to
    pub transfer_id: Uuid,
    /// 0-based chunk index
    pub chunk_index: u64,
    /// Chunk bytes
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Lowercase hex MD5 of `data`
    pub chunk_checksum: String,
    /// Whether this is the final chunk of the file
    pub is_last_chunk: bool,
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkData")
            .field("transfer_id", &self.transfer_id)
            .field("chunk_index", &self.chunk_index)
            .field("len", &self.data.len())
            .field("chunk_checksum", &self.chunk_checksum)
            .field("is_last_chunk", &self.is_last_chunk)
            .finish()
    }
}

impl ChunkData {
    /// Build a chunk envelope, computing its MD5.
    #[must_use]
    pub fn new(transfer_id: Uuid, chunk_index: u64, data: Vec<u8>, is_last_chunk: bool) -> Self {
        let chunk_checksum = checksum::md5_bytes(&data);
        Self {
            transfer_id,
            chunk_index,
            data,
            chunk_checksum,
            is_last_chunk,
        }
    }
}

/// Per-chunk acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    /// Whether the chunk was durably written and verified
    pub success: bool,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Index being acknowledged
    pub chunk_index: u64,
    /// Failure classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ChunkResult {
    /// Successful acknowledgment.
    #[must_use]
    pub const fn ok(chunk_index: u64) -> Self {
        Self {
            success: true,
            error_message: None,
            chunk_index,
            error_kind: None,
        }
    }

    /// Failed acknowledgment carrying the error's message and classification.
    #[must_use]
    pub fn failed(chunk_index: u64, error: &Error) -> Self {
        Self {
            success: false,
            error_message: Some(error.to_string()),
            chunk_index,
            error_kind: Some(error.kind()),
        }
    }

    /// Turn a failed acknowledgment into `Error::Rejected`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Rejected` when `success` is false, or a protocol
    /// violation when the acknowledgment is for a different chunk.
    pub fn into_result(self, expected_index: u64) -> Result<()> {
        if !self.success {
            return Err(Error::Rejected {
                kind: self.error_kind.unwrap_or(ErrorKind::Unexpected),
                message: self
                    .error_message
                    .unwrap_or_else(|| format!("chunk {} rejected", self.chunk_index)),
            });
        }
        if self.chunk_index != expected_index {
            return Err(ProtocolViolation::OutOfOrder {
                expected: expected_index,
                actual: self.chunk_index,
            }
            .into());
        }
        Ok(())
    }
}

/// Serde adapter carrying `Vec<u8>` as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns a protocol violation if the bytes are not the expected document.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| ProtocolViolation::Malformed(e.to_string()).into())
}

/// Await one socket operation, bounded by `idle` when set.
async fn within<T>(
    idle: Option<Duration>,
    operation: &'static str,
    io: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match idle {
        Some(limit) => Ok(timeout(limit, io)
            .await
            .map_err(|_| Error::timeout(operation, TimeoutLayer::Socket, limit))??),
        None => Ok(io.await?),
    }
}

/// Fill `buf` from the reader, stopping early only at EOF.
///
/// Returns the number of bytes read. `idle` bounds each read, not the whole
/// buffer, so a slow peer that keeps sending is never cut off.
async fn read_until_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = within(idle, "receive message", reader.read(&mut buf[filled..])).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_exact_inner<R>(reader: &mut R, buf: &mut [u8], idle: Option<Duration>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let received = read_until_full(reader, buf, idle).await?;
    if received < buf.len() {
        return Err(ProtocolViolation::Truncated {
            expected: buf.len(),
            received,
        }
        .into());
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes.
///
/// # Errors
///
/// Returns `ProtocolViolation::Truncated` if the stream ends first.
pub async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    read_exact_inner(reader, buf, None).await
}

/// Stream exactly `len` raw bytes from `reader` into `writer`.
///
/// Used for the unframed direct path.
///
/// # Errors
///
/// Returns `ProtocolViolation::Truncated` if the reader ends early, or an I/O
/// error if writing fails.
pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    copy_exact_inner(reader, writer, len, None).await
}

/// Like [`copy_exact`], with a socket timeout on every read.
///
/// # Errors
///
/// Returns `Error::Timeout` with `TimeoutLayer::Socket` if a single read
/// stalls for longer than `idle`, plus the errors of [`copy_exact`].
pub async fn copy_exact_with_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Duration,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    copy_exact_inner(reader, writer, len, Some(idle)).await
}

async fn copy_exact_inner<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    idle: Option<Duration>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    while copied < len {
        #[allow(clippy::cast_possible_truncation)]
        let want = (len - copied).min(COPY_BUFFER_SIZE as u64) as usize;
        let n = within(idle, "receive file data", reader.read(&mut buffer[..want])).await?;
        if n == 0 {
            #[allow(clippy::cast_possible_truncation)]
            return Err(ProtocolViolation::Truncated {
                expected: len as usize,
                received: copied as usize,
            }
            .into());
        }
        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;
    }

    writer.flush().await?;
    Ok(copied)
}

/// Write one length-prefixed message.
///
/// # Errors
///
/// Returns an error if the payload is empty or above the chunk envelope cap,
/// or if writing fails.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message_inner(writer, payload, None).await
}

async fn write_message_inner<W>(
    writer: &mut W,
    payload: &[u8],
    idle: Option<Duration>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(ProtocolViolation::EmptyMessage.into());
    }
    if payload.len() > MAX_CHUNK_MESSAGE_SIZE {
        return Err(ProtocolViolation::Oversized {
            length: payload.len(),
            limit: MAX_CHUNK_MESSAGE_SIZE,
        }
        .into());
    }

    #[allow(clippy::cast_possible_truncation)]
    let length = (payload.len() as u32).to_le_bytes();

    within(idle, "send message", writer.write_all(&length)).await?;
    for slice in payload.chunks(COPY_BUFFER_SIZE) {
        within(idle, "send message", writer.write_all(slice)).await?;
    }
    within(idle, "send message", writer.flush()).await?;

    Ok(())
}

/// Read one length-prefixed message.
///
/// # Errors
///
/// - `ProtocolViolation::ConnectionClosed` if the stream ends before a message
/// - `ProtocolViolation::EmptyMessage` or `Oversized` for a bad length
/// - `ProtocolViolation::Truncated` if the stream ends mid-message
pub async fn read_message<R>(reader: &mut R, limit: MessageLimit) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    read_message_inner(reader, limit, None).await
}

async fn read_message_inner<R>(
    reader: &mut R,
    limit: MessageLimit,
    idle: Option<Duration>,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match read_until_full(reader, &mut prefix, idle).await? {
        0 => return Err(ProtocolViolation::ConnectionClosed.into()),
        LENGTH_PREFIX_SIZE => {}
        received => {
            return Err(ProtocolViolation::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                received,
            }
            .into())
        }
    }

    let length = u32::from_le_bytes(prefix) as usize;
    if length == 0 {
        return Err(ProtocolViolation::EmptyMessage.into());
    }
    if length > limit.bytes() {
        return Err(ProtocolViolation::Oversized {
            length,
            limit: limit.bytes(),
        }
        .into());
    }

    let mut payload = vec![0u8; length];
    read_exact_inner(reader, &mut payload, idle).await?;
    Ok(payload)
}

/// Serialize and send one message.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub async fn send_json<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode_payload(message)?;
    write_message(writer, &payload).await
}

/// Receive and deserialize one message.
///
/// # Errors
///
/// Returns an error if reading fails or the payload is malformed.
pub async fn recv_json<R, T>(reader: &mut R, limit: MessageLimit) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = read_message(reader, limit).await?;
    decode_payload(&payload)
}

/// Run a frame operation unless `cancel` fires first.
///
/// # Errors
///
/// Returns `Error::Cancelled` if the token fires before `operation` completes.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

/// Send one message with a socket timeout.
///
/// The payload goes out in 64 KiB slices and `idle` bounds each slice, so
/// large chunk envelopes survive slow links.
///
/// # Errors
///
/// Returns `Error::Timeout` with `TimeoutLayer::Socket` if a single write
/// stalls for longer than `idle`.
pub async fn send_json_with_timeout<W, T>(writer: &mut W, message: &T, idle: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode_payload(message)?;
    write_message_inner(writer, &payload, Some(idle)).await
}

/// Receive one message with a socket timeout on every read.
///
/// # Errors
///
/// Returns `Error::Timeout` with `TimeoutLayer::Socket` if a single read
/// stalls for longer than `idle`.
pub async fn recv_json_with_timeout<R, T>(
    reader: &mut R,
    limit: MessageLimit,
    idle: Duration,
) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = read_message_inner(reader, limit, Some(idle)).await?;
    decode_payload(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Reader that hands out at most one byte per poll.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for TrickleReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.pos < self.data.len() && buf.remaining() > 0 {
                let byte = self.data[self.pos];
                buf.put_slice(&[byte]);
                self.pos += 1;
            }
            Poll::Ready(Ok(()))
        }
    }

    struct NeverReadyReader;

    impl AsyncRead for NeverReadyReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    fn sample_request() -> TransferRequest {
        TransferRequest {
            transfer_id: Uuid::new_v4(),
            authentication_token: "c2VjcmV0".into(),
            client_id: "db-01".into(),
            metadata: FileMetadata {
                file_name: "dump.sql.gz".into(),
                file_size: 42,
                checksum_md5: "aa".into(),
                checksum_sha256: "bb".into(),
                created_at: Utc::now(),
            },
            chunking_strategy: ChunkingStrategy::with_chunk_size(16),
            resume_transfer: false,
            resume_token: None,
        }
    }

    #[tokio::test]
    async fn test_write_read_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"{\"a\":1}").await.expect("write");
        assert_eq!(&buffer[..4], &7u32.to_le_bytes());

        let mut cursor = std::io::Cursor::new(buffer);
        let payload = read_message(&mut cursor, MessageLimit::Control)
            .await
            .expect("read");
        assert_eq!(payload, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_read_message_handles_partial_reads() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"partial reads are fine").await.expect("write");

        let mut reader = TrickleReader { data: buffer, pos: 0 };
        let payload = read_message(&mut reader, MessageLimit::Control)
            .await
            .expect("read");
        assert_eq!(payload, b"partial reads are fine");
    }

    #[tokio::test]
    async fn test_read_message_rejects_zero_length() {
        let mut cursor = std::io::Cursor::new(0u32.to_le_bytes().to_vec());
        let result = read_message(&mut cursor, MessageLimit::Control).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::EmptyMessage))
        ));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_control() {
        #[allow(clippy::cast_possible_truncation)]
        let length = (MAX_CONTROL_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        let mut cursor = std::io::Cursor::new(length.to_vec());
        let result = read_message(&mut cursor, MessageLimit::Control).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::Oversized { .. }))
        ));
    }

    #[tokio::test]
    async fn test_read_message_truncated_body() {
        let mut data = 10u32.to_le_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(data);
        let result = read_message(&mut cursor, MessageLimit::Control).await;
        match result {
            Err(Error::Protocol(ProtocolViolation::Truncated { expected, received })) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("expected truncated error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_message_truncated_prefix() {
        let mut cursor = std::io::Cursor::new(vec![1u8, 0]);
        let result = read_message(&mut cursor, MessageLimit::Control).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::Truncated {
                expected: 4,
                received: 2
            }))
        ));
    }

    #[tokio::test]
    async fn test_read_message_clean_close() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let result = read_message(&mut cursor, MessageLimit::Control).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn test_write_message_rejects_empty() {
        let mut buffer = Vec::new();
        assert!(write_message(&mut buffer, &[]).await.is_err());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_json_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = sample_request();

        send_json(&mut client, &request).await.expect("send");
        let received: TransferRequest = recv_json(&mut server, MessageLimit::Control)
            .await
            .expect("receive");
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_recv_json_malformed_payload() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"not json").await.expect("write");
        let mut cursor = std::io::Cursor::new(buffer);
        let result: Result<TransferResponse> = recv_json(&mut cursor, MessageLimit::Control).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_recv_json_with_timeout_expires() {
        let mut reader = NeverReadyReader;
        let result: Result<TransferResponse> =
            recv_json_with_timeout(&mut reader, MessageLimit::Control, Duration::from_millis(50))
                .await;
        match result {
            Err(Error::Timeout { layer, elapsed, .. }) => {
                assert_eq!(layer, TimeoutLayer::Socket);
                assert_eq!(elapsed, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recv_json_with_timeout_tolerates_slow_sender() {
        let payload = encode_payload(&TransferResponse::accepted()).expect("encode");
        let mut frame = Vec::new();
        write_message(&mut frame, &payload).await.expect("frame");
        assert!(frame.len() > 20);

        let (mut client, mut server) = tokio::io::duplex(64);
        let sender = tokio::spawn(async move {
            for byte in frame {
                client.write_all(&[byte]).await.expect("write byte");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            client
        });

        let response: TransferResponse =
            recv_json_with_timeout(&mut server, MessageLimit::Control, Duration::from_millis(100))
                .await
                .expect("slow but steady frame");
        assert!(response.success);
        sender.await.expect("sender");
    }

    #[tokio::test]
    async fn test_send_json_with_timeout_tolerates_slow_receiver() {
        let chunk = ChunkData::new(Uuid::new_v4(), 0, vec![7u8; 192 * 1024], true);
        let (mut client, mut server) = tokio::io::duplex(8 * 1024);

        let receiver = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = vec![0u8; 8 * 1024];
            loop {
                let n = server.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            received
        });

        let started = std::time::Instant::now();
        send_json_with_timeout(&mut client, &chunk, Duration::from_millis(200))
            .await
            .expect("slow but steady receiver");
        assert!(started.elapsed() > Duration::from_millis(200));
        drop(client);

        let received = receiver.await.expect("receiver");
        let decoded: ChunkData = decode_payload(&received[LENGTH_PREFIX_SIZE..]).expect("decode");
        assert_eq!(decoded.data.len(), 192 * 1024);
    }

    #[tokio::test]
    async fn test_copy_exact() {
        let mut reader = std::io::Cursor::new(b"0123456789".to_vec());
        let mut out = Vec::new();
        let copied = copy_exact(&mut reader, &mut out, 6).await.expect("copy");
        assert_eq!(copied, 6);
        assert_eq!(out, b"012345");

        let mut short = std::io::Cursor::new(b"0123".to_vec());
        let mut out = Vec::new();
        let result = copy_exact(&mut short, &mut out, 6).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolViolation::Truncated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_copy_exact_with_timeout_stalled_reader() {
        let mut reader = NeverReadyReader;
        let mut out = Vec::new();
        let result =
            copy_exact_with_timeout(&mut reader, &mut out, 6, Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(Error::Timeout {
                layer: TimeoutLayer::Socket,
                ..
            })
        ));
    }

    #[test]
    fn test_chunk_result_into_result() {
        assert!(ChunkResult::ok(4).into_result(4).is_ok());
        assert!(matches!(
            ChunkResult::ok(5).into_result(4),
            Err(Error::Protocol(ProtocolViolation::OutOfOrder {
                expected: 4,
                actual: 5
            }))
        ));

        let err = Error::ChecksumMismatch {
            target: "chunk 4".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        let failed = ChunkResult::failed(4, &err);
        let json = serde_json::to_value(&failed).expect("serialize");
        assert_eq!(json["errorKind"], "ChecksumMismatch");
        match failed.into_result(4) {
            Err(Error::Rejected { kind, .. }) => assert_eq!(kind, ErrorKind::ChecksumMismatch),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_request_wire_names() {
        let json = serde_json::to_value(sample_request()).expect("serialize");
        for key in [
            "transferId",
            "authenticationToken",
            "clientId",
            "metadata",
            "chunkingStrategy",
            "resumeTransfer",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json.get("resumeToken").is_none());
        assert_eq!(json["chunkingStrategy"]["chunkSize"], 16);
        assert_eq!(json["chunkingStrategy"]["maxConcurrentChunks"], 1);
    }

    #[test]
    fn test_request_debug_redacts_token() {
        let debug = format!("{:?}", sample_request());
        assert!(!debug.contains("c2VjcmV0"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_chunk_data_base64_field() {
        let chunk = ChunkData::new(Uuid::new_v4(), 3, b"hello world".to_vec(), true);
        assert_eq!(chunk.chunk_checksum, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["data"], "aGVsbG8gd29ybGQ=");
        assert_eq!(json["chunkIndex"], 3);
        assert_eq!(json["isLastChunk"], true);

        let decoded: ChunkData = serde_json::from_value(json).expect("deserialize");
        assert_eq!(decoded.data, b"hello world");
    }

    #[test]
    fn test_chunk_data_rejects_bad_base64() {
        let json = serde_json::json!({
            "transferId": Uuid::new_v4(),
            "chunkIndex": 0,
            "data": "***",
            "chunkChecksum": "x",
            "isLastChunk": false,
        });
        assert!(serde_json::from_value::<ChunkData>(json).is_err());
    }

    #[test]
    fn test_response_completed_chunks() {
        let ack = TransferResponse::accepted_chunked(&[0, 1, 2], "tok").expect("ack");
        assert_eq!(ack.completed_chunks().expect("parse"), vec![0, 1, 2]);
        assert_eq!(ack.resume_token.as_deref(), Some("tok"));

        assert!(TransferResponse::accepted()
            .completed_chunks()
            .expect("parse")
            .is_empty());

        let bad = TransferResponse {
            success: true,
            additional_info: Some("{\"nope\":true}".into()),
            ..TransferResponse::default()
        };
        assert!(bad.completed_chunks().is_err());
    }

    #[test]
    fn test_rejected_response_into_result() {
        let response = TransferResponse::rejected(&Error::InsufficientSpace {
            needed: 10,
            available: 1,
        });
        assert!(!response.success);
        match response.into_result() {
            Err(Error::Rejected { kind, message }) => {
                assert_eq!(kind, ErrorKind::InsufficientStorage);
                assert!(message.contains("insufficient disk space"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
