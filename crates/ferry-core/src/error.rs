//! Error types for Ferry.
//!
//! This module provides a unified error type for all Ferry operations,
//! with specific error variants for different failure modes and a coarse
//! [`ErrorKind`] used to decide retry policy and to report failures to the
//! remote peer.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for Ferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a failure.
///
/// Sent to the peer alongside the error message so that the client can tell
/// a terminal rejection (bad credentials, no space) from a transient one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Source file or session missing
    NotFound,
    /// Malformed endpoint or settings
    InvalidConfiguration,
    /// Bearer token rejected
    AuthenticationFailed,
    /// Authenticated client lacks the required permission
    AuthorizationFailed,
    /// Not enough free space on the destination volume
    InsufficientStorage,
    /// Out-of-order chunk, truncated or oversized message
    ProtocolViolation,
    /// Digest did not match the declared value
    ChecksumMismatch,
    /// An operation exceeded its deadline
    Timeout,
    /// All retry attempts were used up
    RetryExhausted,
    /// Aborted by the user
    Cancelled,
    /// Anything else
    Unexpected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Layer at which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutLayer {
    /// TCP connection establishment
    Connect,
    /// A single socket read or write
    Socket,
    /// The whole wrapped operation
    Operation,
    /// Pre-flight connectivity probing
    Probe,
}

impl fmt::Display for TimeoutLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Socket => "socket",
            Self::Operation => "operation",
            Self::Probe => "connectivity probe",
        };
        f.write_str(name)
    }
}

/// Wire protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Peer closed the stream before a message started
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Peer closed the stream in the middle of a message
    #[error("truncated message: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes announced by the length prefix
        expected: usize,
        /// Bytes actually received
        received: usize,
    },

    /// Length prefix of zero
    #[error("empty message")]
    EmptyMessage,

    /// Length prefix above the allowed cap
    #[error("message of {length} bytes exceeds limit of {limit} bytes")]
    Oversized {
        /// Announced length
        length: usize,
        /// Allowed maximum
        limit: usize,
    },

    /// Chunk index differs from the next expected index
    #[error("out-of-order chunk: expected index {expected}, got {actual}")]
    OutOfOrder {
        /// Next index the receiver was waiting for
        expected: u64,
        /// Index that actually arrived
        actual: u64,
    },

    /// Payload could not be decoded or contradicts the handshake
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Declared chunk size splits the file into more chunks than allowed
    #[error("transfer needs {count} chunks, limit is {limit}; use a larger chunk size")]
    TooManyChunks {
        /// Chunks the declared strategy produces
        count: u64,
        /// Receiver's maximum
        limit: u64,
    },
}

/// The main error type for Ferry.
#[derive(Error, Debug)]
pub enum Error {
    /// Source file not found (F001)
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Transfer session not found (F002)
    #[error("transfer session not found: {0}")]
    SessionNotFound(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value (F003)
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Bearer token rejected (F004)
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Missing permission (F005)
    #[error("client '{client_id}' lacks permission '{permission}'")]
    AuthorizationFailed {
        /// Authenticated client
        client_id: String,
        /// Permission that was required
        permission: String,
    },

    /// Insufficient disk space (F006)
    #[error("insufficient disk space: need {needed} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Bytes needed (including safety margin)
        needed: u64,
        /// Bytes available
        available: u64,
    },

    /// Wire protocol violation (F007)
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Resume state doesn't match the current transfer
    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),

    /// Checksum mismatch detected (F008)
    #[error("checksum mismatch for {target}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        /// What was being verified (file path or chunk)
        target: String,
        /// Declared digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// Remote peer rejected the transfer
    #[error("rejected by server ({kind}): {message}")]
    Rejected {
        /// Classification reported by the peer
        kind: ErrorKind,
        /// Message reported by the peer
        message: String,
    },

    /// Operation timeout (F009)
    #[error("{operation}: {layer} timed out after {elapsed:.1?}")]
    Timeout {
        /// Operation that was running
        operation: String,
        /// Layer at which the deadline fired
        layer: TimeoutLayer,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// Retry attempts exhausted (F010)
    #[error("{operation} failed after {attempts} attempts in {elapsed:.1?}: {last_error}")]
    RetryExhausted {
        /// Operation that was retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Total time spent across attempts
        elapsed: Duration,
        /// Error from the final attempt
        last_error: Box<Error>,
    },

    /// Transfer was cancelled
    #[error("transfer cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a timeout error for the given operation and layer.
    pub fn timeout(operation: impl Into<String>, layer: TimeoutLayer, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            layer,
            elapsed,
        }
    }

    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern FXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::FileNotFound(_) => Some("F001"),
            Self::SessionNotFound(_) => Some("F002"),
            Self::InvalidConfig { .. } => Some("F003"),
            Self::AuthenticationFailed(_) => Some("F004"),
            Self::AuthorizationFailed { .. } => Some("F005"),
            Self::InsufficientSpace { .. } => Some("F006"),
            Self::Protocol(_) => Some("F007"),
            Self::ChecksumMismatch { .. } => Some("F008"),
            Self::Timeout { .. } => Some("F009"),
            Self::RetryExhausted { .. } => Some("F010"),
            _ => None,
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound(_) | Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::ConfigError(_) | Self::InvalidConfig { .. } => ErrorKind::InvalidConfiguration,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::AuthorizationFailed { .. } => ErrorKind::AuthorizationFailed,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientStorage,
            Self::Protocol(_) | Self::ResumeMismatch(_) => ErrorKind::ProtocolViolation,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::Rejected { kind, .. } => *kind,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Unexpected,
        }
    }

    /// Returns whether this error is transient and the operation may be retried.
    ///
    /// Only connectivity and transient I/O failures qualify. Credential,
    /// authorization, protocol and integrity failures are terminal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::NetworkDown
            ),
            Self::Protocol(v) => matches!(
                v,
                ProtocolViolation::ConnectionClosed | ProtocolViolation::Truncated { .. }
            ),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::AuthenticationFailed => Some(
                "Check client_id and client_secret in the [client] section of config.toml.\n\
                 A new secret can be issued on the server with:\n\
                   ferry credentials add <client-id>",
            ),
            ErrorKind::AuthorizationFailed => Some(
                "The credential exists but is not allowed to upload backups.\n\
                 Re-issue it with the upload_backup permission.",
            ),
            ErrorKind::InsufficientStorage => Some(
                "Free space on the server's storage_root volume; the server\n\
                 requires the file size plus a 10% safety margin.",
            ),
            ErrorKind::InvalidConfiguration => Some(
                "Run with --config <path> or fix the value in config.toml.",
            ),
            ErrorKind::RetryExhausted | ErrorKind::Timeout => Some(
                "The server could not be reached reliably. Progress is kept;\n\
                 run `ferry resume <file>` once the link is back.",
            ),
            _ => None,
        }
    }
}
