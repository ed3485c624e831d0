//! # Ferry Core Library
//!
//! `ferry-core` implements a resumable, chunked file-transfer protocol used to
//! move large backup files from client hosts to a backup server over a
//! private TCP link.
//!
//! ## Features
//!
//! - **Length-prefixed JSON framing** over a raw TCP stream
//! - **Integrity**: MD5 per chunk, MD5 + SHA-256 per file
//! - **Resume**: interrupted uploads continue from the last acknowledged chunk,
//!   even across server restarts
//! - **Retry**: exponential backoff, connectivity probing and hard timeouts
//!
//! ## Modules
//!
//! - [`audit`] - Write-behind audit sink for transfer events
//! - [`auth`] - Authentication gate and credential stores
//! - [`checksum`] - MD5 / SHA-256 computation and verification
//! - [`client`] - Sender state machine and composable client wrappers
//! - [`config`] - Configuration management
//! - [`mod@file`] - File metadata, chunking strategy, path sanitising
//! - [`journal`] - Client-side resume journal
//! - [`protocol`] - Wire framing and message types
//! - [`retry`] - Retry/backoff coordinator
//! - [`server`] - Receiver state machine and accept loop
//! - [`session`] - Server-side chunk session manager
//! - [`storage`] - Destination paths and free-space checks
//!
//! ## Example
//!
//! ```rust,ignore
//! use ferry_core::client::{ClientOptions, TcpTransferClient, TransferClient, UploadJob};
//!
//! let job = UploadJob::prepare("backup.tar.gz", "backup-01", token).await?;
//! let client = TcpTransferClient::new("10.0.0.5:52700", ClientOptions::default());
//! let outcome = client.upload(&job, &cancel).await?;
//! println!("sent {} chunks", outcome.chunks_sent);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod audit;
pub mod auth;
pub mod checksum;
pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod journal;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod session;
pub mod storage;

pub use error::{Error, ErrorKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default transfer port (TCP)
pub const DEFAULT_TRANSFER_PORT: u16 = 52700;

/// Smallest chunk size chosen by the default chunking strategy (1 MiB)
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest chunk size accepted on the wire (64 MiB)
///
/// A base64-encoded chunk of this size still fits inside the 100 MiB
/// chunk envelope cap.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Most chunks a single chunked transfer may declare
///
/// At the largest chunk size this still covers 4 TiB files.
pub const DEFAULT_MAX_CHUNK_COUNT: u64 = 64 * 1024;

/// Interval at which upload progress is reported (10 MiB)
pub const PROGRESS_INTERVAL: u64 = 10 * 1024 * 1024;

/// Free-space safety margin applied on top of the declared file size (10%)
pub const SPACE_SAFETY_MARGIN: f64 = 0.10;
