//! CLI command definitions and handlers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ferry_core::auth::Permission;
use ferry_core::config::Config;

pub mod config;
pub mod credentials;
pub mod hash;
pub mod send;
pub mod serve;

/// Load and validate configuration.
///
/// An explicit `--config` path must load cleanly. The default file falls
/// back to built-in defaults if it is missing or unreadable.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Using default configuration");
            Config::default()
        }),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Token cancelled on the first Ctrl+C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Ctrl+C received, shutting down");
        signal.cancel();
    });
    token
}

/// Ferry - resumable chunked backup transfer
#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Detailed logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run the transfer receiver
    Serve(ServeArgs),

    /// Upload a backup file
    Send(SendArgs),

    /// Continue an interrupted upload from the local journal
    Resume(ResumeArgs),

    /// Print or verify file digests
    Hash(HashArgs),

    /// Manage client credentials on the receiver
    Credentials(CredentialsArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Root directory for received files
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Directory for persisted session records
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Credential file
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Append audit events to this JSON Lines file
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Reject resume requests whose session cannot be restored
    #[arg(long)]
    pub strict_resume: bool,
}

/// Connection and output options shared by send and resume
#[derive(Args)]
pub struct UploadArgs {
    /// Receiver endpoint (host:port)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Client identifier presented to the receiver
    #[arg(long)]
    pub client_id: Option<String>,

    /// Client secret
    #[arg(long, env = "FERRY_CLIENT_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Maximum attempts, including the first
    #[arg(long)]
    pub attempts: Option<u32>,

    /// Give up after this long (e.g., 30m, 2h)
    #[arg(long)]
    pub timeout: Option<String>,

    /// Skip the connectivity probe
    #[arg(long)]
    pub no_probe: bool,

    /// Do not record interrupted uploads in the journal
    #[arg(long)]
    pub no_journal: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Args)]
pub struct SendArgs {
    /// File to upload
    pub file: PathBuf,

    /// Chunk size in bytes (default: chosen from the file size)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Resume token from an earlier attempt
    #[arg(long)]
    pub resume_token: Option<String>,

    #[command(flatten)]
    pub upload: UploadArgs,
}

/// Arguments for the resume command
#[derive(Args)]
pub struct ResumeArgs {
    /// File whose interrupted upload should continue
    #[arg(required_unless_present_any = ["list", "prune"])]
    pub file: Option<PathBuf>,

    /// List interrupted uploads
    #[arg(long, conflicts_with = "prune")]
    pub list: bool,

    /// Remove journal entries older than seven days
    #[arg(long)]
    pub prune: bool,

    #[command(flatten)]
    pub upload: UploadArgs,
}

/// Arguments for the hash command
#[derive(Args)]
pub struct HashArgs {
    /// File to hash
    pub file: PathBuf,

    /// Expected MD5 (hex)
    #[arg(long)]
    pub md5: Option<String>,

    /// Expected SHA-256 (hex)
    #[arg(long)]
    pub sha256: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the credentials command
#[derive(Args)]
pub struct CredentialsArgs {
    /// Credential file (defaults to server.credentials_file)
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Credentials action
    #[command(subcommand)]
    pub action: CredentialsAction,
}

/// Credentials subcommands
#[derive(Subcommand)]
pub enum CredentialsAction {
    /// Create or replace a client credential
    Add {
        /// Client identifier
        client_id: String,

        /// Granted permissions (upload_backup, read_status, admin)
        #[arg(short, long, value_delimiter = ',', default_value = "upload_backup")]
        permissions: Vec<Permission>,

        /// Expire the credential after this long (e.g., 12h, 90d)
        #[arg(long)]
        expires_in: Option<String>,

        /// Use this secret instead of generating one
        #[arg(long)]
        secret: Option<String>,
    },

    /// List client credentials
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Deactivate a client credential
    Deactivate {
        /// Client identifier
        client_id: String,
    },
}

/// Arguments for the config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Config action
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}
