//! Ferry CLI - resumable chunked backup transfer
//!
//! Ferry moves large backup files from client hosts to a backup server over
//! a private TCP link, resuming interrupted uploads where they stopped.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the backup server
//! ferry credentials add db-01
//! ferry serve
//!
//! # On a client
//! FERRY_CLIENT_SECRET=... ferry send /var/backups/db.dump --server backup:52700
//!
//! # After an interruption
//! ferry resume /var/backups/db.dump
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::struct_excessive_bools)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Serve(args) => commands::serve::run(args, config_path).await,
        Command::Send(args) => commands::send::run(args, config_path).await,
        Command::Resume(args) => commands::send::resume(args, config_path).await,
        Command::Hash(args) => commands::hash::run(args).await,
        Command::Credentials(args) => commands::credentials::run(args, config_path),
        Command::Config(args) => commands::config::run(args, config_path),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_filter = if verbose {
        "info,ferry=debug,ferry_core=debug"
    } else {
        "warn,ferry=info,ferry_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
