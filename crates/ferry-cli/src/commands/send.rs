//! Send and resume command implementations.
//!
//! Both commands build the same client stack: a TCP client wrapped with
//! credentials, retry and an optional overall timeout. Interrupted uploads
//! that received a resume token are written to the local journal so that
//! `ferry resume` can continue them later.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;

use ferry_core::checksum;
use ferry_core::client::{
    ClientOptions, TcpTransferClient, TransferClient, TransferOutcome, UploadJob, WithCredentials,
    WithRetry, WithTimeout,
};
use ferry_core::config::{validate_endpoint, ClientConfig, Config};
use ferry_core::file::format_size;
use ferry_core::journal::{JournalEntry, ResumeJournal};
use ferry_core::retry::{RetryCoordinator, RetryPolicy};
use tokio_util::sync::CancellationToken;

use super::{ResumeArgs, SendArgs, UploadArgs};
use crate::ui;

/// Run the send command.
pub async fn run(args: SendArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let (settings, policy) = apply_overrides(&config, &args.upload)?;

    let source = canonical_source(&args.file)?;
    let mut job = UploadJob::prepare(&source, settings.client_id.clone(), String::new())
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;

    if let Some(chunk_size) = args.chunk_size.or(settings.chunk_size) {
        job = job.with_chunk_size(chunk_size);
        job.strategy
            .validate()
            .context("Invalid --chunk-size")?;
    }
    if let Some(token) = args.resume_token {
        job = job.with_resume_token(token);
    }

    upload(job, &settings, policy, &args.upload).await
}

/// Run the resume command.
pub async fn resume(args: ResumeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let journal = open_journal(&config.client).await?;

    if args.list {
        return list_entries(&journal, args.upload.json).await;
    }
    if args.prune {
        let removed = journal
            .cleanup_expired()
            .await
            .context("Failed to prune journal")?;
        if !args.upload.quiet {
            println!("  Removed {} stale journal entries.", removed);
        }
        return Ok(());
    }

    let file = args
        .file
        .context("A file is required unless --list or --prune is given")?;
    let source = canonical_source(&file)?;
    let entry = journal
        .load(&source)
        .await
        .context("Failed to read journal")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No interrupted upload recorded for {}. Use 'ferry send' instead.",
                source.display()
            )
        })?;

    let (mut settings, policy) = apply_overrides(&config, &args.upload)?;
    if args.upload.server.is_none() {
        settings.server.clone_from(&entry.server);
    }

    let job = UploadJob::prepare(&source, settings.client_id.clone(), String::new())
        .await
        .with_context(|| format!("Failed to read {}", source.display()))?;

    if !checksum::digests_match(&job.metadata.checksum_sha256, &entry.sha256) {
        anyhow::bail!(
            "{} changed since the interrupted upload. Use 'ferry send' to start over.",
            source.display()
        );
    }

    let job = job
        .with_chunk_size(entry.chunk_size)
        .with_resume_token(entry.resume_token);

    upload(job, &settings, policy, &args.upload).await
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &Config, args: &UploadArgs) -> Result<(ClientConfig, RetryPolicy)> {
    let mut settings = config.client.clone();
    if let Some(server) = &args.server {
        validate_endpoint(server).context("Invalid --server")?;
        settings.server.clone_from(server);
    }
    if let Some(client_id) = &args.client_id {
        settings.client_id.clone_from(client_id);
    }
    if let Some(secret) = &args.secret {
        settings.client_secret = Some(secret.clone());
    }
    if let Some(timeout) = &args.timeout {
        let limit = ui::parse_duration(timeout)
            .ok_or_else(|| anyhow::anyhow!("Invalid --timeout '{}'. Use e.g. 30m or 2h.", timeout))?;
        settings.operation_timeout = Some(limit);
    }

    let mut policy = config.retry.clone();
    if let Some(attempts) = args.attempts {
        policy.max_attempts = attempts;
    }
    if args.no_probe {
        policy.probe = false;
    }
    policy.validate().context("Invalid retry settings")?;

    Ok((settings, policy))
}

fn canonical_source(file: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(file).with_context(|| format!("File not found: {}", file.display()))
}

async fn open_journal(settings: &ClientConfig) -> Result<ResumeJournal> {
    let dir = settings
        .journal_dir
        .clone()
        .unwrap_or_else(ResumeJournal::default_dir);
    ResumeJournal::open(dir)
        .await
        .context("Failed to open resume journal")
}

/// Upload `job` through the full client stack and report the result.
async fn upload(
    job: UploadJob,
    settings: &ClientConfig,
    policy: RetryPolicy,
    args: &UploadArgs,
) -> Result<()> {
    let secret = settings.resolved_secret().context(
        "No client secret configured. Set FERRY_CLIENT_SECRET, pass --secret, \
         or add client_secret to the [client] section of config.toml.",
    )?;
    let journal = if args.no_journal {
        None
    } else {
        Some(open_journal(settings).await?)
    };
    let interactive = !args.quiet && !args.json;

    if interactive {
        println!();
        println!("Ferry v{}", ferry_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Uploading {} ({}) to {}",
            job.metadata.file_name,
            format_size(job.metadata.file_size),
            settings.server
        );
        if job.resume_token.is_some() {
            println!("  Resuming an earlier upload");
        }
        println!();
    }

    let tcp = TcpTransferClient::new(settings.server.clone(), ClientOptions::from(settings));
    let progress = tcp.progress();
    let coordinator = RetryCoordinator::new(policy).with_probe_target(settings.server.clone());
    let client = WithRetry::new(
        WithCredentials::new(tcp, settings.client_id.clone(), secret),
        coordinator,
    );

    let cancel = super::cancel_on_ctrl_c();
    let display_done = CancellationToken::new();
    let display = interactive
        .then(|| tokio::spawn(ui::display_progress(progress, display_done.clone())));

    let started = Instant::now();
    let result = match settings.operation_timeout {
        Some(limit) => WithTimeout::new(client, limit).upload(&job, &cancel).await,
        None => client.upload(&job, &cancel).await,
    };

    display_done.cancel();
    if let Some(handle) = display {
        let _ = handle.await;
        println!();
    }

    match result {
        Ok(outcome) => {
            if let Some(journal) = &journal {
                if let Err(e) = journal.delete(&job.source).await {
                    tracing::warn!(error = %e, "Failed to remove journal entry");
                }
            }
            report_success(&job, &outcome, started, args)
        }
        Err(e) => {
            let journaled = match &journal {
                Some(journal) => record_interruption(journal, &job, &settings.server).await,
                None => false,
            };

            if args.json {
                let output = serde_json::json!({
                    "success": false,
                    "error": e.to_string(),
                    "errorKind": e.kind(),
                    "retryable": e.is_retryable(),
                    "journaled": journaled,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else if !args.quiet {
                eprintln!();
                eprintln!("  Upload failed: {}", e);
                if let Some(suggestion) = e.suggestion() {
                    eprintln!();
                    for line in suggestion.lines() {
                        eprintln!("  {}", line);
                    }
                }
                if journaled {
                    eprintln!();
                    eprintln!("  Continue later with: ferry resume {}", job.source.display());
                }
                eprintln!();
            }
            Err(e.into())
        }
    }
}

/// Save a journal entry if the receiver issued a resume token.
async fn record_interruption(journal: &ResumeJournal, job: &UploadJob, server: &str) -> bool {
    let Some(resume_token) = job.resume.get() else {
        return false;
    };

    let entry = JournalEntry {
        transfer_id: job.transfer_id,
        source_path: job.source.clone(),
        server: server.to_string(),
        resume_token,
        sha256: job.metadata.checksum_sha256.clone(),
        file_size: job.metadata.file_size,
        chunk_size: job.strategy.chunk_size,
        updated_at: Utc::now(),
    };

    match journal.save(&entry).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to record interrupted upload");
            false
        }
    }
}

fn report_success(
    job: &UploadJob,
    outcome: &TransferOutcome,
    started: Instant,
    args: &UploadArgs,
) -> Result<()> {
    let elapsed = started.elapsed();

    if args.json {
        let output = serde_json::json!({
            "success": true,
            "transferId": outcome.transfer_id,
            "file": job.source,
            "fileSize": job.metadata.file_size,
            "bytesSent": outcome.bytes_sent,
            "chunksSent": outcome.chunks_sent,
            "chunksSkipped": outcome.chunks_skipped,
            "direct": outcome.direct,
            "elapsedSecs": elapsed.as_secs_f64(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !args.quiet {
        println!();
        println!("  Upload complete!");
        println!(
            "  {} sent in {} ({})",
            format_size(outcome.bytes_sent),
            ui::format_elapsed(elapsed),
            ui::format_rate(outcome.bytes_sent, outcome.elapsed)
        );
        if outcome.chunks_skipped > 0 {
            println!(
                "  {} chunks were already on the receiver",
                outcome.chunks_skipped
            );
        }
        println!();
    }
    Ok(())
}

async fn list_entries(journal: &ResumeJournal, json: bool) -> Result<()> {
    let entries = journal.list().await.context("Failed to read journal")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("  No interrupted uploads.");
        return Ok(());
    }

    println!();
    for entry in &entries {
        println!("  {}", entry.source_path.display());
        println!(
            "    {} to {}, last attempt {}",
            format_size(entry.file_size),
            entry.server,
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();
    Ok(())
}
