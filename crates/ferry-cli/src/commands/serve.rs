//! Serve command implementation.
//!
//! Runs the transfer receiver until Ctrl+C, with the periodic session
//! sweep and the audit log alongside it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use ferry_core::audit::{AuditSink, AuditWriter, JsonlAuditLog, TracingAuditSink};
use ferry_core::auth::{Authenticator, FileCredentialStore};
use ferry_core::config::ServerConfig;
use ferry_core::server::{ReceiverOptions, ReceiverServices, Server};
use ferry_core::session::SessionManager;
use ferry_core::storage::{LocalStorage, StorageProvider};

use super::ServeArgs;

const AUDIT_QUEUE_CAPACITY: usize = 1024;

/// Run the serve command.
pub async fn run(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let settings = apply_overrides(config.server, args);

    let credentials = FileCredentialStore::load_from(settings.credentials_file.clone())
        .context("Failed to load credentials")?;
    if credentials.list().is_empty() {
        tracing::warn!(
            path = %settings.credentials_file.display(),
            "No client credentials configured; every upload will be rejected. \
             Add one with 'ferry credentials add <client-id>'."
        );
    }

    tokio::fs::create_dir_all(&settings.storage_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage root {}",
                settings.storage_root.display()
            )
        })?;

    let sessions = Arc::new(
        SessionManager::open(&settings.state_dir)
            .await
            .context("Failed to open session state")?,
    );
    match sessions.cleanup_expired(settings.session_max_age).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "Discarded expired sessions at startup"),
        Err(e) => tracing::warn!(error = %e, "Startup session sweep failed"),
    }

    let (audit, audit_writer) = open_audit(&settings).await?;

    let services = ReceiverServices {
        sessions: Arc::clone(&sessions),
        authenticator: Authenticator::credentials_only(Arc::new(credentials)),
        storage: Arc::new(LocalStorage::new(&settings.storage_root)) as Arc<dyn StorageProvider>,
        audit,
    };

    let server = Server::bind(settings.bind, ReceiverOptions::from(&settings), services)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.bind))?;
    let addr = server.local_addr()?;

    println!();
    println!("Ferry v{}", ferry_core::VERSION);
    println!("{}", "-".repeat(37));
    println!();
    println!("  Listening on {}", addr);
    println!("  Storing backups in {}", settings.storage_root.display());
    println!("  Press Ctrl+C to stop");
    println!();

    let cleanup = sessions.spawn_cleanup_task(settings.cleanup_interval, settings.session_max_age);
    let cancel = super::cancel_on_ctrl_c();

    let result = server.run(cancel).await;

    cleanup.stop().await;
    if let Some(writer) = audit_writer {
        writer.shutdown().await;
    }

    result.context("Receiver stopped with an error")?;
    println!("  Receiver stopped.");
    Ok(())
}

fn apply_overrides(mut settings: ServerConfig, args: ServeArgs) -> ServerConfig {
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }
    if let Some(storage) = args.storage {
        settings.storage_root = storage;
    }
    if let Some(state_dir) = args.state_dir {
        settings.state_dir = state_dir;
    }
    if let Some(credentials) = args.credentials {
        settings.credentials_file = credentials;
    }
    if args.audit_log.is_some() {
        settings.audit_log = args.audit_log;
    }
    if args.strict_resume {
        settings.strict_resume = true;
    }
    settings
}

async fn open_audit(
    settings: &ServerConfig,
) -> Result<(Arc<dyn AuditSink>, Option<AuditWriter>)> {
    match &settings.audit_log {
        Some(path) => {
            let (log, writer) = JsonlAuditLog::open(path, AUDIT_QUEUE_CAPACITY)
                .await
                .with_context(|| format!("Failed to open audit log {}", path.display()))?;
            Ok((Arc::new(log), Some(writer)))
        }
        None => Ok((Arc::new(TracingAuditSink), None)),
    }
}
