//! Credentials command implementation.
//!
//! Manages the receiver's credential file. Secrets are shown once, when a
//! credential is created; only their hashes are stored.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use ferry_core::auth::{encode_bearer_token, generate_secret, ClientCredential, FileCredentialStore};

use super::{CredentialsAction, CredentialsArgs};
use crate::ui;

/// Run the credentials command.
pub fn run(args: CredentialsArgs, config_path: Option<&Path>) -> Result<()> {
    let path = match args.file {
        Some(path) => path,
        None => credentials_path(config_path)?,
    };
    let mut store = FileCredentialStore::load_from(path).context("Failed to load credentials")?;

    match args.action {
        CredentialsAction::Add {
            client_id,
            permissions,
            expires_in,
            secret,
        } => {
            let client_id = client_id.trim().to_string();
            if client_id.is_empty() || client_id.contains(':') {
                anyhow::bail!("Client id must be non-empty and must not contain ':'");
            }

            let secret = secret.unwrap_or_else(generate_secret);
            let mut credential = ClientCredential::new(&client_id, &secret, permissions);

            if let Some(expires_in) = expires_in {
                let lifetime = ui::parse_duration(&expires_in).ok_or_else(|| {
                    anyhow::anyhow!("Invalid --expires-in '{}'. Use e.g. 12h or 90d.", expires_in)
                })?;
                let lifetime =
                    chrono::Duration::from_std(lifetime).context("--expires-in is too large")?;
                credential.expires_at = Some(Utc::now() + lifetime);
            }

            store.add(credential).context("Failed to save credentials")?;
            print_new_secret(&client_id, &secret, store.path());
        }
        CredentialsAction::List { json } => list(&store, json)?,
        CredentialsAction::Deactivate { client_id } => {
            if store
                .deactivate(&client_id)
                .context("Failed to save credentials")?
            {
                println!("  Deactivated '{}'.", client_id);
            } else {
                anyhow::bail!("No credential for client '{}'", client_id);
            }
        }
    }

    Ok(())
}

fn credentials_path(config_path: Option<&Path>) -> Result<PathBuf> {
    let config = super::load_config(config_path)?;
    Ok(config.server.credentials_file)
}

fn print_new_secret(client_id: &str, secret: &str, path: &Path) {
    println!();
    println!("  Credential for '{}' written to {}", client_id, path.display());
    println!();
    println!("  Client secret (shown once):");
    println!("    {}", secret);
    println!();
    println!("  Bearer token:");
    println!("    {}", encode_bearer_token(client_id, secret));
    println!();
    println!("  On the client, set:");
    println!("    FERRY_CLIENT_SECRET={}", secret);
    println!();
}

fn list(store: &FileCredentialStore, json: bool) -> Result<()> {
    let credentials = store.list();

    if json {
        // Hashes stay out of the listing.
        let output: Vec<_> = credentials
            .iter()
            .map(|c| {
                serde_json::json!({
                    "clientId": c.client_id,
                    "permissions": c.permissions,
                    "isActive": c.is_active,
                    "expiresAt": c.expires_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if credentials.is_empty() {
        println!("  No credentials in {}", store.path().display());
        return Ok(());
    }

    let now = Utc::now();
    println!();
    for credential in credentials {
        let status = if !credential.is_active {
            "inactive".to_string()
        } else if credential.is_expired(now) {
            "expired".to_string()
        } else if let Some(expires) = credential.expires_at {
            format!("active until {}", expires.format("%Y-%m-%d"))
        } else {
            "active".to_string()
        };
        let permissions: Vec<_> = credential
            .permissions
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {:<20} {:<24} {}",
            credential.client_id,
            status,
            permissions.join(",")
        );
    }
    println!();
    Ok(())
}
