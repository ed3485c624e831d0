//! Credential stores.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{constant_time_eq, hash_secret, Permission};
use crate::error::{Error, Result};

/// A client's stored credential.
///
/// Only the SHA-256 hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCredential {
    /// Client identifier
    pub client_id: String,
    /// Lowercase hex SHA-256 of the client secret
    pub hashed_secret: String,
    /// Granted permissions
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Inactive credentials are always rejected
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Optional expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

const fn default_active() -> bool {
    true
}

impl ClientCredential {
    /// Create an active, non-expiring credential from a plaintext secret.
    pub fn new(client_id: impl Into<String>, secret: &str, permissions: Vec<Permission>) -> Self {
        Self {
            client_id: client_id.into(),
            hashed_secret: hash_secret(secret),
            permissions,
            is_active: true,
            expires_at: None,
        }
    }

    /// Whether the credential has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Check a plaintext secret against the stored hash.
    #[must_use]
    pub fn verify_secret(&self, secret: &str) -> bool {
        let candidate = hash_secret(secret);
        constant_time_eq(
            candidate.as_bytes(),
            self.hashed_secret.trim().to_ascii_lowercase().as_bytes(),
        )
    }
}

/// Credential lookup by client identifier.
pub trait CredentialStore: Send + Sync {
    /// Find the credential for `client_id`.
    fn lookup(&self, client_id: &str) -> Option<ClientCredential>;
}

/// In-memory credential store.
#[derive(Debug, Default, Clone)]
pub struct MemoryCredentialStore {
    credentials: HashMap<String, ClientCredential>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential, builder style.
    #[must_use]
    pub fn with_credential(mut self, credential: ClientCredential) -> Self {
        self.insert(credential);
        self
    }

    /// Add or replace a credential.
    pub fn insert(&mut self, credential: ClientCredential) {
        self.credentials
            .insert(credential.client_id.clone(), credential);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn lookup(&self, client_id: &str) -> Option<ClientCredential> {
        self.credentials.get(client_id).cloned()
    }
}

/// On-disk format of the credential file.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialDatabase {
    version: u32,
    credentials: Vec<ClientCredential>,
}

/// Credential store backed by a JSON file.
///
/// The file is read once at load time and rewritten atomically on change.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    credentials: HashMap<String, ClientCredential>,
}

impl FileCredentialStore {
    /// Load from a specific path. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                credentials: HashMap::new(),
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to open credential file at {}: {}",
                path.display(),
                e
            ))
        })?;

        let db: CredentialDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to parse credential file at {}: {}",
                path.display(),
                e
            ))
        })?;

        let credentials = db
            .credentials
            .into_iter()
            .map(|c| (c.client_id.clone(), c))
            .collect();

        Ok(Self { path, credentials })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored credentials, sorted by client id.
    #[must_use]
    pub fn list(&self) -> Vec<&ClientCredential> {
        let mut all: Vec<_> = self.credentials.values().collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }

    /// Add or replace a credential and save.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn add(&mut self, credential: ClientCredential) -> Result<()> {
        self.credentials
            .insert(credential.client_id.clone(), credential);
        self.save()
    }

    /// Deactivate a credential and save.
    ///
    /// Returns whether the client was found.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be saved.
    pub fn deactivate(&mut self, client_id: &str) -> Result<bool> {
        match self.credentials.get_mut(client_id) {
            Some(credential) => {
                credential.is_active = false;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the store to disk atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to create credential directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = CredentialDatabase {
            version: 1,
            credentials: self.list().into_iter().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&db)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            count = db.credentials.len(),
            "Saved credential store"
        );

        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn lookup(&self, client_id: &str) -> Option<ClientCredential> {
        self.credentials.get(client_id).cloned()
    }
}
