//! Authentication gate for inbound transfers.
//!
//! Every transfer request carries a bearer token. The gate resolves it to an
//! [`AuthorizationContext`] in two steps:
//!
//! 1. The token is decoded as base64 `clientId:clientSecret` and checked
//!    against the [`CredentialStore`]: the credential must be active, not
//!    expired, and the SHA-256 of the secret must match the stored hash.
//! 2. If decoding fails or the direct check fails, the raw token is handed
//!    to the [`SessionTokenValidator`] as an opaque session token.
//!
//! Contexts are built per request and never persisted.

mod store;
mod token;

pub use store::{ClientCredential, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use token::{NoSessionTokens, SessionTokenCache, SessionTokenValidator};

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Capabilities a client may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Upload (and resume uploading) backup files
    UploadBackup,
    /// Read transfer status
    ReadStatus,
    /// Manage credentials
    Admin,
}

impl Permission {
    /// Wire / config name of the permission.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UploadBackup => "upload_backup",
            Self::ReadStatus => "read_status",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload_backup" | "upload" => Ok(Self::UploadBackup),
            "read_status" | "status" => Ok(Self::ReadStatus),
            "admin" => Ok(Self::Admin),
            other => Err(Error::InvalidConfig {
                key: "permission".to_string(),
                reason: format!("unknown permission '{other}'"),
            }),
        }
    }
}

/// Resolved identity and capabilities for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    /// Authenticated client
    pub client_id: String,
    /// Granted permissions
    pub permissions: HashSet<Permission>,
    /// When the request was authenticated
    pub requested_at: DateTime<Utc>,
}

impl AuthorizationContext {
    /// Build a context stamped with the current time.
    pub fn new(client_id: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            client_id: client_id.into(),
            permissions: permissions.into_iter().collect(),
            requested_at: Utc::now(),
        }
    }

    /// Whether the context grants `permission`.
    #[must_use]
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Authentication gate shared by all connection handlers.
#[derive(Clone)]
pub struct Authenticator {
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionTokenValidator>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Create a gate over a credential store and a session token oracle.
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<dyn SessionTokenValidator>,
    ) -> Self {
        Self {
            credentials,
            sessions,
        }
    }

    /// Create a gate that only accepts direct client credentials.
    pub fn credentials_only(credentials: Arc<dyn CredentialStore>) -> Self {
        Self::new(credentials, Arc::new(NoSessionTokens))
    }

    /// Resolve a bearer token to an authorization context.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthenticationFailed` if neither the direct credential
    /// check nor the session token lookup accepts the token.
    pub fn authenticate(&self, token: &str) -> Result<AuthorizationContext> {
        let now = Utc::now();

        let direct_failure = match decode_bearer_token(token) {
            Some((client_id, secret)) => match self.check_credential(&client_id, &secret, now) {
                Ok(context) => return Ok(context),
                Err(reason) => {
                    tracing::debug!(
                        client_id = %client_id,
                        reason,
                        "Direct credential check failed, trying session token"
                    );
                    Some(reason)
                }
            },
            None => None,
        };

        if let Some(context) = self.sessions.validate(token) {
            return Ok(context);
        }

        Err(Error::AuthenticationFailed(
            direct_failure.unwrap_or("invalid or expired token").to_string(),
        ))
    }

    /// Require a permission on an authenticated context.
    ///
    /// # Errors
    ///
    /// Returns `Error::AuthorizationFailed` if the permission is missing.
    pub fn authorize(context: &AuthorizationContext, permission: Permission) -> Result<()> {
        if context.has(permission) {
            Ok(())
        } else {
            Err(Error::AuthorizationFailed {
                client_id: context.client_id.clone(),
                permission: permission.to_string(),
            })
        }
    }

    fn check_credential(
        &self,
        client_id: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<AuthorizationContext, &'static str> {
        let credential = self
            .credentials
            .lookup(client_id)
            .ok_or("unknown client")?;

        if !credential.is_active {
            return Err("credential is inactive");
        }
        if credential.is_expired(now) {
            return Err("credential has expired");
        }
        if !credential.verify_secret(secret) {
            return Err("secret does not match");
        }

        Ok(AuthorizationContext {
            client_id: credential.client_id,
            permissions: credential.permissions.into_iter().collect(),
            requested_at: now,
        })
    }
}

/// SHA-256 of a client secret, as lowercase hex.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

/// Constant-time comparison of two byte slices.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Encode a bearer token from client credentials.
#[must_use]
pub fn encode_bearer_token(client_id: &str, secret: &str) -> String {
    STANDARD.encode(format!("{client_id}:{secret}"))
}

/// Decode a bearer token into `(client_id, secret)`.
///
/// Returns `None` if the token is not base64 `id:secret`.
#[must_use]
pub fn decode_bearer_token(token: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(token.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (client_id, secret) = text.split_once(':')?;
    if client_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((client_id.to_string(), secret.to_string()))
}

/// Generate a random client secret.
#[must_use]
pub fn generate_secret() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
