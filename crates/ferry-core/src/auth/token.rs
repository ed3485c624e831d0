//! Opaque session tokens.
//!
//! Consulted when a bearer token is not a direct client credential.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use super::{AuthorizationContext, Permission};

/// Oracle that resolves an opaque session token to a context.
pub trait SessionTokenValidator: Send + Sync {
    /// Resolve `token`, or `None` if it is unknown or expired.
    fn validate(&self, token: &str) -> Option<AuthorizationContext>;
}

/// Validator that accepts no session tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSessionTokens;

impl SessionTokenValidator for NoSessionTokens {
    fn validate(&self, _token: &str) -> Option<AuthorizationContext> {
        None
    }
}

#[derive(Debug)]
struct IssuedToken {
    client_id: String,
    permissions: Vec<Permission>,
    issued_at: Instant,
}

/// In-memory session tokens with a fixed time-to-live.
#[derive(Debug)]
pub struct SessionTokenCache {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl SessionTokenCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a new token for a client.
    pub fn issue(
        &self,
        client_id: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> String {
        use rand::RngCore;

        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let issued = IssuedToken {
            client_id: client_id.into(),
            permissions: permissions.into_iter().collect(),
            issued_at: Instant::now(),
        };

        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), issued);
        token
    }

    /// Revoke a token. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    /// Drop all expired tokens. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        let before = tokens.len();
        tokens.retain(|_, issued| issued.issued_at.elapsed() < self.ttl);
        before - tokens.len()
    }
}

impl SessionTokenValidator for SessionTokenCache {
    fn validate(&self, token: &str) -> Option<AuthorizationContext> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = tokens.get(token)?.issued_at.elapsed() >= self.ttl;
        if expired {
            tokens.remove(token);
            return None;
        }

        tokens.get(token).map(|issued| {
            AuthorizationContext::new(issued.client_id.clone(), issued.permissions.iter().copied())
        })
    }
}
