//! Configuration management for Ferry.
//!
//! One TOML file carries the receiver, client and retry settings. Every
//! section and field is optional; missing values take their defaults.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/ferry/config.toml` |
//! | macOS | `~/Library/Application Support/Ferry/config.toml` |
//! | Windows | `%APPDATA%\Ferry\config.toml` |
//!
//! ## Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:52700"
//! storage_root = "/srv/backups"
//! session_max_age = "24h"
//!
//! [client]
//! server = "backup.lan:52700"
//! client_id = "db-01"
//!
//! [retry]
//! max_attempts = 5
//! base_delay = "2s"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::DEFAULT_TRANSFER_PORT;

/// Main configuration struct for Ferry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Receiver settings
    pub server: ServerConfig,
    /// Uploading client settings
    pub client: ClientConfig,
    /// Retry and backoff settings
    pub retry: RetryPolicy,
}

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Root directory receiving backups (one subdirectory per client)
    pub storage_root: PathBuf,
    /// Directory holding persisted session records
    pub state_dir: PathBuf,
    /// Client credential database
    pub credentials_file: PathBuf,
    /// JSON Lines audit log; audit events go to the log output when unset
    pub audit_log: Option<PathBuf>,
    /// Idle sessions older than this are discarded
    #[serde(with = "humantime_serde")]
    pub session_max_age: Duration,
    /// How often expired sessions are swept
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Socket read/write timeout for every protocol message
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Fail a resume request whose session cannot be restored instead of
    /// starting a fresh session
    pub strict_resume: bool,
    /// Most chunks one transfer may declare
    pub max_chunk_count: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = Config::data_dir().unwrap_or_else(|| PathBuf::from(".ferry"));
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TRANSFER_PORT)),
            storage_root: data_dir.join("backups"),
            state_dir: data_dir.join("sessions"),
            credentials_file: data_dir.join("credentials.json"),
            audit_log: None,
            session_max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            read_timeout: Duration::from_secs(30),
            strict_resume: false,
            max_chunk_count: crate::DEFAULT_MAX_CHUNK_COUNT,
        }
    }
}

/// Uploading client settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Receiver endpoint (`host:port`)
    pub server: String,
    /// Identity presented to the receiver
    pub client_id: String,
    /// Shared secret; `FERRY_CLIENT_SECRET` takes precedence
    pub client_secret: Option<String>,
    /// Fixed chunk size; chosen from the file size when unset
    pub chunk_size: Option<u64>,
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-message socket timeout
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Hard limit on the whole upload, retries included
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
    /// Resume journal location; platform default when unset
    pub journal_dir: Option<PathBuf>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("chunk_size", &self.chunk_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("io_timeout", &self.io_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("journal_dir", &self.journal_dir)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{DEFAULT_TRANSFER_PORT}"),
            client_id: hostname::get().map_or_else(
                |_| "ferry-client".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            client_secret: None,
            chunk_size: None,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            operation_timeout: None,
            journal_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to `path`.
    ///
    /// Creates the parent directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check every section for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.client.validate()?;
        self.server.validate()
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "ferry", "Ferry")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "ferry", "Ferry")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.read_timeout.is_zero() {
            return Err(invalid("server.read_timeout", "must be greater than zero"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid("server.cleanup_interval", "must be greater than zero"));
        }
        if self.max_chunk_count == 0 {
            return Err(invalid("server.max_chunk_count", "must be greater than zero"));
        }
        Ok(())
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<()> {
        validate_endpoint(&self.server)?;

        if self.client_id.trim().is_empty() {
            return Err(invalid("client.client_id", "must not be empty"));
        }
        if let Some(size) = self.chunk_size {
            if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&size) {
                return Err(invalid(
                    "client.chunk_size",
                    &format!(
                        "must be between {} and {} bytes, got {size}",
                        crate::MIN_CHUNK_SIZE,
                        crate::MAX_CHUNK_SIZE
                    ),
                ));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("client.connect_timeout", "must be greater than zero"));
        }
        if self.io_timeout.is_zero() {
            return Err(invalid("client.io_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Secret from `FERRY_CLIENT_SECRET`, else from the file.
    #[must_use]
    pub fn resolved_secret(&self) -> Option<String> {
        std::env::var("FERRY_CLIENT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.client_secret.clone())
    }
}

/// Check an endpoint has the `host:port` shape with a usable port.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` for a malformed endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(invalid("client.server", "expected host:port"));
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("client.server", "host is empty"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(
            "client.server",
            &format!("invalid port '{port}'"),
        )),
        Ok(_) => Ok(()),
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
