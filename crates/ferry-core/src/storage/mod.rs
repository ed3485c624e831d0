//! Storage services used by the receiver.
//!
//! The receiver asks a [`StorageProvider`] where an upload should land and
//! how much space is left there. [`LocalStorage`] lays files out as
//! `<root>/<client_id>/<file_name>`.

use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::error::{Error, Result};
use crate::file::{sanitize_file_name, sanitize_path, FileMetadata};

/// Destination path and free-space services.
///
/// Both methods touch the filesystem and may block; the receiver calls them
/// on the blocking pool.
pub trait StorageProvider: Send + Sync {
    /// Compute (and create the parent directories of) the final path for an
    /// upload.
    fn destination_for(&self, client_id: &str, metadata: &FileMetadata) -> Result<PathBuf>;

    /// Free bytes available to unprivileged writers at `path`.
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Bytes required to accept a file of `file_size` bytes, margin included.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn required_space(file_size: u64) -> u64 {
    let margin = (file_size as f64 * crate::SPACE_SAFETY_MARGIN).ceil() as u64;
    file_size.saturating_add(margin)
}

/// Check that `available` bytes can hold a file of `file_size` bytes.
///
/// # Errors
///
/// Returns `Error::InsufficientSpace` when it cannot.
pub fn ensure_space(file_size: u64, available: u64) -> Result<()> {
    let needed = required_space(file_size);
    if available < needed {
        return Err(Error::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for LocalStorage {
    fn destination_for(&self, client_id: &str, metadata: &FileMetadata) -> Result<PathBuf> {
        let client_dir = sanitize_file_name(client_id)?;
        let file_name = sanitize_file_name(&metadata.file_name)?;
        let relative = Path::new(&client_dir).join(file_name);

        let destination = sanitize_path(&self.root, &relative).ok_or_else(|| {
            Error::Internal(format!(
                "destination escapes storage root: {}",
                relative.display()
            ))
        })?;

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(destination)
    }

    fn available_space(&self, path: &Path) -> Result<u64> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or(&self.root);
        available_space_at(existing)
    }
}

/// Free space on the volume holding `path`.
///
/// Picks the mounted disk with the longest mount point containing `path`.
fn available_space_at(path: &Path) -> Result<u64> {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| absolute.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(sysinfo::Disk::available_space)
        .ok_or_else(|| {
            Error::Internal(format!(
                "cannot determine available space for {}",
                absolute.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn metadata(name: &str) -> FileMetadata {
        FileMetadata {
            file_name: name.into(),
            file_size: 10,
            checksum_md5: String::new(),
            checksum_sha256: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_required_space_adds_margin() {
        assert_eq!(required_space(0), 0);
        assert_eq!(required_space(100), 110);
        assert_eq!(required_space(1), 2);
    }

    #[test]
    fn test_ensure_space() {
        assert!(ensure_space(100, 110).is_ok());
        match ensure_space(100, 109) {
            Err(Error::InsufficientSpace { needed, available }) => {
                assert_eq!(needed, 110);
                assert_eq!(available, 109);
            }
            other => panic!("expected insufficient space, got {other:?}"),
        }
    }

    #[test]
    fn test_destination_layout() {
        let dir = TempDir::new().expect("create temp dir");
        let storage = LocalStorage::new(dir.path());

        let dest = storage
            .destination_for("db-01", &metadata("nightly.sql.gz"))
            .expect("destination");
        assert_eq!(dest, dir.path().join("db-01").join("nightly.sql.gz"));
        assert!(dir.path().join("db-01").is_dir());
    }

    #[test]
    fn test_destination_strips_traversal() {
        let dir = TempDir::new().expect("create temp dir");
        let storage = LocalStorage::new(dir.path());

        let dest = storage
            .destination_for("../other", &metadata("../../etc/passwd"))
            .expect("destination");
        assert!(dest.starts_with(dir.path()));
        assert_eq!(dest, dir.path().join("other").join("passwd"));
    }

    #[test]
    fn test_available_space_for_missing_file() {
        let dir = TempDir::new().expect("create temp dir");
        let storage = LocalStorage::new(dir.path());
        let space = storage
            .available_space(&dir.path().join("not-yet").join("file.bin"))
            .expect("space");
        assert!(space > 0);
        assert!(space < u64::MAX);
    }

    #[test]
    fn test_available_space_resolves_relative_paths() {
        let storage = LocalStorage::new(".");
        let relative = storage.available_space(Path::new(".")).expect("relative");
        let absolute = storage
            .available_space(&std::env::current_dir().expect("cwd"))
            .expect("absolute");
        assert!(relative > 0);
        assert!(absolute > 0);
    }
}
