//! Engine root directory management.
//!
//! ```text
//! <root>/
//! ├─ LOCK                    # Advisory lock for single-process access
//! ├─ journals/               # Write-ahead logfiles and the SHUTDOWN file
//! │  ├─ logfile-<id>.db
//! │  └─ SHUTDOWN
//! └─ database-<id>/          # One directory per database
//!    ├─ parameter.json
//!    └─ collection-<id>-<random>/
//!       ├─ parameter.json
//!       ├─ journal-<fid>.db
//!       └─ datafile-<fid>.db
//! ```
//!
//! The LOCK file ensures only one process opens the engine at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// Holds the exclusive lock on an engine root directory.
///
/// Only one `EngineDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct EngineDir {
    path: PathBuf,
    _lock_file: File,
}

impl EngineDir {
    /// Opens or creates the root directory and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidConfig`] if the directory is missing and
    ///   `create_if_missing` is false, or the path is not a directory
    /// - [`CoreError::DirectoryLocked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_config(format!(
                    "engine directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DirectoryLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Makes renames and removals of directory entries durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be synced.
    #[cfg(unix)]
    pub fn sync(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// NTFS journals metadata itself; nothing to do.
    #[cfg(not(unix))]
    pub fn sync(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_rejected() {
        let dir = tempdir().unwrap();
        let first = EngineDir::open(dir.path(), true).unwrap();
        assert!(matches!(
            EngineDir::open(dir.path(), true),
            Err(CoreError::DirectoryLocked)
        ));
        drop(first);
        EngineDir::open(dir.path(), true).unwrap().sync().unwrap();
    }

    #[test]
    fn missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine");
        assert!(matches!(
            EngineDir::open(&path, false),
            Err(CoreError::InvalidConfig { .. })
        ));
        let opened = EngineDir::open(&path, true).unwrap();
        assert_eq!(opened.path(), path);
    }
}
