//! CLI command implementations.

pub mod dump;
pub mod inspect;
pub mod recover;
pub mod verify;

use docdb_core::wal::Logfile;
use docdb_core::{LogfileId, WAL_DIRECTORY};
use docdb_storage::{FileBackend, StorageBackend};
use std::path::{Path, PathBuf};

/// Reads a whole file through the storage backend.
pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let backend = FileBackend::open_existing(path)?;
    let size = backend.size()?;
    Ok(backend.read_at(0, usize::try_from(size)?)?)
}

/// Logfiles below the engine root, ordered by id.
pub(crate) fn logfiles(root: &Path) -> Result<Vec<(LogfileId, PathBuf)>, Box<dyn std::error::Error>> {
    let dir = root.join(WAL_DIRECTORY);
    if !dir.is_dir() {
        return Err(format!("No logfile directory found at {:?}", dir).into());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(Logfile::parse_filename) {
            found.push((id, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}
