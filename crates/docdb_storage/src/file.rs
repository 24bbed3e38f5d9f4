//! File backend used for logfiles and collection datafiles.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct Handle {
    file: File,
    len: u64,
}

impl Handle {
    fn seek_to(&mut self, offset: u64) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

/// A byte store backed by one file.
///
/// Logfiles are created with [`FileBackend::create_new`], sized once with
/// [`StorageBackend::allocate`] and then filled by positional writes.
/// Datafile journals grow with [`StorageBackend::append`].
///
/// `sync` falls back to `fdatasync` unless the file length changed since
/// the previous sync.
///
/// ```no_run
/// use docdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::create_new(Path::new("logfile-17.db")).unwrap();
/// backend.allocate(1024 * 1024).unwrap();
/// backend.write_at(0, b"marker bytes").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    handle: Mutex<Handle>,
    metadata_dirty: bool,
}

impl FileBackend {
    /// Opens an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::wrap(path, file)
    }

    /// Creates a new, empty file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created.
    pub fn create_new(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::wrap(path, file)
    }

    fn wrap(path: &Path, file: File) -> StorageResult<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            handle: Mutex::new(Handle { file, len }),
            metadata_dirty: false,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut handle = self.handle.lock();
        let size = handle.len;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => {}
            _ => return Err(StorageError::ReadPastEnd { offset, len, size }),
        }

        let mut buffer = vec![0u8; len];
        if len > 0 {
            handle.seek_to(offset)?;
            handle.file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        let size = handle.len;
        match offset.checked_add(data.len() as u64) {
            Some(end) if end <= size => {}
            _ => {
                return Err(StorageError::WriteOutOfBounds {
                    offset,
                    len: data.len(),
                    size,
                })
            }
        }

        if !data.is_empty() {
            handle.seek_to(offset)?;
            handle.file.write_all(data)?;
        }
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let handle = self.handle.get_mut();
        let offset = handle.len;
        if data.is_empty() {
            return Ok(offset);
        }

        handle.seek_to(offset)?;
        handle.file.write_all(data)?;
        handle.len += data.len() as u64;
        self.metadata_dirty = true;
        Ok(offset)
    }

    fn allocate(&mut self, len: u64) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        if len > handle.len {
            handle.file.set_len(len)?;
            handle.len = len;
            self.metadata_dirty = true;
        }
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.handle.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.handle.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        if self.metadata_dirty {
            handle.file.sync_all()?;
            self.metadata_dirty = false;
        } else {
            handle.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let handle = self.handle.get_mut();
        if new_size > handle.len {
            return Err(StorageError::Corrupted(format!(
                "{}: truncate to {new_size} beyond size {}",
                self.path.display(),
                handle.len
            )));
        }

        handle.file.set_len(new_size)?;
        handle.file.sync_all()?;
        handle.len = new_size;
        self.metadata_dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logfile-1.db");

        let backend = FileBackend::create_new(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.path(), path);
        assert!(FileBackend::create_new(&path).is_err());
    }

    #[test]
    fn open_existing_requires_file() {
        let dir = tempdir().unwrap();
        assert!(FileBackend::open_existing(&dir.path().join("missing.db")).is_err());
    }

    #[test]
    fn preallocated_file_takes_out_of_order_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logfile-2.db");

        let mut backend = FileBackend::create_new(&path).unwrap();
        backend.allocate(64).unwrap();
        backend.allocate(16).unwrap();
        assert_eq!(backend.size().unwrap(), 64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);

        backend.write_at(32, b"second").unwrap();
        backend.write_at(0, b"first").unwrap();

        assert_eq!(backend.read_at(0, 5).unwrap(), b"first");
        assert_eq!(backend.read_at(32, 6).unwrap(), b"second");
        assert_eq!(backend.read_at(8, 8).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn out_of_range_access_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::create_new(&dir.path().join("logfile-3.db")).unwrap();
        backend.allocate(8).unwrap();

        assert!(matches!(
            backend.write_at(4, b"too long"),
            Err(StorageError::WriteOutOfBounds { .. })
        ));
        assert!(matches!(
            backend.read_at(6, 4),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(u64::MAX, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn synced_writes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logfile-4.db");

        {
            let mut backend = FileBackend::create_new(&path).unwrap();
            backend.allocate(32).unwrap();
            backend.sync().unwrap();
            backend.write_at(8, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open_existing(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 32);
        assert_eq!(backend.read_at(8, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn journal_appends_after_truncated_tail() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::create_new(&dir.path().join("journal-5.db")).unwrap();

        assert_eq!(backend.append(b"header").unwrap(), 0);
        assert_eq!(backend.append(b"torn").unwrap(), 6);
        backend.truncate(6).unwrap();
        assert!(backend.truncate(50).is_err());

        assert_eq!(backend.append(b"!").unwrap(), 6);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"header!");
    }
}
