//! In-memory backend that models the page cache.
//!
//! Written bytes are visible immediately but only become durable on
//! [`StorageBackend::sync`]. [`InMemoryBackend::crash`] drops everything
//! that was not synced, which is what a power loss does to a logfile.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Image {
    visible: Vec<u8>,
    durable: Vec<u8>,
    syncs: u64,
}

/// A byte store kept in memory.
///
/// ```rust
/// use docdb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.allocate(8).unwrap();
/// backend.write_at(0, b"tick").unwrap();
/// assert_eq!(backend.crash().read_at(0, 4).unwrap(), b"\0\0\0\0");
///
/// backend.sync().unwrap();
/// assert_eq!(backend.crash().read_at(0, 4).unwrap(), b"tick");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    image: RwLock<Image>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend whose contents are already durable.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            image: RwLock::new(Image {
                durable: data.clone(),
                visible: data,
                syncs: 0,
            }),
        }
    }

    /// Current contents, synced or not.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.image.read().visible.clone()
    }

    /// Contents as of the last sync.
    #[must_use]
    pub fn durable_data(&self) -> Vec<u8> {
        self.image.read().durable.clone()
    }

    /// Number of completed syncs.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.image.read().syncs
    }

    /// Returns a backend holding only what survived the last sync.
    #[must_use]
    pub fn crash(&self) -> Self {
        Self::with_data(self.durable_data())
    }

    fn check_range(len: u64, offset: u64, count: usize) -> Option<(usize, usize)> {
        let end = offset.checked_add(count as u64)?;
        (end <= len).then(|| (offset as usize, end as usize))
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let image = self.image.read();
        let size = image.visible.len() as u64;
        let (start, end) = Self::check_range(size, offset, len)
            .ok_or(StorageError::ReadPastEnd { offset, len, size })?;
        Ok(image.visible[start..end].to_vec())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut image = self.image.write();
        let size = image.visible.len() as u64;
        let (start, end) =
            Self::check_range(size, offset, data.len()).ok_or(StorageError::WriteOutOfBounds {
                offset,
                len: data.len(),
                size,
            })?;
        image.visible[start..end].copy_from_slice(data);
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut image = self.image.write();
        let offset = image.visible.len() as u64;
        image.visible.extend_from_slice(data);
        Ok(offset)
    }

    fn allocate(&mut self, len: u64) -> StorageResult<()> {
        let mut image = self.image.write();
        if (image.visible.len() as u64) < len {
            image.visible.resize(len as usize, 0);
        }
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.image.read().visible.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut image = self.image.write();
        image.durable = image.visible.clone();
        image.syncs += 1;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut image = self.image.write();
        let size = image.visible.len() as u64;
        if new_size > size {
            return Err(StorageError::Corrupted(format!(
                "truncate to {new_size} beyond size {size}"
            )));
        }
        image.visible.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_writes_stay_inside_allocation() {
        let mut backend = InMemoryBackend::new();
        backend.allocate(10).unwrap();
        backend.write_at(6, b"tail").unwrap();
        backend.write_at(0, b"head").unwrap();
        assert_eq!(backend.read_at(0, 10).unwrap(), b"head\0\0tail");

        let result = backend.write_at(8, b"xyz");
        assert!(matches!(result, Err(StorageError::WriteOutOfBounds { .. })));
        assert_eq!(backend.size().unwrap(), 10);
    }

    #[test]
    fn allocate_never_shrinks() {
        let mut backend = InMemoryBackend::with_data(b"abc".to_vec());
        backend.allocate(6).unwrap();
        backend.allocate(2).unwrap();
        assert_eq!(backend.data(), b"abc\0\0\0".to_vec());
    }

    #[test]
    fn reads_past_end_fail() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"marker").unwrap();

        assert!(matches!(
            backend.read_at(4, 8),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(u64::MAX, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(6, 0).unwrap().is_empty());
    }

    #[test]
    fn crash_keeps_only_synced_bytes() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"committed").unwrap(), 0);
        backend.sync().unwrap();
        assert_eq!(backend.append(b"pending").unwrap(), 9);

        let recovered = backend.crash();
        assert_eq!(recovered.data(), b"committed");
        assert_eq!(backend.data(), b"committedpending");
        assert_eq!(backend.sync_count(), 1);
    }

    #[test]
    fn truncate_drops_tail() {
        let mut backend = InMemoryBackend::with_data(b"header torn".to_vec());
        backend.truncate(6).unwrap();
        assert_eq!(backend.data(), b"header");
        assert_eq!(backend.durable_data(), b"header torn");
        assert!(backend.truncate(100).is_err());
    }
}
