//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// `ENOSPC` on every platform docdb targets.
const ENOSPC: i32 = 28;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A positional write would leave a gap or exceed the allocated size.
    #[error("write out of bounds: offset {offset}, len {len}, size {size}")]
    WriteOutOfBounds {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if the underlying device reported that it is full.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        match self {
            Self::Io(err) => err.raw_os_error() == Some(ENOSPC),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_space_detection() {
        let full = StorageError::Io(io::Error::from_raw_os_error(ENOSPC));
        assert!(full.is_no_space());

        let other = StorageError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(!other.is_no_space());
        assert!(!StorageError::Closed.is_no_space());
    }
}
