//! Error types for docdb core.

use docdb_storage::StorageError;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in docdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// CBOR encoding or decoding of a marker payload failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// JSON encoding or decoding of a parameter file failed.
    #[error("json error: {message}")]
    Json {
        /// Description of the failure.
        message: String,
    },

    /// No slot or logfile space became available in time.
    #[error("no journal space available")]
    NoJournalSpace,

    /// A lock could not be acquired in time.
    #[error("lock timeout: {what}")]
    LockTimeout {
        /// What was being locked.
        what: String,
    },

    /// A marker failed validation.
    #[error("corrupt marker in {source_name} at offset {offset}: {reason}")]
    CorruptMarker {
        /// Logfile or datafile the marker was read from.
        source_name: String,
        /// Byte offset of the marker.
        offset: u64,
        /// Which check failed.
        reason: String,
    },

    /// A parameter file (database, collection or shutdown state) is unreadable.
    #[error("illegal parameter file {path:?}: {reason}")]
    IllegalParameterFile {
        /// Path of the file.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// Database not found.
    #[error("database not found: {database}")]
    DatabaseNotFound {
        /// Id or name of the database.
        database: String,
    },

    /// Collection not found.
    #[error("collection not found: {collection}")]
    CollectionNotFound {
        /// Id or name of the collection.
        collection: String,
    },

    /// View not found.
    #[error("view not found: {view}")]
    ViewNotFound {
        /// Id or name of the view.
        view: String,
    },

    /// Index not found.
    #[error("index not found: {index}")]
    IndexNotFound {
        /// Id of the index.
        index: u64,
    },

    /// Document not found.
    #[error("document not found: {key}")]
    DocumentNotFound {
        /// Key of the document.
        key: String,
    },

    /// An object with the same name already exists.
    #[error("duplicate name: {name}")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// A unique index already holds the value.
    #[error("unique constraint violated in index {index} for document {key}")]
    UniqueConstraintViolated {
        /// Id of the index.
        index: u64,
        /// Key of the document that was rejected.
        key: String,
    },

    /// Write throttling stayed active for longer than the configured wait.
    #[error("timed out waiting for write throttling to end")]
    WriteThrottleTimeout,

    /// The filesystem reported that it is full.
    #[error("filesystem full")]
    FilesystemFull,

    /// Writes are not allowed at the moment.
    #[error("write-ahead log is read-only")]
    ReadOnly,

    /// A marker exceeds the largest size the log accepts.
    #[error("document too large: {size} bytes, maximum is {max}")]
    DocumentTooLarge {
        /// Aligned size of the marker.
        size: u64,
        /// Largest accepted size.
        max: u64,
    },

    /// Recovery exceeded its error budget or hit a fatal error.
    #[error("recovery failed after {errors} errors: {message}")]
    RecoveryFailed {
        /// Number of errors counted.
        errors: u64,
        /// Description of the last failure.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Which setting is wrong.
        message: String,
    },

    /// Another process holds the database directory.
    #[error("directory locked: another process has exclusive access")]
    DirectoryLocked,

    /// The engine is shutting down.
    #[error("storage engine is shutting down")]
    ShuttingDown,

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        if err.is_no_space() {
            Self::FilesystemFull
        } else {
            Self::Storage(err)
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        Self::from(StorageError::Io(err))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corrupt marker error.
    pub fn corrupt_marker(
        source_name: impl Into<String>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptMarker {
            source_name: source_name.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an illegal parameter file error.
    pub fn illegal_parameter_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::IllegalParameterFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(what: impl Into<String>) -> Self {
        Self::LockTimeout { what: what.into() }
    }

    /// Creates a database not found error.
    pub fn database_not_found(database: impl Display) -> Self {
        Self::DatabaseNotFound {
            database: database.to_string(),
        }
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(collection: impl Display) -> Self {
        Self::CollectionNotFound {
            collection: collection.to_string(),
        }
    }

    /// Creates a view not found error.
    pub fn view_not_found(view: impl Display) -> Self {
        Self::ViewNotFound {
            view: view.to_string(),
        }
    }

    /// Creates a document not found error.
    pub fn document_not_found(key: impl Into<String>) -> Self {
        Self::DocumentNotFound { key: key.into() }
    }

    /// Creates a duplicate name error.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by an object that was dropped concurrently.
    ///
    /// The collector and recovery treat these as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DatabaseNotFound { .. }
                | Self::CollectionNotFound { .. }
                | Self::ViewNotFound { .. }
                | Self::IndexNotFound { .. }
                | Self::DocumentNotFound { .. }
        )
    }

    /// Returns true for errors a caller may retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoJournalSpace
                | Self::LockTimeout { .. }
                | Self::WriteThrottleTimeout
                | Self::FilesystemFull
        )
    }
}
