//! # docdb Storage
//!
//! Storage backend trait and implementations for docdb.
//!
//! This crate provides the lowest-level storage abstraction for docdb.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, positional write, append, sync)
//! - No knowledge of docdb file formats, logfiles, or datafiles
//! - Must be `Send + Sync` for concurrent access
//! - docdb owns all file format interpretation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use docdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.allocate(16).unwrap();
//! backend.write_at(4, b"wal!").unwrap();
//! assert_eq!(backend.read_at(4, 4).unwrap(), b"wal!");
//! assert_eq!(backend.size().unwrap(), 16);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
