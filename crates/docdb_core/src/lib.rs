//! # docdb Core
//!
//! Durability core of the docdb document store.
//!
//! This crate provides:
//! - Write-ahead logfiles shared by all collections, written through a
//!   ring of slots and made durable by a background synchronizer
//! - Transactions whose markers become visible on commit
//! - A collector that moves surviving markers from sealed logfiles into
//!   per-collection datafiles
//! - Crash recovery that replays the logfiles into the catalog
//!
//! ## Example
//!
//! ```rust,no_run
//! use docdb_core::{CollectionDefinition, Config, StorageEngine};
//! use ciborium::Value;
//!
//! let engine = StorageEngine::open("/tmp/docdb".as_ref(), Config::default())?;
//! let db = engine.create_database("main")?;
//! let users = engine.create_collection(db, &CollectionDefinition {
//!     name: "users".into(),
//!     wait_for_sync: true,
//!     journal_size: 0,
//! })?;
//! engine.insert(db, users, "alice", Value::Text("hello".into()))?;
//! engine.shutdown()?;
//! # Ok::<(), docdb_core::CoreError>(())
//! ```
//!
//! ## Startup
//!
//! [`StorageEngine::open`] locks the directory, scans the logfiles,
//! replays them, aborts transactions that were open at the crash, rebuilds
//! secondary indexes and finally starts the collector and remover.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod collector;
mod config;
mod context;
mod dir;
mod engine;
mod error;
pub mod recovery;
mod stats;
pub mod transaction;
mod types;
pub mod wal;

pub use catalog::{Catalog, Collection, Database, DocumentLocation, IndexMode};
pub use collector::Collector;
pub use config::{
    Config, MAX_SLOTS, MIN_JOURNAL_SIZE, MIN_LOGFILE_SIZE, MIN_SLOTS, MIN_SYNC_INTERVAL,
    MIN_THROTTLE_WHEN_PENDING,
};
pub use context::{Context, WAL_DIRECTORY};
pub use dir::EngineDir;
pub use engine::{EngineState, StorageEngine};
pub use error::{CoreError, CoreResult};
pub use recovery::{Recovery, RecoveryPhase};
pub use stats::{EngineStats, StatsSnapshot};
pub use transaction::{DocumentOperation, Transaction, TransactionHints, TransactionStatus};
pub use types::{
    CollectionId, DatabaseId, DatafileId, IndexId, LogfileId, Revision, Tick, TickGenerator,
    TransactionId,
};
pub use wal::{
    CollectionDefinition, DatabaseDefinition, DocumentPayload, FlushOutcome, IndexDefinition,
    LogfileManager, Marker, MarkerType, ViewDefinition,
};
