//! # docdb Testkit
//!
//! Test utilities for docdb.
//!
//! This crate provides:
//! - Test fixtures and engine helpers
//! - Property-based test generators using proptest
//! - Crash simulation and logfile damage helpers
//! - Fuzz testing harnesses
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_recovery() {
//!     let mut engine = scenarios::populated_engine(10);
//!     engine.crash_and_recover().unwrap();
//!     assert!(engine.get(&scenarios::numbered_key(0)).is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::fuzz::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::{
    corrupt_logfile_byte, simulate_crash, tear_last_marker, truncate_logfile_tail,
    CrashRecoveryHarness,
};
pub use fixtures::*;
pub use generators::*;
