//! Crash recovery testing for docdb.
//!
//! This module provides utilities for testing crash recovery behavior.
//! It kills engines mid-operation, damages logfiles the way an
//! interrupted write or bad media would, and verifies that the engine
//! recovers correctly.
//!
//! ## Test Strategy
//!
//! 1. **Crash after commit** - Committed documents survive
//! 2. **Crash before commit** - Open transactions are discarded
//! 3. **Torn tail** - A half-written last marker ends the log
//! 4. **Corrupt marker** - Damage in the middle of a logfile is fatal
//!    unless `ignore_logfile_errors` is set
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docdb_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! harness.run_all_tests();
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use crate::fixtures::{scenarios, TestEngine};
use docdb_core::wal::{DocumentPayload, Logfile, MarkerReader, MarkerType, MARKER_HEADER_SIZE};
use docdb_core::{DocumentOperation, StorageEngine, TransactionHints, WAL_DIRECTORY};
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Stops `engine` the way a killed process would.
///
/// Background threads stop, nothing is flushed or sealed and the
/// `SHUTDOWN` file keeps the contents of the last startup.
pub fn simulate_crash(engine: StorageEngine) {
    engine.kill();
}

/// Newest logfile below `root` that contains document or structural
/// markers.
pub fn newest_data_logfile(root: &Path) -> io::Result<PathBuf> {
    let mut logfiles = Vec::new();
    for entry in std::fs::read_dir(root.join(WAL_DIRECTORY))? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(Logfile::parse_filename) {
            logfiles.push((id, entry.path()));
        }
    }
    logfiles.sort();

    for (_, path) in logfiles.into_iter().rev() {
        let data = std::fs::read(&path)?;
        let has_data = MarkerReader::new(&data, path.display().to_string())
            .ignore_errors(true)
            .filter_map(Result::ok)
            .any(|(_, marker)| marker.marker_type().is_data());
        if has_data {
            return Ok(path);
        }
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no logfile with data"))
}

/// Offsets and sizes of the valid markers of a logfile.
fn marker_spans(path: &Path) -> io::Result<Vec<(u64, usize)>> {
    let data = std::fs::read(path)?;
    Ok(MarkerReader::new(&data, path.display().to_string())
        .ignore_errors(true)
        .filter_map(Result::ok)
        .map(|(offset, marker)| (offset, marker.size()))
        .collect())
}

fn zero_range(path: &Path, offset: u64, len: usize) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()
}

/// Zeroes the last `bytes` bytes written to the newest data logfile, as
/// if the process died while they were in flight.
pub fn truncate_logfile_tail(root: &Path, bytes: u64) -> io::Result<()> {
    let path = newest_data_logfile(root)?;
    let end = marker_spans(&path)?
        .last()
        .map_or(0, |(offset, size)| offset + *size as u64);
    let start = end.saturating_sub(bytes);
    zero_range(&path, start, (end - start) as usize)
}

/// Zeroes the second half of the last marker of the newest data logfile.
pub fn tear_last_marker(root: &Path) -> io::Result<()> {
    let path = newest_data_logfile(root)?;
    let (offset, size) = marker_spans(&path)?
        .last()
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "logfile has no markers"))?;
    let half = size / 2;
    zero_range(&path, offset + half as u64, size - half)
}

/// Flips a byte inside the document marker for `key` in the newest data
/// logfile, breaking its checksum.
pub fn corrupt_logfile_byte(root: &Path, key: &str) -> io::Result<()> {
    let path = newest_data_logfile(root)?;
    let data = std::fs::read(&path)?;
    let offset = MarkerReader::new(&data, path.display().to_string())
        .filter_map(Result::ok)
        .find(|(_, marker)| {
            marker.marker_type() == MarkerType::Document
                && marker
                    .decode::<DocumentPayload>()
                    .is_ok_and(|doc| doc.key == key)
        })
        .map(|(offset, _)| offset)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "document marker not found"))?;

    let position = offset + MARKER_HEADER_SIZE as u64;
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(position))?;
    file.read_exact(&mut byte)?;
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(position))?;
    file.write_all(&byte)?;
    file.sync_all()
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            error: Some(error.to_string()),
        }
    }
}

type ScenarioResult = Result<(), String>;

fn check(condition: bool, message: &str) -> ScenarioResult {
    if condition {
        Ok(())
    } else {
        Err(message.to_string())
    }
}

/// Test harness for crash recovery scenarios.
#[derive(Debug, Default)]
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, description: &str, outcome: ScenarioResult) -> CrashRecoveryResult {
        let result = match outcome {
            Ok(()) => CrashRecoveryResult::pass(description),
            Err(error) => CrashRecoveryResult::fail(description, &error),
        };
        self.results.push(result.clone());
        result
    }

    /// Tests that committed documents survive a crash.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = scenarios::populated_engine(10);
            engine.crash_and_recover().map_err(|e| e.to_string())?;
            for i in 0..10 {
                check(
                    engine.get(&scenarios::numbered_key(i)) == Some(scenarios::numbered_body(i)),
                    "committed document lost",
                )?;
            }
            Ok(())
        })();
        self.record("Committed data survives crash", outcome)
    }

    /// Tests that an open transaction is discarded after a crash.
    pub fn test_uncommitted_data_discarded(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = scenarios::populated_engine(1);
            let mut trx = engine
                .begin_transaction(engine.database, &[engine.collection], TransactionHints::default())
                .map_err(|e| e.to_string())?;
            trx.add_operation(
                engine.collection,
                DocumentOperation::Insert {
                    key: "uncommitted".to_string(),
                    body: scenarios::numbered_body(99),
                },
            )
            .map_err(|e| e.to_string())?;
            engine.crash();
            drop(trx);

            let config = engine.config().clone();
            engine.recover(config).map_err(|e| e.to_string())?;
            check(engine.get(&scenarios::numbered_key(0)).is_some(), "committed document lost")?;
            check(engine.get("uncommitted").is_none(), "uncommitted document visible")
        })();
        self.record("Uncommitted data discarded", outcome)
    }

    /// Tests that an explicitly aborted transaction stays aborted.
    pub fn test_aborted_transaction_discarded(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = TestEngine::new();
            let mut trx = engine
                .begin_transaction(engine.database, &[engine.collection], TransactionHints::default())
                .map_err(|e| e.to_string())?;
            trx.add_operation(
                engine.collection,
                DocumentOperation::Insert {
                    key: "aborted".to_string(),
                    body: scenarios::numbered_body(1),
                },
            )
            .map_err(|e| e.to_string())?;
            trx.abort().map_err(|e| e.to_string())?;

            engine.crash_and_recover().map_err(|e| e.to_string())?;
            check(engine.get("aborted").is_none(), "aborted document visible")
        })();
        self.record("Aborted transaction discarded", outcome)
    }

    /// Tests that a torn last marker is treated as the end of the log.
    pub fn test_torn_tail_ignored(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = scenarios::populated_engine(2);
            engine.crash();
            tear_last_marker(engine.path()).map_err(|e| e.to_string())?;

            let config = engine.config().clone();
            engine.recover(config).map_err(|e| e.to_string())?;
            check(engine.get(&scenarios::numbered_key(0)).is_some(), "intact document lost")?;
            check(engine.get(&scenarios::numbered_key(1)).is_none(), "torn document visible")
        })();
        self.record("Torn tail ignored", outcome)
    }

    /// Tests that a corrupt marker fails recovery unless logfile errors are
    /// ignored, in which case the log ends at the damage.
    pub fn test_corrupt_marker_detected(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = scenarios::populated_engine(3);
            engine.crash();
            corrupt_logfile_byte(engine.path(), &scenarios::numbered_key(1))
                .map_err(|e| e.to_string())?;

            let config = engine.config().clone();
            check(
                engine.recover(config.clone()).is_err(),
                "corrupt logfile accepted",
            )?;
            engine
                .recover(config.ignore_logfile_errors(true))
                .map_err(|e| e.to_string())?;
            check(engine.get(&scenarios::numbered_key(0)).is_some(), "document before damage lost")?;
            check(
                engine.get(&scenarios::numbered_key(2)).is_none(),
                "document after damage visible",
            )
        })();
        self.record("Corrupt marker detected", outcome)
    }

    /// Tests that a remove survives a crash.
    pub fn test_remove_survives_crash(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let mut engine = scenarios::populated_engine(2);
            engine
                .remove(engine.database, engine.collection, &scenarios::numbered_key(0))
                .map_err(|e| e.to_string())?;
            engine.crash_and_recover().map_err(|e| e.to_string())?;
            check(engine.get(&scenarios::numbered_key(0)).is_none(), "removed document visible")?;
            check(engine.get(&scenarios::numbered_key(1)).is_some(), "kept document lost")
        })();
        self.record("Remove survives crash", outcome)
    }

    /// Runs all crash recovery tests.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        vec![
            self.test_committed_data_survives(),
            self.test_uncommitted_data_discarded(),
            self.test_aborted_transaction_discarded(),
            self.test_torn_tail_ignored(),
            self.test_corrupt_marker_detected(),
            self.test_remove_survives_crash(),
        ]
    }

    /// Returns a summary of all test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let mut summary = format!(
            "Crash Recovery Tests: {}/{} passed\n",
            passed,
            self.results.len()
        );
        for result in &self.results {
            let status = if result.passed { "✓" } else { "✗" };
            summary.push_str(&format!("  {} {}", status, result.description));
            if let Some(error) = &result.error {
                summary.push_str(&format!(" ({})", error));
            }
            summary.push('\n');
        }
        summary
    }

    /// Returns true if all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}
