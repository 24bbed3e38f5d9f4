//! Engine statistics and telemetry.
//!
//! Provides counters for monitoring the write-ahead log, the collector and
//! transactions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use docdb_core::StorageEngine;
//!
//! let engine = StorageEngine::open(path, Config::default())?;
//!
//! // Perform operations...
//!
//! let stats = engine.stats().snapshot();
//! println!("Markers: {}", stats.markers_written);
//! println!("Syncs: {}", stats.syncs);
//! println!("Collected logfiles: {}", stats.logfiles_collected);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine statistics.
///
/// All counters are atomic and can be read while operations are in progress.
/// Values are monotonically increasing.
#[derive(Debug, Default)]
pub struct EngineStats {
    // WAL counters
    /// Markers written through the slot allocator.
    markers_written: AtomicU64,
    /// Bytes written through the slot allocator.
    bytes_written: AtomicU64,
    /// Sync regions made durable.
    syncs: AtomicU64,
    /// Logfiles created.
    logfiles_created: AtomicU64,
    /// Logfiles deleted.
    logfiles_removed: AtomicU64,
    /// Times write throttling was switched on.
    throttle_activations: AtomicU64,

    // Collector counters
    /// Logfiles fully collected.
    logfiles_collected: AtomicU64,
    /// Markers transferred into datafiles.
    markers_transferred: AtomicU64,
    /// Failed collection attempts.
    collector_errors: AtomicU64,

    // Transaction counters
    /// Total number of transactions started.
    transactions_started: AtomicU64,
    /// Total number of transactions committed.
    transactions_committed: AtomicU64,
    /// Total number of transactions aborted.
    transactions_aborted: AtomicU64,

    // Recovery counters
    /// Markers applied during recovery.
    recovery_markers_replayed: AtomicU64,
    /// Per-marker recovery errors.
    recovery_errors: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_marker(&self, bytes: u64) {
        self.markers_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_logfile_created(&self) {
        self.logfiles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_logfile_removed(&self) {
        self.logfiles_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttle_activation(&self) {
        self.throttle_activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_logfile_collected(&self, markers: u64) {
        self.logfiles_collected.fetch_add(1, Ordering::Relaxed);
        self.markers_transferred.fetch_add(markers, Ordering::Relaxed);
    }

    pub(crate) fn record_collector_error(&self) {
        self.collector_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self, replayed: u64, errors: u64) {
        self.recovery_markers_replayed
            .fetch_add(replayed, Ordering::Relaxed);
        self.recovery_errors.fetch_add(errors, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of markers written.
    pub fn markers_written(&self) -> u64 {
        self.markers_written.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns the number of synced regions.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Returns the number of logfiles collected.
    pub fn logfiles_collected(&self) -> u64 {
        self.logfiles_collected.load(Ordering::Relaxed)
    }

    /// Returns the number of failed collection attempts.
    ///
    /// A growing value with a stable `logfiles_collected` means the
    /// collector keeps retrying the same logfile.
    pub fn collector_errors(&self) -> u64 {
        self.collector_errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            markers_written: self.markers_written(),
            bytes_written: self.bytes_written(),
            syncs: self.syncs(),
            logfiles_created: self.logfiles_created.load(Ordering::Relaxed),
            logfiles_removed: self.logfiles_removed.load(Ordering::Relaxed),
            throttle_activations: self.throttle_activations.load(Ordering::Relaxed),
            logfiles_collected: self.logfiles_collected(),
            markers_transferred: self.markers_transferred.load(Ordering::Relaxed),
            collector_errors: self.collector_errors(),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            recovery_markers_replayed: self.recovery_markers_replayed.load(Ordering::Relaxed),
            recovery_errors: self.recovery_errors.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of engine statistics.
///
/// Unlike `EngineStats`, this is a simple struct that can be serialized,
/// compared, or passed across threads without atomics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Markers written.
    pub markers_written: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Synced regions.
    pub syncs: u64,
    /// Logfiles created.
    pub logfiles_created: u64,
    /// Logfiles deleted.
    pub logfiles_removed: u64,
    /// Throttling activations.
    pub throttle_activations: u64,
    /// Logfiles collected.
    pub logfiles_collected: u64,
    /// Markers transferred into datafiles.
    pub markers_transferred: u64,
    /// Failed collection attempts.
    pub collector_errors: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Markers applied during recovery.
    pub recovery_markers_replayed: u64,
    /// Per-marker recovery errors.
    pub recovery_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.markers_written(), 0);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = EngineStats::new();

        stats.record_marker(100);
        stats.record_marker(50);
        stats.record_logfile_collected(7);
        stats.record_transaction_start();
        stats.record_transaction_abort();

        let snap = stats.snapshot();
        assert_eq!(snap.markers_written, 2);
        assert_eq!(snap.bytes_written, 150);
        assert_eq!(snap.logfiles_collected, 1);
        assert_eq!(snap.markers_transferred, 7);
        assert_eq!(snap.transactions_started, 1);
        assert_eq!(snap.transactions_aborted, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_marker(1);
                    s.record_sync();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.markers_written(), 1000);
        assert_eq!(stats.syncs(), 1000);
    }
}
