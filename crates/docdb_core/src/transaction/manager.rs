//! Registry of running and failed transactions.

use crate::types::{DatabaseId, LogfileId, TickGenerator, TransactionId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Logfile bookkeeping of a running transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningTransaction {
    /// Database the transaction runs in.
    pub database_id: DatabaseId,
    /// Last collected logfile when the transaction started.
    pub last_collected: LogfileId,
    /// Last sealed logfile when the transaction started; `None` for
    /// read-only transactions, which never hold back collection.
    pub last_sealed: Option<LogfileId>,
}

/// Tracks transactions for the logfile manager and the collector.
///
/// ## Running Transactions
///
/// A running write transaction may still write markers into any logfile
/// newer than the last one sealed when it started, and may still reference
/// WAL positions of the logfiles collected after it started. The logfile
/// manager uses the minimum of both ids to decide which logfiles may be
/// collected or removed.
///
/// ## Failed Transactions
///
/// Aborted transactions stay in the failed set until the collector has
/// skipped all of their markers, i.e. until the logfile holding their
/// abort marker is collected.
#[derive(Debug)]
pub struct TransactionManager {
    /// Source of transaction ids.
    ids: Arc<TickGenerator>,
    /// Running transactions.
    running: RwLock<HashMap<TransactionId, RunningTransaction>>,
    /// Failed transactions whose markers may still be uncollected.
    failed: RwLock<HashSet<TransactionId>>,
}

impl TransactionManager {
    /// Creates a manager drawing ids from `ids`.
    pub fn new(ids: Arc<TickGenerator>) -> Self {
        Self {
            ids,
            running: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashSet::new()),
        }
    }

    /// Returns a fresh transaction id.
    pub fn next_id(&self) -> TransactionId {
        TransactionId::new(self.ids.next())
    }

    /// Registers a running transaction.
    pub fn register(&self, id: TransactionId, data: RunningTransaction) {
        self.running.write().insert(id, data);
    }

    /// Removes a running transaction.
    pub fn unregister(&self, id: TransactionId) {
        self.running.write().remove(&id);
    }

    /// Returns true if `id` is running.
    #[must_use]
    pub fn is_running(&self, id: TransactionId) -> bool {
        self.running.read().contains_key(&id)
    }

    /// Number of running transactions.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.read().len()
    }

    /// Smallest last-collected id over all running transactions.
    #[must_use]
    pub fn min_last_collected(&self) -> Option<LogfileId> {
        self.running.read().values().map(|t| t.last_collected).min()
    }

    /// Smallest last-sealed id over all running write transactions.
    #[must_use]
    pub fn min_last_sealed(&self) -> Option<LogfileId> {
        self.running
            .read()
            .values()
            .filter_map(|t| t.last_sealed)
            .min()
    }

    /// Marks a transaction as failed.
    pub fn register_failed(&self, id: TransactionId) {
        self.failed.write().insert(id);
    }

    /// Marks several transactions as failed.
    pub fn register_failed_transactions(&self, ids: impl IntoIterator<Item = TransactionId>) {
        self.failed.write().extend(ids);
    }

    /// Forgets failed transactions whose markers were all collected.
    pub fn unregister_failed_transactions(&self, ids: &HashSet<TransactionId>) {
        if ids.is_empty() {
            return;
        }
        self.failed.write().retain(|id| !ids.contains(id));
    }

    /// Returns true if `id` failed.
    #[must_use]
    pub fn is_failed(&self, id: TransactionId) -> bool {
        self.failed.read().contains(&id)
    }

    /// Snapshot of the failed set.
    #[must_use]
    pub fn failed_transactions(&self) -> HashSet<TransactionId> {
        self.failed.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(Arc::new(TickGenerator::new(100)))
    }

    #[test]
    fn ids_are_monotonic() {
        let tm = manager();
        let a = tm.next_id();
        let b = tm.next_id();
        assert!(b > a);
        assert_eq!(a, TransactionId::new(101));
    }

    #[test]
    fn min_ids_ignore_read_only_transactions() {
        let tm = manager();
        assert_eq!(tm.min_last_sealed(), None);
        assert_eq!(tm.min_last_collected(), None);

        tm.register(
            TransactionId::new(1),
            RunningTransaction {
                database_id: DatabaseId::new(1),
                last_collected: LogfileId::new(4),
                last_sealed: None,
            },
        );
        tm.register(
            TransactionId::new(2),
            RunningTransaction {
                database_id: DatabaseId::new(1),
                last_collected: LogfileId::new(6),
                last_sealed: Some(LogfileId::new(9)),
            },
        );

        assert_eq!(tm.min_last_collected(), Some(LogfileId::new(4)));
        assert_eq!(tm.min_last_sealed(), Some(LogfileId::new(9)));
        assert_eq!(tm.running_count(), 2);

        tm.unregister(TransactionId::new(2));
        assert_eq!(tm.min_last_sealed(), None);
        assert!(!tm.is_running(TransactionId::new(2)));
    }

    #[test]
    fn failed_set() {
        let tm = manager();
        tm.register_failed(TransactionId::new(3));
        tm.register_failed_transactions([TransactionId::new(4), TransactionId::new(5)]);
        assert!(tm.is_failed(TransactionId::new(4)));

        let done: HashSet<_> = [TransactionId::new(3), TransactionId::new(4)].into();
        tm.unregister_failed_transactions(&done);
        assert_eq!(
            tm.failed_transactions(),
            [TransactionId::new(5)].into_iter().collect()
        );
    }
}
