//! Bookkeeping shared by both recovery passes.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, Tick, TransactionId};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::warn;

/// Where recovery currently is.
///
/// Secondary indexes are maintained only once the phase reaches
/// [`RecoveryPhase::FillingIndexes`]; replay writes with deferred indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryPhase {
    /// Pass 1: reading the logfiles without changing anything.
    Scanning,
    /// Pass 2: applying markers to the catalog.
    Replaying,
    /// Rebuilding secondary indexes in bulk.
    FillingIndexes,
    /// Recovery completed.
    Done,
}

impl RecoveryPhase {
    /// Returns true while replay runs with secondary indexes disabled.
    #[must_use]
    pub const fn indexes_disabled(self) -> bool {
        matches!(self, Self::Scanning | Self::Replaying)
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scanning => "scanning",
            Self::Replaying => "replaying",
            Self::FillingIndexes => "filling indexes",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// What the scan found and what replay did.
#[derive(Debug)]
pub struct RecoverState {
    phase: RecoveryPhase,
    max_errors: u64,
    /// Highest tick in any logfile.
    pub max_tick: Tick,
    /// Highest document revision in any logfile.
    pub max_revision: u64,
    /// Transactions with a begin marker but neither commit nor abort.
    pub open_transactions: BTreeMap<TransactionId, DatabaseId>,
    /// Transactions with an abort marker.
    pub aborted_transactions: HashSet<TransactionId>,
    /// Databases dropped somewhere in the logfiles.
    pub dropped_databases: HashSet<DatabaseId>,
    /// Collections dropped somewhere in the logfiles.
    pub dropped_collections: HashSet<(DatabaseId, CollectionId)>,
    /// Views dropped somewhere in the logfiles.
    pub dropped_views: HashSet<(DatabaseId, CollectionId)>,
    /// Markers scanned in pass 1.
    pub scanned: u64,
    /// Markers applied in pass 2.
    pub replayed: u64,
    /// Markers skipped in pass 2.
    pub skipped: u64,
    /// Errors counted against the budget.
    pub errors: u64,
}

impl RecoverState {
    /// Creates an empty state that tolerates up to `max_errors` errors.
    #[must_use]
    pub fn new(max_errors: u64) -> Self {
        Self {
            phase: RecoveryPhase::Scanning,
            max_errors,
            max_tick: Tick::default(),
            max_revision: 0,
            open_transactions: BTreeMap::new(),
            aborted_transactions: HashSet::new(),
            dropped_databases: HashSet::new(),
            dropped_collections: HashSet::new(),
            dropped_views: HashSet::new(),
            scanned: 0,
            replayed: 0,
            skipped: 0,
            errors: 0,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: RecoveryPhase) {
        self.phase = phase;
    }

    /// Transactions whose markers must not be replayed or collected.
    #[must_use]
    pub fn failed_transactions(&self) -> HashSet<TransactionId> {
        self.aborted_transactions
            .iter()
            .copied()
            .chain(self.open_transactions.keys().copied())
            .collect()
    }

    /// Returns true if markers of `transaction` are skipped.
    #[must_use]
    pub fn is_failed(&self, transaction: TransactionId) -> bool {
        self.aborted_transactions.contains(&transaction)
            || self.open_transactions.contains_key(&transaction)
    }

    /// Returns true if the collection or its database is dropped later.
    #[must_use]
    pub fn is_collection_dropped(&self, database: DatabaseId, collection: CollectionId) -> bool {
        self.dropped_databases.contains(&database)
            || self.dropped_collections.contains(&(database, collection))
    }

    /// Returns true if the view or its database is dropped later.
    #[must_use]
    pub fn is_view_dropped(&self, database: DatabaseId, view: CollectionId) -> bool {
        self.dropped_databases.contains(&database) || self.dropped_views.contains(&(database, view))
    }

    /// Counts `count` errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecoveryFailed`] once the budget is exceeded.
    pub fn count_errors(&mut self, count: u64, error: &CoreError) -> CoreResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.errors = self.errors.saturating_add(count);
        warn!(phase = %self.phase, errors = self.errors, error = %error, "recovery error");
        if self.errors > self.max_errors {
            return Err(CoreError::RecoveryFailed {
                errors: self.errors,
                message: error.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_transactions_include_open_and_aborted() {
        let mut state = RecoverState::new(0);
        state.open_transactions.insert(TransactionId::new(3), DatabaseId::new(1));
        state.aborted_transactions.insert(TransactionId::new(4));

        let failed = state.failed_transactions();
        assert_eq!(failed.len(), 2);
        assert!(state.is_failed(TransactionId::new(3)));
        assert!(state.is_failed(TransactionId::new(4)));
        assert!(!state.is_failed(TransactionId::new(5)));
    }

    #[test]
    fn dropped_database_covers_its_objects() {
        let mut state = RecoverState::new(0);
        state.dropped_databases.insert(DatabaseId::new(1));
        state.dropped_views.insert((DatabaseId::new(2), CollectionId::new(7)));

        assert!(state.is_collection_dropped(DatabaseId::new(1), CollectionId::new(9)));
        assert!(state.is_view_dropped(DatabaseId::new(1), CollectionId::new(9)));
        assert!(state.is_view_dropped(DatabaseId::new(2), CollectionId::new(7)));
        assert!(!state.is_collection_dropped(DatabaseId::new(2), CollectionId::new(7)));
    }

    #[test]
    fn error_budget() {
        let error = CoreError::internal("boom");
        let mut state = RecoverState::new(2);
        state.count_errors(0, &error).unwrap();
        state.count_errors(2, &error).unwrap();
        let err = state.count_errors(1, &error).unwrap_err();
        assert!(matches!(err, CoreError::RecoveryFailed { errors: 3, .. }));
    }

    #[test]
    fn indexes_are_disabled_until_filling() {
        assert!(RecoveryPhase::Scanning.indexes_disabled());
        assert!(RecoveryPhase::Replaying.indexes_disabled());
        assert!(!RecoveryPhase::FillingIndexes.indexes_disabled());
        assert!(RecoveryPhase::Replaying < RecoveryPhase::Done);
    }
}
