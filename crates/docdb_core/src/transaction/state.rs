//! Write transactions over one database.

use crate::catalog::{Collection, Database, DocumentLocation, DocumentPosition, IndexMode, LockOwner, Undo, WriteKind};
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, Revision, Tick, TransactionId};
use crate::wal::{DocumentPayload, Marker, MarkerType, RemovePayload, WrittenMarker};
use ciborium::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Constructed, locks not yet taken.
    Created,
    /// Accepting operations.
    Running,
    /// Commit marker written, changes kept.
    Committed,
    /// Changes reverted.
    Aborted,
}

/// Options fixed at `begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionHints {
    /// Exactly one operation follows; no begin or commit marker is written.
    pub single_operation: bool,
    /// Commit waits until its markers are durable.
    pub wait_for_sync: bool,
    /// No operations follow; no locks are taken and collection is not held back.
    pub read_only: bool,
}

/// A document write.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    /// Insert a new document; the key must not exist.
    Insert {
        /// Document key.
        key: String,
        /// Document body.
        body: Value,
    },
    /// Replace an existing document.
    Replace {
        /// Document key.
        key: String,
        /// Document body.
        body: Value,
    },
    /// Insert or replace.
    Upsert {
        /// Document key.
        key: String,
        /// Document body.
        body: Value,
    },
    /// Remove an existing document.
    Remove {
        /// Document key.
        key: String,
    },
}

impl DocumentOperation {
    /// Key of the written document.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. }
            | Self::Replace { key, .. }
            | Self::Upsert { key, .. }
            | Self::Remove { key } => key,
        }
    }

    fn body(&self) -> Option<&Value> {
        match self {
            Self::Insert { body, .. } | Self::Replace { body, .. } | Self::Upsert { body, .. } => Some(body),
            Self::Remove { .. } => None,
        }
    }

    fn kind(&self) -> WriteKind {
        match self {
            Self::Insert { .. } => WriteKind::Insert,
            Self::Replace { .. } => WriteKind::Replace,
            Self::Upsert { .. } => WriteKind::Upsert,
            Self::Remove { .. } => WriteKind::Remove,
        }
    }
}

struct AppliedOperation {
    collection: Arc<Collection>,
    undo: Undo,
}

/// A transaction holding exclusive locks on the collections it writes.
///
/// Every operation is written to the log and applied right away, but
/// readers keep seeing the committed versions until commit. Abort reverts
/// the operations newest first. Dropping a running transaction aborts it.
///
/// # Example
///
/// ```rust,ignore
/// let mut trx = engine.begin_transaction(db, &[users], TransactionHints::default())?;
/// trx.add_operation(users, DocumentOperation::Insert { key: "alice".into(), body })?;
/// trx.commit()?;
/// ```
pub struct Transaction {
    context: Arc<Context>,
    id: TransactionId,
    database: Arc<Database>,
    hints: TransactionHints,
    status: TransactionStatus,
    collections: Vec<Arc<Collection>>,
    applied: Vec<AppliedOperation>,
    revisions: HashMap<CollectionId, Revision>,
    begin_written: bool,
    markers_written: bool,
    last_tick: Tick,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("database", &self.database.id())
            .field("status", &self.status)
            .field("operations", &self.applied.len())
            .finish()
    }
}

impl Transaction {
    /// Starts a transaction on `collections` of `database`.
    ///
    /// Write transactions first wait out write throttling, then lock their
    /// collections in id order.
    ///
    /// # Errors
    ///
    /// - [`CoreError::WriteThrottleTimeout`] if throttling does not end in time
    /// - [`CoreError::DatabaseNotFound`] / [`CoreError::CollectionNotFound`]
    /// - [`CoreError::LockTimeout`] if a collection stays locked
    pub fn begin(
        context: Arc<Context>,
        database: crate::types::DatabaseId,
        collections: &[CollectionId],
        hints: TransactionHints,
    ) -> CoreResult<Self> {
        if !hints.read_only {
            context.manager().wait_for_throttle(context.config().throttle_wait)?;
        }
        let database = context.catalog().database(database)?;

        let mut ids = collections.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let collections = ids
            .into_iter()
            .map(|id| database.collection(id))
            .collect::<CoreResult<Vec<_>>>()?;

        let mut trx = Self {
            id: context.transactions().next_id(),
            context,
            database,
            hints,
            status: TransactionStatus::Created,
            collections: Vec::new(),
            applied: Vec::new(),
            revisions: HashMap::new(),
            begin_written: false,
            markers_written: false,
            last_tick: Tick::default(),
        };

        if !hints.read_only {
            let owner = LockOwner::Transaction(trx.id);
            let timeout = trx.context.config().lock_timeout;
            for collection in collections {
                if let Err(err) = collection.lock(owner, timeout) {
                    trx.release_locks();
                    trx.status = TransactionStatus::Aborted;
                    debug!(transaction = %trx.id, collection = %collection.id(), "lock acquisition failed");
                    return Err(err);
                }
                trx.collections.push(collection);
            }
        }

        trx.context
            .manager()
            .register_transaction(trx.id, trx.database.id(), hints.read_only);
        trx.context.stats().record_transaction_start();
        trx.status = TransactionStatus::Running;
        trace!(transaction = %trx.id, database = %trx.database.id(), "transaction started");
        Ok(trx)
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Hints the transaction was started with.
    #[must_use]
    pub fn hints(&self) -> TransactionHints {
        self.hints
    }

    /// Number of applied operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.applied.len()
    }

    /// Tick of the last marker written.
    #[must_use]
    pub fn last_tick(&self) -> Tick {
        self.last_tick
    }

    fn ensure_running(&self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Running => Ok(()),
            status => Err(CoreError::invalid_operation(format!(
                "transaction {} is {status:?}",
                self.id
            ))),
        }
    }

    fn write(&mut self, collection_id: CollectionId, marker: &Marker, wait: bool) -> CoreResult<WrittenMarker> {
        let written = self.context.manager().allocate_and_write(
            self.database.id(),
            collection_id,
            marker,
            wait,
            wait,
            wait,
        )?;
        self.markers_written = true;
        self.last_tick = written.tick;
        Ok(written)
    }

    fn write_transaction_marker(&mut self, marker_type: MarkerType, wait: bool) -> CoreResult<WrittenMarker> {
        let marker = Marker::transaction(marker_type, self.database.id(), self.id)?;
        self.write(CollectionId::default(), &marker, wait)
    }

    /// Writes one document operation and applies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is not part of the transaction,
    /// the operation violates a constraint, or the marker cannot be
    /// written. A failed operation leaves earlier operations in place; the
    /// caller decides whether to abort.
    pub fn add_operation(&mut self, collection_id: CollectionId, operation: DocumentOperation) -> CoreResult<Tick> {
        self.ensure_running()?;
        if self.hints.read_only {
            return Err(CoreError::invalid_operation("read-only transaction cannot write"));
        }
        if self.hints.single_operation && !self.applied.is_empty() {
            return Err(CoreError::invalid_operation("single-operation transaction already has its operation"));
        }
        let collection = self
            .collections
            .iter()
            .find(|c| c.id() == collection_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("{collection_id} is not part of transaction {}", self.id))
            })?;

        collection.check_write(operation.key(), operation.body(), operation.kind())?;

        if !self.hints.single_operation && !self.begin_written {
            self.write_transaction_marker(MarkerType::BeginTransaction, false)?;
            self.begin_written = true;
        }

        let revision = self.context.revisions().next();
        let marker = match &operation {
            DocumentOperation::Remove { key } => Marker::remove(
                self.id,
                &RemovePayload {
                    key: key.clone(),
                    rev: revision,
                },
            )?,
            _ => Marker::document(
                self.id,
                &DocumentPayload {
                    key: operation.key().to_string(),
                    rev: revision,
                    body: operation.body().cloned().unwrap_or(Value::Null),
                },
            )?,
        };

        let wait = self.hints.single_operation && (self.hints.wait_for_sync || collection.wait_for_sync());
        let written = self.write(collection_id, &marker, wait)?;
        collection.increase_uncollected(1);
        self.revisions
            .entry(collection_id)
            .or_insert_with(|| collection.revision());

        let position = DocumentPosition {
            revision,
            tick: written.tick,
            location: DocumentLocation::Wal {
                logfile: written.logfile_id,
                offset: written.offset,
            },
            size: written.size,
        };
        collection.remember_committed(operation.key());
        let undo = match operation {
            DocumentOperation::Remove { key } => collection.apply_remove(&key, revision, IndexMode::Maintain),
            DocumentOperation::Insert { key, body }
            | DocumentOperation::Replace { key, body }
            | DocumentOperation::Upsert { key, body } => {
                collection.apply_document(&DocumentPayload { key, rev: revision, body }, position, IndexMode::Maintain)
            }
        };
        let undo = match undo {
            Ok(undo) => undo,
            Err(err) => {
                // The marker is in the log; only an abort marker keeps recovery from replaying it
                collection.decrease_uncollected(1);
                return Err(err);
            }
        };

        trace!(transaction = %self.id, collection = %collection_id, key = undo.key(), tick = %written.tick, "operation applied");
        self.applied.push(AppliedOperation { collection, undo });
        Ok(written.tick)
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// If the commit marker cannot be written the transaction is aborted
    /// and the error returned.
    pub fn commit(mut self) -> CoreResult<Tick> {
        self.ensure_running()?;

        if self.begin_written {
            let wait = self.hints.wait_for_sync || self.collections.iter().any(|c| c.wait_for_sync());
            if let Err(err) = self.write_transaction_marker(MarkerType::CommitTransaction, wait) {
                warn!(transaction = %self.id, error = %err, "commit marker failed, aborting");
                self.rollback();
                return Err(err);
            }
        }

        self.status = TransactionStatus::Committed;
        self.applied.clear();
        for collection in &self.collections {
            collection.clear_uncommitted();
        }
        self.release_locks();
        self.context.manager().unregister_transaction(self.id, false);
        self.context.stats().record_transaction_commit();
        trace!(transaction = %self.id, tick = %self.last_tick, "transaction committed");
        Ok(self.last_tick)
    }

    /// Aborts the transaction, reverting all operations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction already
    /// finished.
    pub fn abort(mut self) -> CoreResult<()> {
        self.ensure_running()?;
        self.rollback();
        Ok(())
    }

    fn rollback(&mut self) {
        if self.markers_written {
            if let Err(err) = self.write_transaction_marker(MarkerType::AbortTransaction, false) {
                warn!(transaction = %self.id, error = %err, "cannot write abort marker");
            }
        }

        while let Some(AppliedOperation { collection, undo }) = self.applied.pop() {
            collection.revert(undo);
            collection.decrease_uncollected(1);
        }
        for collection in &self.collections {
            collection.clear_uncommitted();
            if let Some(revision) = self.revisions.get(&collection.id()) {
                collection.set_revision(*revision);
            }
        }

        self.status = TransactionStatus::Aborted;
        self.release_locks();
        self.context
            .manager()
            .unregister_transaction(self.id, self.markers_written);
        self.context.stats().record_transaction_abort();
        debug!(transaction = %self.id, "transaction aborted");
    }

    fn release_locks(&mut self) {
        let owner = LockOwner::Transaction(self.id);
        for collection in self.collections.drain(..) {
            collection.unlock(owner);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TransactionStatus::Running {
            self.rollback();
        }
    }
}
