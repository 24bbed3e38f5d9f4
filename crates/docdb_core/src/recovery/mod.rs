//! Crash recovery: replays the write-ahead log into the catalog.
//!
//! ## Passes
//!
//! 1. **Scan** reads every logfile that is not yet collected, in id order,
//!    without changing anything. It records the highest tick and revision,
//!    transactions without a terminal marker, aborted transactions and
//!    every dropped database, collection and view.
//! 2. **Replay** reads the logfiles again and applies structural markers to
//!    the catalog and document markers to the collections. Markers of
//!    failed transactions and of objects dropped later are skipped, as are
//!    document markers whose tick is already stored in the datafiles of
//!    their collection.
//!
//! Secondary indexes stay untouched during replay and are filled in bulk
//! afterwards. Open transactions get an abort marker once the log accepts
//! writes again.
//!
//! ## Errors
//!
//! A marker that cannot be applied is logged and counted. "Not found" is
//! expected (the object was dropped) and never counted. Once the count
//! exceeds `max_recovery_errors`, recovery fails with
//! [`CoreError::RecoveryFailed`] and the engine does not start. Unique
//! violations found while filling indexes count against the same budget.

mod state;

pub use state::{RecoverState, RecoveryPhase};

use crate::catalog::{DocumentLocation, DocumentPosition, IndexMode, WalReader};
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, LogfileId, Revision, TransactionId};
use crate::wal::{
    CollectionDefinition, DatabaseDefinition, DocumentPayload, DropIndexDefinition, IndexDefinition,
    Logfile, Marker, MarkerReader, MarkerType, MarkerView, RemovePayload, RenameDefinition,
    ViewDefinition,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type CollectionKey = (DatabaseId, CollectionId);

/// Drives recovery for one engine start.
#[derive(Debug)]
pub struct Recovery {
    context: Arc<Context>,
    state: RecoverState,
}

impl Recovery {
    /// Creates a recovery run with the error budget from the configuration.
    #[must_use]
    pub fn new(context: Arc<Context>) -> Self {
        let max_errors = context.config().max_recovery_errors;
        Self {
            context,
            state: RecoverState::new(max_errors),
        }
    }

    /// What recovery found and did so far.
    #[must_use]
    pub const fn state(&self) -> &RecoverState {
        &self.state
    }

    /// Open transactions that still need an abort marker.
    #[must_use]
    pub fn open_transactions(&self) -> Vec<TransactionId> {
        self.state.open_transactions.keys().copied().collect()
    }

    // === Pass 1 ===

    /// Scans all logfiles and seeds the tick and revision generators.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecoveryFailed`] if unreadable markers exceed
    /// the error budget, or an I/O error.
    pub fn scan(&mut self) -> CoreResult<()> {
        self.state.set_phase(RecoveryPhase::Scanning);
        let logfiles = self.context.manager().logfiles_for_recovery();
        for logfile in &logfiles {
            self.scan_logfile(logfile)?;
        }

        let manager = self.context.manager();
        self.context.ticks().observe(self.state.max_tick.as_u64());
        manager.set_last_tick(self.state.max_tick);

        let mut max_revision = self.state.max_revision;
        for collection in self.context.catalog().collections() {
            max_revision = max_revision.max(collection.revision().as_u64());
        }
        self.context.revisions().observe(max_revision);

        let failed = self.state.failed_transactions();
        if let Some(max) = failed.iter().map(|t| t.as_u64()).max() {
            self.context.ticks().observe(max);
        }
        self.context.transactions().register_failed_transactions(failed);

        info!(
            logfiles = logfiles.len(),
            markers = self.state.scanned,
            tick = %self.state.max_tick,
            open_transactions = self.state.open_transactions.len(),
            "recovery scan done"
        );
        Ok(())
    }

    fn scan_logfile(&mut self, logfile: &Logfile) -> CoreResult<()> {
        let data = logfile.read_used()?;
        let name = Logfile::filename(logfile.id());
        let reader =
            MarkerReader::new(&data, name).ignore_errors(self.context.config().ignore_logfile_errors);
        for item in reader {
            let marker = match item {
                Ok((_, marker)) => marker,
                Err(err) => {
                    self.state.count_errors(1, &err)?;
                    break;
                }
            };
            if let Err(err) = self.scan_marker(&marker) {
                self.state.count_errors(1, &err)?;
            }
        }
        Ok(())
    }

    fn scan_marker(&mut self, marker: &MarkerView<'_>) -> CoreResult<()> {
        self.state.scanned += 1;
        self.state.max_tick = self.state.max_tick.max(marker.tick());

        let transaction = marker.transaction_id();
        let database = marker.database_id();
        match marker.marker_type() {
            MarkerType::BeginTransaction => {
                self.state.open_transactions.insert(transaction, database);
            }
            MarkerType::CommitTransaction => {
                self.state.open_transactions.remove(&transaction);
            }
            MarkerType::AbortTransaction => {
                self.state.open_transactions.remove(&transaction);
                self.state.aborted_transactions.insert(transaction);
            }
            MarkerType::Document | MarkerType::Remove => {
                let payload: RemovePayload = marker.decode()?;
                self.state.max_revision = self.state.max_revision.max(payload.rev);
            }
            MarkerType::DropDatabase => {
                self.state.dropped_databases.insert(database);
            }
            MarkerType::DropCollection => {
                self.state
                    .dropped_collections
                    .insert((database, marker.collection_id()));
            }
            MarkerType::DropView => {
                self.state.dropped_views.insert((database, marker.collection_id()));
            }
            _ => {}
        }
        Ok(())
    }

    // === Pass 2 ===

    /// Replays all logfiles with secondary indexes disabled.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecoveryFailed`] once the error budget is
    /// exceeded.
    pub fn replay(&mut self) -> CoreResult<()> {
        self.state.set_phase(RecoveryPhase::Replaying);
        let logfiles = self.context.manager().logfiles_for_recovery();
        for logfile in &logfiles {
            self.replay_logfile(logfile)?;
        }
        info!(
            replayed = self.state.replayed,
            skipped = self.state.skipped,
            errors = self.state.errors,
            "recovery replay done"
        );
        Ok(())
    }

    fn replay_logfile(&mut self, logfile: &Logfile) -> CoreResult<()> {
        let data = logfile.read_used()?;
        let reader = MarkerReader::new(&data, Logfile::filename(logfile.id()))
            .ignore_errors(self.context.config().ignore_logfile_errors);

        let mut current: Option<CollectionKey> = None;
        for item in reader {
            let (offset, marker) = match item {
                Ok(item) => item,
                Err(err) => {
                    // already counted by the scan
                    debug!(logfile = %logfile.id(), error = %err, "replay stops at damaged marker");
                    break;
                }
            };
            match marker.marker_type() {
                MarkerType::Header | MarkerType::Footer => current = None,
                MarkerType::Prologue => {
                    current = Some((marker.database_id(), marker.collection_id()));
                }
                MarkerType::Blank => self.state.skipped += 1,
                marker_type => match self.replay_marker(logfile.id(), offset, &marker, current) {
                    Ok(true) => self.state.replayed += 1,
                    Ok(false) => self.state.skipped += 1,
                    Err(err) if err.is_not_found() => {
                        debug!(logfile = %logfile.id(), offset, marker = marker_type.name(), error = %err, "target is gone");
                        self.state.skipped += 1;
                    }
                    Err(err) => {
                        warn!(logfile = %logfile.id(), offset, marker = marker_type.name(), "cannot replay marker");
                        self.state.count_errors(1, &err)?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Applies one marker. Returns false if it was skipped.
    fn replay_marker(
        &self,
        logfile: LogfileId,
        offset: u64,
        marker: &MarkerView<'_>,
        current: Option<CollectionKey>,
    ) -> CoreResult<bool> {
        let marker_type = marker.marker_type();
        if marker_type.is_document_operation() {
            let Some((database, collection)) = current else {
                return Err(CoreError::corrupt_marker(
                    Logfile::filename(logfile),
                    offset,
                    "document marker without prologue",
                ));
            };
            return self.replay_document(logfile, offset, marker, database, collection);
        }
        if marker_type.is_structural() {
            return self.replay_structural(marker);
        }
        Ok(false)
    }

    fn replay_document(
        &self,
        logfile: LogfileId,
        offset: u64,
        marker: &MarkerView<'_>,
        database: DatabaseId,
        collection_id: CollectionId,
    ) -> CoreResult<bool> {
        if self.state.is_failed(marker.transaction_id()) {
            trace!(offset, transaction = %marker.transaction_id(), "skipping marker of failed transaction");
            return Ok(false);
        }
        if self.state.is_collection_dropped(database, collection_id) {
            return Ok(false);
        }
        let collection = self
            .context
            .catalog()
            .database(database)?
            .collection(collection_id)?;
        if marker.tick() <= collection.max_tick() {
            return Ok(false);
        }

        let mode = if self.state.phase().indexes_disabled() {
            IndexMode::Deferred
        } else {
            IndexMode::Maintain
        };
        collection.increase_uncollected(1);
        if marker.marker_type() == MarkerType::Remove {
            let payload: RemovePayload = marker.decode()?;
            collection.apply_remove(&payload.key, payload.rev, mode)?;
        } else {
            let payload: DocumentPayload = marker.decode()?;
            let position = DocumentPosition {
                revision: payload.rev,
                tick: marker.tick(),
                location: DocumentLocation::Wal { logfile, offset },
                size: marker.size() as u64,
            };
            collection.apply_document(&payload, position, mode)?;
        }
        Ok(true)
    }

    fn replay_structural(&self, marker: &MarkerView<'_>) -> CoreResult<bool> {
        let catalog = self.context.catalog();
        let database_id = marker.database_id();
        let id = marker.collection_id();

        match marker.marker_type() {
            MarkerType::CreateDatabase => {
                if self.state.dropped_databases.contains(&database_id) || catalog.database(database_id).is_ok() {
                    return Ok(false);
                }
                let definition: DatabaseDefinition = marker.decode()?;
                catalog.create_database(database_id, &definition)?;
            }
            MarkerType::DropDatabase => catalog.drop_database(database_id)?,
            MarkerType::CreateCollection => {
                if self.state.is_collection_dropped(database_id, id) {
                    return Ok(false);
                }
                let database = catalog.database(database_id)?;
                if database.collection(id).is_ok() {
                    return Ok(false);
                }
                let definition: CollectionDefinition = marker.decode()?;
                database.create_collection(id, &definition)?;
            }
            MarkerType::DropCollection => catalog.database(database_id)?.drop_collection(id)?,
            MarkerType::RenameCollection => {
                if self.state.is_collection_dropped(database_id, id) {
                    return Ok(false);
                }
                let definition: RenameDefinition = marker.decode()?;
                let database = catalog.database(database_id)?;
                if database.collection(id)?.name() == definition.name {
                    return Ok(false);
                }
                database.rename_collection(id, &definition.name)?;
            }
            MarkerType::ChangeCollection => {
                if self.state.is_collection_dropped(database_id, id) {
                    return Ok(false);
                }
                let definition: CollectionDefinition = marker.decode()?;
                catalog.database(database_id)?.change_collection(id, &definition)?;
            }
            MarkerType::CreateIndex => {
                if self.state.is_collection_dropped(database_id, id) {
                    return Ok(false);
                }
                let definition: IndexDefinition = marker.decode()?;
                let collection = catalog.database(database_id)?.collection(id)?;
                if collection.indexes().iter().any(|i| i.id == definition.id) {
                    return Ok(false);
                }
                collection.create_index(&definition, None)?;
            }
            MarkerType::DropIndex => {
                if self.state.is_collection_dropped(database_id, id) {
                    return Ok(false);
                }
                let definition: DropIndexDefinition = marker.decode()?;
                catalog
                    .database(database_id)?
                    .collection(id)?
                    .drop_index(definition.id)?;
            }
            MarkerType::CreateView => {
                if self.state.is_view_dropped(database_id, id) {
                    return Ok(false);
                }
                let database = catalog.database(database_id)?;
                if database.view(id).is_ok() {
                    return Ok(false);
                }
                let definition: ViewDefinition = marker.decode()?;
                database.create_view(id, &definition)?;
            }
            MarkerType::DropView => catalog.database(database_id)?.drop_view(id)?,
            MarkerType::ChangeView => {
                if self.state.is_view_dropped(database_id, id) {
                    return Ok(false);
                }
                let definition: ViewDefinition = marker.decode()?;
                catalog.database(database_id)?.change_view(id, &definition)?;
            }
            _ => return Ok(false),
        }
        debug!(marker = marker.marker_type().name(), database = %database_id, id = %id, "replayed structural marker");
        Ok(true)
    }

    // === Startup ===

    /// Writes an abort marker for every transaction the log left open.
    /// The logfile manager has to accept writes.
    ///
    /// # Errors
    ///
    /// Returns an error if a marker cannot be written.
    pub fn abort_open_transactions(&mut self) -> CoreResult<()> {
        let open = std::mem::take(&mut self.state.open_transactions);
        let count = open.len();
        for (transaction, database) in open {
            let marker = Marker::transaction(MarkerType::AbortTransaction, database, transaction)?;
            self.context
                .manager()
                .allocate_and_write(database, CollectionId::default(), &marker, true, true, false)?;
            self.state.aborted_transactions.insert(transaction);
            debug!(transaction = %transaction, "wrote abort marker for open transaction");
        }
        if count > 0 {
            info!(count, "aborted open transactions");
        }
        Ok(())
    }

    /// Rebuilds the secondary indexes of every collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RecoveryFailed`] if read failures and unique
    /// violations exceed the error budget.
    pub fn fill_indexes(&mut self) -> CoreResult<()> {
        self.state.set_phase(RecoveryPhase::FillingIndexes);
        let wal: &dyn WalReader = &**self.context.manager();
        for collection in self.context.catalog().collections() {
            match collection.fill_indexes(Some(wal)) {
                Ok(0) => {}
                Ok(violations) => {
                    let error = CoreError::invalid_operation(format!(
                        "{violations} unique constraint violations in {}",
                        collection.id()
                    ));
                    self.state.count_errors(violations, &error)?;
                }
                Err(err) => self.state.count_errors(1, &err)?,
            }
        }
        Ok(())
    }

    /// Records the outcome and leaves recovery.
    pub fn finish(&mut self) {
        self.state.set_phase(RecoveryPhase::Done);
        self.context
            .stats()
            .record_recovery(self.state.replayed, self.state.errors);
        info!(
            replayed = self.state.replayed,
            errors = self.state.errors,
            revision = %Revision::new(self.context.revisions().current()),
            "recovery finished"
        );
    }

    /// Runs both passes.
    ///
    /// # Errors
    ///
    /// Returns the first error that stops recovery.
    pub fn run(&mut self) -> CoreResult<()> {
        self.scan()?;
        self.replay()
    }
}
