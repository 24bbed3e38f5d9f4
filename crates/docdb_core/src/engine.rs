//! Storage engine facade: startup, recovery, shutdown and the public API.

use crate::catalog::{Catalog, Collection, Database};
use crate::collector::Collector;
use crate::config::Config;
use crate::context::Context;
use crate::dir::EngineDir;
use crate::error::{CoreError, CoreResult};
use crate::recovery::Recovery;
use crate::stats::StatsSnapshot;
use crate::transaction::{DocumentOperation, Transaction, TransactionHints};
use crate::types::{CollectionId, DatabaseId, IndexId, Tick};
use crate::wal::{
    CollectionDefinition, DatabaseDefinition, DocumentPayload, DropIndexDefinition, FlushOutcome,
    IndexDefinition, LogfileManager, Marker, MarkerType, RenameDefinition, ShutdownInfo,
    ViewDefinition, WrittenMarker,
};
use ciborium::Value;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle of a [`StorageEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Directory locked, logfiles scanned.
    Initialized,
    /// Logfiles replayed.
    Recovered,
    /// Background threads running, writes accepted.
    Running,
    /// Stopped.
    ShutDown,
}

/// The storage engine.
///
/// # Opening
///
/// [`StorageEngine::open`] runs all startup steps. They can also be run
/// one by one:
///
/// ```rust,ignore
/// let engine = StorageEngine::init(path, Config::default())?;
/// engine.run_recovery()?;
/// engine.run()?;
/// ```
///
/// # Writing
///
/// ```rust,ignore
/// let db = engine.create_database("main")?;
/// let users = engine.create_collection(db, &CollectionDefinition {
///     name: "users".into(),
///     wait_for_sync: false,
///     journal_size: 0,
/// })?;
/// engine.insert(db, users, "alice", Value::Text("hello".into()))?;
/// ```
///
/// Dropping the engine shuts it down.
pub struct StorageEngine {
    context: Arc<Context>,
    collector: Arc<Collector>,
    recovery: Mutex<Option<Recovery>>,
    state: Mutex<EngineState>,
    // Last field: the lock is released after everything else is gone
    dir: EngineDir,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("root", &self.dir.path())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Opens the engine and runs recovery and all startup steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory is
    /// locked, or recovery fails.
    pub fn open(root: &Path, config: Config) -> CoreResult<Self> {
        let engine = Self::init(root, config)?;
        engine.run_recovery()?;
        engine.run()?;
        Ok(engine)
    }

    /// Locks the root directory, opens the catalog, takes inventory of the
    /// logfiles and scans them.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidConfig`] if the configuration is rejected
    /// - [`CoreError::DirectoryLocked`] if another process has the engine
    /// - [`CoreError::IllegalParameterFile`] if the `SHUTDOWN` file or a
    ///   parameter file is unreadable
    /// - [`CoreError::RecoveryFailed`] if the scan exceeds the error budget
    pub fn init(root: &Path, config: Config) -> CoreResult<Self> {
        config.validate()?;
        let dir = EngineDir::open(root, config.create_if_missing)?;
        let context = Arc::new(Context::new(root, config)?);

        let manager = context.manager();
        match ShutdownInfo::read(manager.directory())? {
            Some(info) => {
                if info.shutdown_time.is_none() {
                    warn!("previous run did not shut down cleanly");
                }
                manager.apply_shutdown_info(&info);
            }
            None => info!(root = ?root, "no shutdown file, starting fresh"),
        }
        manager.inventory()?;

        let mut recovery = Recovery::new(Arc::clone(&context));
        recovery.scan()?;

        Ok(Self {
            collector: Arc::new(Collector::new(Arc::clone(&context))),
            context,
            recovery: Mutex::new(Some(recovery)),
            state: Mutex::new(EngineState::Initialized),
            dir,
        })
    }

    /// Replays the logfiles.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] unless the engine was just
    /// initialized, or [`CoreError::RecoveryFailed`].
    pub fn run_recovery(&self) -> CoreResult<()> {
        self.expect_state(EngineState::Initialized)?;
        let mut recovery = self.recovery.lock();
        recovery
            .as_mut()
            .ok_or_else(|| CoreError::internal("recovery state missing"))?
            .replay()?;
        *self.state.lock() = EngineState::Recovered;
        Ok(())
    }

    /// Finishes startup and starts the background threads.
    ///
    /// Open logfiles are sealed, open transactions get abort markers,
    /// empty logfiles are removed and secondary indexes are rebuilt before
    /// the collector and the remover start.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] unless recovery ran, or the
    /// error of the failing step.
    pub fn run(&self) -> CoreResult<()> {
        self.expect_state(EngineState::Recovered)?;
        let mut recovery = self
            .recovery
            .lock()
            .take()
            .ok_or_else(|| CoreError::internal("recovery state missing"))?;
        let manager = self.context.manager();

        manager.seal_open_logfiles();
        manager.start_threads()?;
        manager.set_allow_writes(true);
        recovery.abort_open_transactions()?;
        manager.remove_empty_logfiles();
        recovery.fill_indexes()?;
        manager.write_shutdown_info(false)?;
        manager.set_in_recovery(false);
        recovery.finish();

        self.collector.start()?;
        manager.start_remover()?;
        *self.state.lock() = EngineState::Running;
        info!(root = ?self.dir.path(), "storage engine running");
        Ok(())
    }

    /// Shuts down: stops writes, flushes, lets the collector drain and
    /// writes the `SHUTDOWN` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SHUTDOWN` file cannot be written.
    pub fn shutdown(&self) -> CoreResult<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), EngineState::ShutDown);
        if previous != EngineState::Running {
            return Ok(());
        }
        let manager = self.context.manager();
        manager.begin_shutdown();
        manager.stop_remover();
        self.collector.stop();
        manager.finish_shutdown()?;
        info!(root = ?self.dir.path(), "storage engine shut down");
        Ok(())
    }

    /// Stops the engine the way a killed process would: the open logfile
    /// stays unsealed and the `SHUTDOWN` file is not rewritten.
    pub fn kill(self) {
        *self.state.lock() = EngineState::ShutDown;
        self.collector.halt();
        self.context.manager().halt();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn expect_state(&self, expected: EngineState) -> CoreResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "engine is {state:?}, expected {expected:?}"
            )))
        }
    }

    fn ensure_running(&self) -> CoreResult<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::ShutDown => Err(CoreError::ShuttingDown),
            state => Err(CoreError::invalid_operation(format!("engine is {state:?}"))),
        }
    }

    // === Accessors ===

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Shared engine state.
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.context.config()
    }

    /// Databases and collections.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        self.context.catalog()
    }

    /// The logfile manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<LogfileManager> {
        self.context.manager()
    }

    /// The collector.
    #[must_use]
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats().snapshot()
    }

    // === Log ===

    /// Writes a marker into the log.
    ///
    /// # Errors
    ///
    /// See [`LogfileManager::allocate_and_write`].
    pub fn allocate_and_write(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        marker: &Marker,
        wake_sync: bool,
        want_sync: bool,
        wait_until_synced: bool,
    ) -> CoreResult<WrittenMarker> {
        self.context.manager().allocate_and_write(
            database_id,
            collection_id,
            marker,
            wake_sync,
            want_sync,
            wait_until_synced,
        )
    }

    /// Seals the current logfile.
    ///
    /// # Errors
    ///
    /// See [`LogfileManager::flush`].
    pub fn flush(
        &self,
        wait_for_sync: bool,
        wait_for_collector: bool,
        write_shutdown_file: bool,
    ) -> CoreResult<FlushOutcome> {
        self.context
            .manager()
            .flush(wait_for_sync, wait_for_collector, write_shutdown_file)
    }

    /// Waits until `tick` is durable. Returns false on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] if the engine stops meanwhile.
    pub fn wait_for_tick(&self, tick: Tick, timeout: Duration) -> CoreResult<bool> {
        self.context.manager().wait_for_tick(tick, timeout)
    }

    fn write_structural(&self, database_id: DatabaseId, marker: &Marker) -> CoreResult<Tick> {
        let written = self.context.manager().allocate_and_write(
            database_id,
            CollectionId::default(),
            marker,
            true,
            true,
            true,
        )?;
        Ok(written.tick)
    }

    // === Databases ===

    /// Creates a database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn create_database(&self, name: &str) -> CoreResult<DatabaseId> {
        self.ensure_running()?;
        let id = DatabaseId::new(self.context.ticks().next());
        let definition = DatabaseDefinition {
            name: name.to_string(),
        };
        self.catalog().create_database(id, &definition)?;
        self.write_structural(id, &Marker::create_database(id, &definition)?)?;
        Ok(id)
    }

    /// Drops a database with all its collections and views.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`] if it does not exist.
    pub fn drop_database(&self, id: DatabaseId) -> CoreResult<()> {
        self.ensure_running()?;
        self.catalog().drop_database(id)?;
        self.write_structural(id, &Marker::drop_database(id))?;
        Ok(())
    }

    /// Looks up a database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`] if it does not exist.
    pub fn database(&self, id: DatabaseId) -> CoreResult<Arc<Database>> {
        self.catalog().database(id)
    }

    // === Collections ===

    /// Creates a collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn create_collection(
        &self,
        database_id: DatabaseId,
        definition: &CollectionDefinition,
    ) -> CoreResult<CollectionId> {
        self.ensure_running()?;
        let database = self.catalog().database(database_id)?;
        let id = CollectionId::new(self.context.ticks().next());
        database.create_collection(id, definition)?;
        self.write_structural(
            database_id,
            &Marker::collection(MarkerType::CreateCollection, database_id, id, definition)?,
        )?;
        Ok(id)
    }

    /// Drops a collection.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the database or collection is missing.
    pub fn drop_collection(&self, database_id: DatabaseId, id: CollectionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.catalog().database(database_id)?.drop_collection(id)?;
        self.write_structural(database_id, &Marker::drop_collection(database_id, id))?;
        Ok(())
    }

    /// Renames a collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the new name is taken.
    pub fn rename_collection(&self, database_id: DatabaseId, id: CollectionId, name: &str) -> CoreResult<()> {
        self.ensure_running()?;
        let old_name = self.catalog().database(database_id)?.rename_collection(id, name)?;
        let definition = RenameDefinition {
            old_name,
            name: name.to_string(),
        };
        self.write_structural(
            database_id,
            &Marker::rename_collection(database_id, id, &definition)?,
        )?;
        Ok(())
    }

    /// Changes the properties of a collection.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the collection is missing.
    pub fn change_collection(
        &self,
        database_id: DatabaseId,
        id: CollectionId,
        definition: &CollectionDefinition,
    ) -> CoreResult<()> {
        self.ensure_running()?;
        self.catalog()
            .database(database_id)?
            .change_collection(id, definition)?;
        self.write_structural(
            database_id,
            &Marker::collection(MarkerType::ChangeCollection, database_id, id, definition)?,
        )?;
        Ok(())
    }

    /// Looks up a collection.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the database or collection is missing.
    pub fn collection(&self, database_id: DatabaseId, id: CollectionId) -> CoreResult<Arc<Collection>> {
        self.catalog().database(database_id)?.collection(id)
    }

    // === Indexes ===

    /// Creates a secondary index and fills it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] if existing
    /// documents violate a unique index.
    pub fn create_index(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        fields: Vec<String>,
        unique: bool,
    ) -> CoreResult<IndexId> {
        self.ensure_running()?;
        let collection = self.collection(database_id, collection_id)?;
        let definition = IndexDefinition {
            id: IndexId::new(self.context.ticks().next()),
            fields,
            unique,
        };
        collection.create_index(&definition, Some(&**self.context.manager()))?;
        self.write_structural(
            database_id,
            &Marker::create_index(database_id, collection_id, &definition)?,
        )?;
        Ok(definition.id)
    }

    /// Drops a secondary index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if it does not exist.
    pub fn drop_index(&self, database_id: DatabaseId, collection_id: CollectionId, id: IndexId) -> CoreResult<()> {
        self.ensure_running()?;
        self.collection(database_id, collection_id)?.drop_index(id)?;
        self.write_structural(
            database_id,
            &Marker::drop_index(database_id, collection_id, &DropIndexDefinition { id })?,
        )?;
        Ok(())
    }

    // === Views ===

    /// Creates a view.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn create_view(&self, database_id: DatabaseId, definition: &ViewDefinition) -> CoreResult<CollectionId> {
        self.ensure_running()?;
        let database = self.catalog().database(database_id)?;
        let id = CollectionId::new(self.context.ticks().next());
        database.create_view(id, definition)?;
        self.write_structural(
            database_id,
            &Marker::view(MarkerType::CreateView, database_id, id, definition)?,
        )?;
        Ok(id)
    }

    /// Drops a view.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] if it does not exist.
    pub fn drop_view(&self, database_id: DatabaseId, id: CollectionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.catalog().database(database_id)?.drop_view(id)?;
        self.write_structural(database_id, &Marker::drop_view(database_id, id))?;
        Ok(())
    }

    /// Changes a view.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] if it does not exist.
    pub fn change_view(&self, database_id: DatabaseId, id: CollectionId, definition: &ViewDefinition) -> CoreResult<()> {
        self.ensure_running()?;
        self.catalog().database(database_id)?.change_view(id, definition)?;
        self.write_structural(
            database_id,
            &Marker::view(MarkerType::ChangeView, database_id, id, definition)?,
        )?;
        Ok(())
    }

    // === Documents ===

    /// Starts a transaction over `collections`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WriteThrottleTimeout`] if throttling outlasts
    /// `throttle_wait`, or [`CoreError::LockTimeout`] if a collection is
    /// busy.
    pub fn begin_transaction(
        &self,
        database_id: DatabaseId,
        collections: &[CollectionId],
        hints: TransactionHints,
    ) -> CoreResult<Transaction> {
        self.ensure_running()?;
        Transaction::begin(Arc::clone(&self.context), database_id, collections, hints)
    }

    fn single_operation(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        operation: DocumentOperation,
    ) -> CoreResult<Tick> {
        let hints = TransactionHints {
            single_operation: true,
            ..TransactionHints::default()
        };
        let mut trx = self.begin_transaction(database_id, &[collection_id], hints)?;
        let tick = trx.add_operation(collection_id, operation)?;
        trx.commit()?;
        Ok(tick)
    }

    /// Inserts a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] if the key exists.
    pub fn insert(&self, database_id: DatabaseId, collection_id: CollectionId, key: &str, body: Value) -> CoreResult<Tick> {
        self.single_operation(
            database_id,
            collection_id,
            DocumentOperation::Insert {
                key: key.to_string(),
                body,
            },
        )
    }

    /// Replaces a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if the key does not exist.
    pub fn replace(&self, database_id: DatabaseId, collection_id: CollectionId, key: &str, body: Value) -> CoreResult<Tick> {
        self.single_operation(
            database_id,
            collection_id,
            DocumentOperation::Replace {
                key: key.to_string(),
                body,
            },
        )
    }

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if the key does not exist.
    pub fn remove(&self, database_id: DatabaseId, collection_id: CollectionId, key: &str) -> CoreResult<Tick> {
        self.single_operation(
            database_id,
            collection_id,
            DocumentOperation::Remove { key: key.to_string() },
        )
    }

    /// Reads the current version of a document.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the collection is missing, or an error
    /// if the marker cannot be read.
    pub fn document(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        key: &str,
    ) -> CoreResult<Option<DocumentPayload>> {
        self.collection(database_id, collection_id)?
            .read_document(key, &**self.context.manager())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_config;
    use crate::wal::MarkerReader;
    use tempfile::tempdir;

    fn users() -> CollectionDefinition {
        CollectionDefinition {
            name: "users".to_string(),
            wait_for_sync: false,
            journal_size: 0,
        }
    }

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    #[test]
    fn documents_survive_clean_restart() {
        let dir = tempdir().unwrap();
        let (db, users) = {
            let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
            let db = engine.create_database("main").unwrap();
            let users = engine.create_collection(db, &users()).unwrap();
            engine.insert(db, users, "alice", text("a1")).unwrap();
            engine.insert(db, users, "bob", text("b1")).unwrap();
            engine.replace(db, users, "alice", text("a2")).unwrap();
            engine.remove(db, users, "bob").unwrap();
            engine.shutdown().unwrap();
            (db, users)
        };

        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        let alice = engine.document(db, users, "alice").unwrap().unwrap();
        assert_eq!(alice.body, text("a2"));
        assert!(engine.document(db, users, "bob").unwrap().is_none());
        assert_eq!(engine.stats().recovery_errors, 0);
    }

    #[test]
    fn killed_engine_recovers_committed_work() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        let db = engine.create_database("main").unwrap();
        let users = engine.create_collection(db, &users()).unwrap();
        engine.insert(db, users, "alice", text("a1")).unwrap();

        let mut open = engine
            .begin_transaction(db, &[users], TransactionHints::default())
            .unwrap();
        open.add_operation(
            users,
            DocumentOperation::Insert {
                key: "carol".to_string(),
                body: text("c1"),
            },
        )
        .unwrap();
        let open_id = open.id();
        engine.kill();
        drop(open);

        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        assert_eq!(engine.document(db, users, "alice").unwrap().unwrap().body, text("a1"));
        assert!(engine.document(db, users, "carol").unwrap().is_none());
        assert!(engine.stats().recovery_markers_replayed >= 1);

        let mut aborted = false;
        for logfile in engine.manager().logfiles_for_recovery() {
            let data = logfile.read_used().unwrap();
            for item in MarkerReader::new(&data, "test") {
                let (_, marker) = item.unwrap();
                aborted |= marker.marker_type() == MarkerType::AbortTransaction
                    && marker.transaction_id() == open_id;
            }
        }
        assert!(aborted);
    }

    #[test]
    fn open_transaction_writes_stay_invisible() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        let db = engine.create_database("main").unwrap();
        let users = engine.create_collection(db, &users()).unwrap();
        engine.insert(db, users, "alice", text("a1")).unwrap();
        engine.insert(db, users, "bob", text("b1")).unwrap();

        let mut trx = engine
            .begin_transaction(db, &[users], TransactionHints::default())
            .unwrap();
        let insert = |key: &str, body| DocumentOperation::Insert { key: key.to_string(), body };
        trx.add_operation(users, insert("carol", text("c1"))).unwrap();
        trx.add_operation(
            users,
            DocumentOperation::Replace {
                key: "alice".to_string(),
                body: text("a2"),
            },
        )
        .unwrap();
        trx.add_operation(
            users,
            DocumentOperation::Replace {
                key: "alice".to_string(),
                body: text("a3"),
            },
        )
        .unwrap();
        trx.add_operation(users, DocumentOperation::Remove { key: "bob".to_string() })
            .unwrap();

        assert!(engine.document(db, users, "carol").unwrap().is_none());
        assert_eq!(engine.document(db, users, "alice").unwrap().unwrap().body, text("a1"));
        assert_eq!(engine.document(db, users, "bob").unwrap().unwrap().body, text("b1"));

        trx.commit().unwrap();
        assert_eq!(engine.document(db, users, "carol").unwrap().unwrap().body, text("c1"));
        assert_eq!(engine.document(db, users, "alice").unwrap().unwrap().body, text("a3"));
        assert!(engine.document(db, users, "bob").unwrap().is_none());

        let mut trx = engine
            .begin_transaction(db, &[users], TransactionHints::default())
            .unwrap();
        trx.add_operation(users, insert("dave", text("d1"))).unwrap();
        trx.add_operation(users, DocumentOperation::Remove { key: "carol".to_string() })
            .unwrap();
        assert!(engine.document(db, users, "dave").unwrap().is_none());
        trx.abort().unwrap();
        assert!(engine.document(db, users, "dave").unwrap().is_none());
        assert_eq!(engine.document(db, users, "carol").unwrap().unwrap().body, text("c1"));
    }

    #[test]
    fn structural_changes_survive_kill() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        let db = engine.create_database("main").unwrap();
        let users = engine.create_collection(db, &users()).unwrap();
        let index = engine
            .create_index(db, users, vec!["email".to_string()], true)
            .unwrap();
        engine.rename_collection(db, users, "people").unwrap();
        let view = engine
            .create_view(
                db,
                &ViewDefinition {
                    name: "search".to_string(),
                    kind: "search".to_string(),
                    properties: Value::Map(Vec::new()),
                },
            )
            .unwrap();
        engine.kill();

        let engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        let database = engine.database(db).unwrap();
        assert_eq!(database.collection(users).unwrap().name(), "people");
        assert_eq!(database.collection(users).unwrap().indexes()[0].id, index);
        assert_eq!(database.view(view).unwrap().name, "search");

        engine.drop_view(db, view).unwrap();
        engine.drop_index(db, users, index).unwrap();
        engine.drop_collection(db, users).unwrap();
        engine.drop_database(db).unwrap();
        assert!(engine.database(db).unwrap_err().is_not_found());
    }

    #[test]
    fn startup_steps_run_in_order() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::init(dir.path(), test_config()).unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert!(engine.run().is_err());
        assert!(matches!(
            engine.create_database("main"),
            Err(CoreError::InvalidOperation { .. })
        ));

        engine.run_recovery().unwrap();
        assert!(engine.run_recovery().is_err());
        engine.run().unwrap();
        assert!(!engine.manager().is_in_recovery());
        assert!(engine.manager().allows_writes());

        engine.shutdown().unwrap();
        assert!(matches!(engine.create_database("x"), Err(CoreError::ShuttingDown)));
        let info = ShutdownInfo::read(engine.manager().directory()).unwrap().unwrap();
        assert!(info.shutdown_time.is_some());
    }

    #[test]
    fn second_engine_on_same_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let _engine = StorageEngine::open(dir.path(), test_config()).unwrap();
        assert!(matches!(
            StorageEngine::open(dir.path(), test_config()),
            Err(CoreError::DirectoryLocked)
        ));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let dir = tempdir().unwrap();
        let config = test_config().logfile_size(1024);
        assert!(matches!(
            StorageEngine::open(dir.path(), config),
            Err(CoreError::InvalidConfig { .. })
        ));
    }
}
