//! Test fixtures and engine helpers.
//!
//! Provides convenience functions for setting up test engines
//! and common test scenarios.

use docdb_core::{
    CollectionDefinition, CollectionId, Config, CoreResult, DatabaseId, StorageEngine,
    MIN_JOURNAL_SIZE, MIN_LOGFILE_SIZE,
};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Name of the collection every [`TestEngine`] creates.
pub const TEST_COLLECTION: &str = "test";

/// A configuration with small files and short intervals.
#[must_use]
pub fn test_config() -> Config {
    Config::default()
        .logfile_size(MIN_LOGFILE_SIZE)
        .journal_size(MIN_JOURNAL_SIZE)
        .reserve_logfiles(1)
        .historic_logfiles(0)
        .sync_interval(Duration::from_millis(5))
        .flush_timeout(Duration::from_secs(5))
        .collector_interval(Duration::from_millis(20))
        .lock_timeout(Duration::from_millis(100))
}

/// A test engine in a temporary directory, with one database and one
/// collection.
pub struct TestEngine {
    engine: Option<StorageEngine>,
    config: Config,
    /// Database created at setup.
    pub database: DatabaseId,
    /// Collection created at setup.
    pub collection: CollectionId,
    // Last field: the directory outlives the engine
    temp_dir: TempDir,
}

impl TestEngine {
    /// Opens a fresh engine with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Opens a fresh engine with `config`.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine =
            StorageEngine::open(temp_dir.path(), config.clone()).expect("Failed to open engine");
        let database = engine
            .create_database("main")
            .expect("Failed to create database");
        let collection = engine
            .create_collection(
                database,
                &CollectionDefinition {
                    name: TEST_COLLECTION.to_string(),
                    wait_for_sync: false,
                    journal_size: 0,
                },
            )
            .expect("Failed to create collection");

        Self {
            engine: Some(engine),
            config,
            database,
            collection,
            temp_dir,
        }
    }

    /// Engine root directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Configuration used to open the engine.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shuts the engine down cleanly and opens it again.
    pub fn restart(&mut self) -> CoreResult<()> {
        if let Some(engine) = self.engine.take() {
            engine.shutdown()?;
        }
        self.engine = Some(StorageEngine::open(self.path(), self.config.clone())?);
        Ok(())
    }

    /// Kills the engine and opens it again, running crash recovery.
    pub fn crash_and_recover(&mut self) -> CoreResult<()> {
        self.crash();
        self.recover(self.config.clone())
    }

    /// Kills the engine; see [`crate::simulate_crash`].
    pub fn crash(&mut self) {
        if let Some(engine) = self.engine.take() {
            crate::crash::simulate_crash(engine);
        }
    }

    /// Opens the engine after [`TestEngine::crash`] with `config`.
    pub fn recover(&mut self, config: Config) -> CoreResult<()> {
        self.engine = Some(StorageEngine::open(self.path(), config)?);
        Ok(())
    }

    /// Returns the body of a document in the test collection.
    pub fn get(&self, key: &str) -> Option<ciborium::Value> {
        self.read(key).map(|doc| doc.body)
    }

    fn read(&self, key: &str) -> Option<docdb_core::DocumentPayload> {
        self.engine
            .as_ref()?
            .document(self.database, self.collection, key)
            .expect("Failed to read document")
    }

    /// Whether the engine is currently open.
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = StorageEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref().expect("engine is not open")
    }
}

/// Runs a test with a temporary engine.
///
/// # Example
///
/// ```rust,ignore
/// use docdb_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine| {
///         engine.insert(engine.database, engine.collection, "k", Value::Null).unwrap();
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::new();
    f(&engine)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use ciborium::Value;

    /// Body of the `i`-th generated document.
    pub fn numbered_body(i: usize) -> Value {
        Value::Map(vec![(
            Value::Text("index".to_string()),
            Value::Integer((i as u64).into()),
        )])
    }

    /// Key of the `i`-th generated document.
    pub fn numbered_key(i: usize) -> String {
        format!("doc-{i:05}")
    }

    /// Creates an engine with `count` committed documents.
    pub fn populated_engine(count: usize) -> TestEngine {
        let engine = TestEngine::new();
        for i in 0..count {
            engine
                .insert(
                    engine.database,
                    engine.collection,
                    &numbered_key(i),
                    numbered_body(i),
                )
                .expect("Failed to insert document");
        }
        engine
    }
}
