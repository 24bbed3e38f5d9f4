//! Databases, collections and views and their on-disk layout.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//!   database-<id>/
//!     parameter.json
//!     collection-<id>-<random>/
//!       parameter.json
//!       journal-<fid>.db
//!       datafile-<fid>.db
//!   journals/
//!     logfile-<id>.db
//!     SHUTDOWN
//! ```
//!
//! ## Crash Safety
//!
//! New directories are built as `<name>.tmp` holding a `.tmp` flag file,
//! renamed into place, given their `parameter.json` and only then lose the
//! flag. Dropped directories are renamed to `deleted-<name>` before they
//! are removed. Opening a catalog deletes whatever an interrupted create or
//! drop left behind.

mod collection;
mod database;
mod datafile;
mod index;

pub use collection::{
    Collection, DocumentLocation, DocumentPosition, IndexMode, LockOwner, Undo, WalReader,
    WriteKind,
};
pub use database::{Database, ViewEntry};
pub use datafile::{DatafileKind, DatafileStatistics, DatafileStore, ScannedMarker};
pub use index::SecondaryIndex;

use crate::error::{CoreError, CoreResult};
use crate::types::{DatabaseId, LogfileId, TickGenerator};
use crate::wal::{DatabaseDefinition, LogfileManager};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the parameter file in every database and collection directory.
pub const PARAMETER_FILE: &str = "parameter.json";

/// Flag file marking a directory whose creation has not finished.
pub const TMP_FLAG: &str = ".tmp";

/// Creates `path` atomically with `parameters` as its parameter file.
pub(crate) fn create_directory<T: Serialize>(path: &Path, parameters: &T) -> CoreResult<()> {
    if path.exists() {
        return Err(CoreError::invalid_operation(format!(
            "directory {} already exists",
            path.display()
        )));
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::create_dir_all(&tmp)?;
    fs::write(tmp.join(TMP_FLAG), b"")?;
    fs::rename(&tmp, path)?;
    write_parameter_file(path, parameters)?;
    fs::remove_file(path.join(TMP_FLAG))?;
    Ok(())
}

/// Atomically replaces the parameter file in `dir`.
pub(crate) fn write_parameter_file<T: Serialize>(dir: &Path, parameters: &T) -> CoreResult<()> {
    let path = dir.join(PARAMETER_FILE);
    let tmp = dir.join(format!("{PARAMETER_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(parameters)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Reads the parameter file in `dir`.
///
/// # Errors
///
/// Returns [`CoreError::IllegalParameterFile`] if it is missing or invalid.
pub(crate) fn read_parameter_file<T: DeserializeOwned>(dir: &Path) -> CoreResult<T> {
    let path = dir.join(PARAMETER_FILE);
    let content = fs::read(&path)
        .map_err(|err| CoreError::illegal_parameter_file(&path, err.to_string()))?;
    serde_json::from_slice(&content)
        .map_err(|err| CoreError::illegal_parameter_file(&path, err.to_string()))
}

/// Renames `path` to `deleted-<name>` and removes it.
pub(crate) fn remove_directory(path: &Path) -> CoreResult<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let target = parent.join(format!("deleted-{}", name.to_string_lossy()));
    fs::rename(path, &target)?;
    fs::remove_dir_all(&target)?;
    Ok(())
}

/// Deletes leftovers of interrupted creates and drops below `parent` and
/// returns the remaining subdirectories whose name starts with `prefix`.
pub(crate) fn cleanup_directory(parent: &Path, prefix: &str) -> CoreResult<Vec<PathBuf>> {
    let mut remaining = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if name.ends_with(".tmp") || name.starts_with("deleted-") || path.join(TMP_FLAG).exists() {
            warn!(directory = %path.display(), "removing unfinished directory");
            fs::remove_dir_all(&path)?;
            continue;
        }
        if name.starts_with(prefix) {
            remaining.push(path);
        }
    }
    remaining.sort();
    Ok(remaining)
}

/// Access to markers still living in the write-ahead log.
impl WalReader for LogfileManager {
    fn read_wal_marker(&self, logfile: LogfileId, offset: u64) -> CoreResult<Vec<u8>> {
        self.get_logfile(logfile)
            .ok_or_else(|| CoreError::internal(format!("{logfile} is gone")))?
            .read_marker(offset)
    }
}

/// All databases of an engine.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    ticks: Arc<TickGenerator>,
    journal_size: u64,
    databases: RwLock<BTreeMap<DatabaseId, Arc<Database>>>,
}

impl Catalog {
    /// Opens every database below `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read or a parameter file
    /// is invalid.
    pub fn open(root: &Path, ticks: Arc<TickGenerator>, journal_size: u64) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        let mut databases = BTreeMap::new();
        for path in cleanup_directory(root, "database-")? {
            let database = Database::open(&path, Arc::clone(&ticks), journal_size)?;
            ticks.observe(database.id().as_u64());
            databases.insert(database.id(), Arc::new(database));
        }
        info!(count = databases.len(), root = %root.display(), "opened catalog");
        Ok(Self {
            root: root.to_path_buf(),
            ticks,
            journal_size,
            databases: RwLock::new(databases),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates database `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name is taken.
    pub fn create_database(&self, id: DatabaseId, definition: &DatabaseDefinition) -> CoreResult<Arc<Database>> {
        let mut databases = self.databases.write();
        if databases.values().any(|d| d.name() == definition.name) || databases.contains_key(&id) {
            return Err(CoreError::duplicate_name(&definition.name));
        }
        let database = Arc::new(Database::create(
            &self.root,
            id,
            &definition.name,
            Arc::clone(&self.ticks),
            self.journal_size,
        )?);
        databases.insert(id, Arc::clone(&database));
        debug!(database = %id, name = %definition.name, "created database");
        Ok(database)
    }

    /// Drops database `id` with all its collections.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`] if it does not exist.
    pub fn drop_database(&self, id: DatabaseId) -> CoreResult<()> {
        let database = self
            .databases
            .write()
            .remove(&id)
            .ok_or_else(|| CoreError::database_not_found(id))?;
        remove_directory(database.path())?;
        debug!(database = %id, "dropped database");
        Ok(())
    }

    /// Looks up a database by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`] if it does not exist.
    pub fn database(&self, id: DatabaseId) -> CoreResult<Arc<Database>> {
        self.databases
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::database_not_found(id))
    }

    /// Looks up a database by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseNotFound`] if it does not exist.
    pub fn database_by_name(&self, name: &str) -> CoreResult<Arc<Database>> {
        self.databases
            .read()
            .values()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::database_not_found(name))
    }

    /// All databases in id order.
    #[must_use]
    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.read().values().cloned().collect()
    }

    /// All collections of all databases.
    #[must_use]
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.databases()
            .iter()
            .flat_map(|d| d.collections())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectionId;
    use crate::wal::CollectionDefinition;
    use tempfile::tempdir;

    fn definition(name: &str) -> DatabaseDefinition {
        DatabaseDefinition {
            name: name.to_string(),
        }
    }

    #[test]
    fn databases_survive_reopen() {
        let dir = tempdir().unwrap();
        let ticks = Arc::new(TickGenerator::new(0));
        {
            let catalog = Catalog::open(dir.path(), Arc::clone(&ticks), 1 << 20).unwrap();
            let db = catalog.create_database(DatabaseId::new(5), &definition("main")).unwrap();
            db.create_collection(
                CollectionId::new(6),
                &CollectionDefinition {
                    name: "users".to_string(),
                    wait_for_sync: false,
                    journal_size: 0,
                },
            )
            .unwrap();
        }

        let catalog = Catalog::open(dir.path(), Arc::clone(&ticks), 1 << 20).unwrap();
        let db = catalog.database_by_name("main").unwrap();
        assert_eq!(db.id(), DatabaseId::new(5));
        assert_eq!(db.collection_by_name("users").unwrap().id(), CollectionId::new(6));
        assert!(ticks.current() >= 5);
    }

    #[test]
    fn duplicate_and_missing_databases() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path(), Arc::new(TickGenerator::new(0)), 1 << 20).unwrap();
        catalog.create_database(DatabaseId::new(1), &definition("a")).unwrap();
        assert!(matches!(
            catalog.create_database(DatabaseId::new(2), &definition("a")),
            Err(CoreError::DuplicateName { .. })
        ));

        catalog.drop_database(DatabaseId::new(1)).unwrap();
        assert!(catalog.database(DatabaseId::new(1)).unwrap_err().is_not_found());
        assert!(catalog.drop_database(DatabaseId::new(1)).unwrap_err().is_not_found());
        assert!(!dir.path().join("database-1").exists());
    }

    #[test]
    fn unfinished_directories_are_removed() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("database-9.tmp")).unwrap();
        std::fs::create_dir_all(dir.path().join("deleted-database-3")).unwrap();
        let flagged = dir.path().join("database-4");
        std::fs::create_dir_all(&flagged).unwrap();
        std::fs::write(flagged.join(TMP_FLAG), b"").unwrap();

        let catalog = Catalog::open(dir.path(), Arc::new(TickGenerator::new(0)), 1 << 20).unwrap();
        assert!(catalog.databases().is_empty());
        assert!(!flagged.exists());
        assert!(!dir.path().join("database-9.tmp").exists());
    }

    #[test]
    fn broken_parameter_file_is_reported() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path().join("database-2");
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::write(db_dir.join(PARAMETER_FILE), b"{").unwrap();

        let err = Catalog::open(dir.path(), Arc::new(TickGenerator::new(0)), 1 << 20).unwrap_err();
        assert!(matches!(err, CoreError::IllegalParameterFile { .. }));
    }
}
