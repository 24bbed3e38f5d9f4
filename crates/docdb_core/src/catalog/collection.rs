//! A collection: primary index, secondary indexes, datafiles and the
//! exclusive lock shared by transactions and the collector.
//!
//! The primary index maps a document key to the position of its newest
//! marker. Until the collector has moved a marker into a datafile the
//! position points into the write-ahead log.

use super::datafile::{DatafileStatistics, DatafileStore, ScannedMarker};
use super::index::SecondaryIndex;
use super::{create_directory, read_parameter_file, write_parameter_file};
use crate::collector::{CollectorCache, CollectorOperation, TransferredMarker};
use crate::error::{CoreError, CoreResult};
use crate::types::{
    CollectionId, DatabaseId, DatafileId, IndexId, LogfileId, Revision, Tick, TickGenerator,
    TransactionId,
};
use crate::wal::{
    CollectionDefinition, DocumentPayload, IndexDefinition, MarkerType, MarkerView,
};
use ciborium::Value;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Read access to markers that are still in the write-ahead log.
pub trait WalReader: Send + Sync {
    /// Returns the complete marker at `offset` of `logfile`.
    ///
    /// # Errors
    ///
    /// Returns an error if the logfile is gone or the marker is damaged.
    fn read_wal_marker(&self, logfile: LogfileId, offset: u64) -> CoreResult<Vec<u8>>;
}

/// Where the newest marker of a document lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLocation {
    /// In a write-ahead logfile.
    Wal {
        /// Logfile id.
        logfile: LogfileId,
        /// Marker offset.
        offset: u64,
    },
    /// In a collection datafile.
    Datafile {
        /// Datafile id.
        datafile: DatafileId,
        /// Marker offset.
        offset: u64,
    },
}

/// Primary index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentPosition {
    /// Revision of the document.
    pub revision: u64,
    /// Tick of its marker.
    pub tick: Tick,
    /// Where the marker lives.
    pub location: DocumentLocation,
    /// Marker size in bytes.
    pub size: u64,
}

/// Holder of a collection lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// A write transaction.
    Transaction(TransactionId),
    /// The collector applying its queue.
    Collector,
}

/// Whether secondary indexes follow a write immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Indexes are updated and checked with every write.
    Maintain,
    /// Indexes are left alone and rebuilt later with `fill_indexes`.
    Deferred,
}

/// Kind of document write being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// The key must not exist.
    Insert,
    /// The key must exist.
    Replace,
    /// Insert or replace.
    Upsert,
    /// The key must exist and is removed.
    Remove,
}

/// What a write changed, so it can be reverted.
#[derive(Debug, Clone)]
pub struct Undo {
    key: String,
    previous: Option<DocumentPosition>,
    index_keys: Option<Vec<(IndexId, Option<Vec<u8>>)>>,
    marked_dead: Option<(DatafileId, u64)>,
}

impl Undo {
    /// Key of the written document.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionParameters {
    id: CollectionId,
    name: String,
    #[serde(default)]
    wait_for_sync: bool,
    #[serde(default)]
    journal_size: u64,
    #[serde(default)]
    indexes: Vec<IndexDefinition>,
}

#[derive(Debug, Default)]
struct DocumentState {
    primary: HashMap<String, DocumentPosition>,
    indexes: Vec<SecondaryIndex>,
    /// Committed positions of keys the lock holder has written but not
    /// yet committed. `None` means the key did not exist.
    committed: HashMap<String, Option<DocumentPosition>>,
}

/// A collection of documents.
#[derive(Debug)]
pub struct Collection {
    id: CollectionId,
    database_id: DatabaseId,
    path: PathBuf,
    default_journal_size: u64,
    parameters: RwLock<CollectionParameters>,
    owner: Mutex<Option<LockOwner>>,
    owner_released: Condvar,
    state: RwLock<DocumentState>,
    storage: Mutex<DatafileStore>,
    uncollected: AtomicU64,
    max_tick: AtomicU64,
    revision: AtomicU64,
}

impl Collection {
    /// Creates the directory of a new collection below `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(
        parent: &Path,
        database_id: DatabaseId,
        id: CollectionId,
        definition: &CollectionDefinition,
        ticks: Arc<TickGenerator>,
        default_journal_size: u64,
    ) -> CoreResult<Self> {
        let path = parent.join(format!("collection-{}-{}", id.as_u64(), rand::random::<u32>()));
        let parameters = CollectionParameters {
            id,
            name: definition.name.clone(),
            wait_for_sync: definition.wait_for_sync,
            journal_size: definition.journal_size,
            indexes: Vec::new(),
        };
        create_directory(&path, &parameters)?;
        Self::open(&path, database_id, ticks, default_journal_size)
    }

    /// Opens an existing collection directory and rebuilds its indexes
    /// from the datafiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter file or a datafile is damaged.
    pub fn open(
        path: &Path,
        database_id: DatabaseId,
        ticks: Arc<TickGenerator>,
        default_journal_size: u64,
    ) -> CoreResult<Self> {
        let parameters: CollectionParameters = read_parameter_file(path)?;
        let journal_size = effective_journal_size(parameters.journal_size, default_journal_size);
        let (mut storage, markers) = DatafileStore::open(path, journal_size, ticks)?;

        let (primary, max_tick, revision) = rebuild_primary(&mut storage, &markers);
        let indexes = parameters
            .indexes
            .iter()
            .cloned()
            .map(SecondaryIndex::new)
            .collect();

        let collection = Self {
            id: parameters.id,
            database_id,
            path: path.to_path_buf(),
            default_journal_size,
            parameters: RwLock::new(parameters),
            owner: Mutex::new(None),
            owner_released: Condvar::new(),
            state: RwLock::new(DocumentState {
                primary,
                indexes,
                committed: HashMap::new(),
            }),
            storage: Mutex::new(storage),
            uncollected: AtomicU64::new(0),
            max_tick: AtomicU64::new(max_tick.as_u64()),
            revision: AtomicU64::new(revision),
        };
        let violations = collection.fill_indexes(None)?;
        if violations > 0 {
            warn!(collection = %collection.id, violations, "unique violations in datafiles");
        }
        info!(
            collection = %collection.id,
            name = %collection.name(),
            documents = collection.document_count(),
            "opened collection"
        );
        Ok(collection)
    }

    /// Collection id.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Id of the owning database.
    #[must_use]
    pub fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Collection directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current name.
    #[must_use]
    pub fn name(&self) -> String {
        self.parameters.read().name.clone()
    }

    /// Whether writes wait for the synchronizer.
    #[must_use]
    pub fn wait_for_sync(&self) -> bool {
        self.parameters.read().wait_for_sync
    }

    /// Current properties.
    #[must_use]
    pub fn definition(&self) -> CollectionDefinition {
        let parameters = self.parameters.read();
        CollectionDefinition {
            name: parameters.name.clone(),
            wait_for_sync: parameters.wait_for_sync,
            journal_size: parameters.journal_size,
        }
    }

    /// Renames the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter file cannot be written.
    pub fn rename(&self, name: &str) -> CoreResult<()> {
        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.name = name.to_string();
        write_parameter_file(&self.path, &updated)?;
        *parameters = updated;
        Ok(())
    }

    /// Changes sync and journal settings. The name is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter file cannot be written.
    pub fn change(&self, definition: &CollectionDefinition) -> CoreResult<()> {
        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.wait_for_sync = definition.wait_for_sync;
        updated.journal_size = definition.journal_size;
        write_parameter_file(&self.path, &updated)?;
        *parameters = updated;
        self.storage.lock().set_journal_size(effective_journal_size(
            definition.journal_size,
            self.default_journal_size,
        ));
        Ok(())
    }

    // === Locking ===

    /// Acquires the collection lock for `owner`, waiting up to `timeout`.
    /// Re-acquiring by the current owner succeeds immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockTimeout`] if another owner keeps the lock.
    pub fn lock(&self, owner: LockOwner, timeout: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut current = self.owner.lock();
        loop {
            match *current {
                None => {
                    *current = Some(owner);
                    return Ok(());
                }
                Some(holder) if holder == owner => return Ok(()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(CoreError::lock_timeout(format!("collection {}", self.id)));
            }
            self.owner_released.wait_until(&mut current, deadline);
        }
    }

    /// Like [`Collection::lock`] but reports failure as `false`.
    #[must_use]
    pub fn try_lock(&self, owner: LockOwner, timeout: Duration) -> bool {
        self.lock(owner, timeout).is_ok()
    }

    /// Releases the lock if `owner` holds it.
    pub fn unlock(&self, owner: LockOwner) {
        let mut current = self.owner.lock();
        if *current == Some(owner) {
            *current = None;
            self.owner_released.notify_all();
        }
    }

    /// Current lock holder.
    #[must_use]
    pub fn lock_owner(&self) -> Option<LockOwner> {
        *self.owner.lock()
    }

    // === Counters ===

    /// Number of live documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.state.read().primary.len()
    }

    /// Returns true if `key` names a live document.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.read().primary.contains_key(key)
    }

    /// Position of document `key`.
    #[must_use]
    pub fn position(&self, key: &str) -> Option<DocumentPosition> {
        self.state.read().primary.get(key).copied()
    }

    /// Document markers written to the log but not yet collected.
    #[must_use]
    pub fn uncollected(&self) -> u64 {
        self.uncollected.load(Ordering::Acquire)
    }

    /// Counts `n` more uncollected markers.
    pub fn increase_uncollected(&self, n: u64) {
        self.uncollected.fetch_add(n, Ordering::AcqRel);
    }

    /// Counts `n` fewer uncollected markers.
    pub fn decrease_uncollected(&self, n: u64) {
        let _ = self
            .uncollected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(n))
            });
    }

    /// Highest tick stored in the datafiles.
    #[must_use]
    pub fn max_tick(&self) -> Tick {
        Tick::new(self.max_tick.load(Ordering::Acquire))
    }

    /// Revision pointer: the newest revision written.
    #[must_use]
    pub fn revision(&self) -> Revision {
        Revision::new(self.revision.load(Ordering::Acquire))
    }

    /// Resets the revision pointer, used when a transaction aborts.
    pub fn set_revision(&self, revision: Revision) {
        self.revision.store(revision.as_u64(), Ordering::Release);
    }

    /// Datafile statistics summed over all files.
    #[must_use]
    pub fn statistics(&self) -> DatafileStatistics {
        self.storage.lock().total_statistics()
    }

    /// Statistics of one datafile.
    #[must_use]
    pub fn datafile_statistics(&self, id: DatafileId) -> Option<DatafileStatistics> {
        self.storage.lock().statistics(id)
    }

    /// Ids of the datafiles, oldest first.
    #[must_use]
    pub fn datafile_ids(&self) -> Vec<DatafileId> {
        self.storage.lock().datafile_ids()
    }

    // === Writes ===

    /// Checks that a write of `key` would succeed. `body` is `None` for
    /// removals.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] for an existing key
    /// on insert or a unique index conflict, and
    /// [`CoreError::DocumentNotFound`] for a missing key on replace or
    /// remove.
    pub fn check_write(&self, key: &str, body: Option<&Value>, kind: WriteKind) -> CoreResult<()> {
        let state = self.state.read();
        let exists = state.primary.contains_key(key);
        match kind {
            WriteKind::Insert if exists => {
                return Err(CoreError::UniqueConstraintViolated {
                    index: 0,
                    key: key.to_string(),
                })
            }
            WriteKind::Replace | WriteKind::Remove if !exists => {
                return Err(CoreError::document_not_found(key))
            }
            _ => {}
        }
        if let Some(body) = body {
            for index in state.indexes.iter().filter(|i| i.is_unique()) {
                if index.conflicts(key, &index.key_for(body)?) {
                    return Err(CoreError::UniqueConstraintViolated {
                        index: index.id().as_u64(),
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Points the primary index of `payload.key` at a new marker.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UniqueConstraintViolated`] if a unique index
    /// rejects the body in [`IndexMode::Maintain`]. Nothing is changed then.
    pub fn apply_document(
        &self,
        payload: &DocumentPayload,
        position: DocumentPosition,
        mode: IndexMode,
    ) -> CoreResult<Undo> {
        let mut state = self.state.write();

        let new_keys = match mode {
            IndexMode::Maintain => {
                let mut keys = Vec::with_capacity(state.indexes.len());
                for index in &state.indexes {
                    let key = index.key_for(&payload.body)?;
                    if index.conflicts(&payload.key, &key) {
                        return Err(CoreError::UniqueConstraintViolated {
                            index: index.id().as_u64(),
                            key: payload.key.clone(),
                        });
                    }
                    keys.push(key);
                }
                Some(keys)
            }
            IndexMode::Deferred => None,
        };

        let previous = state.primary.insert(payload.key.clone(), position);
        let index_keys = match new_keys {
            Some(keys) => {
                let mut old = Vec::with_capacity(keys.len());
                for (index, key) in state.indexes.iter_mut().zip(keys) {
                    let previous_key = index.remove(&payload.key);
                    index.insert(&payload.key, key)?;
                    old.push((index.id(), previous_key));
                }
                Some(old)
            }
            None => None,
        };

        let marked_dead = self.mark_previous_dead(previous);
        self.revision.fetch_max(payload.rev, Ordering::AcqRel);

        Ok(Undo {
            key: payload.key.clone(),
            previous,
            index_keys,
            marked_dead,
        })
    }

    /// Removes `key` from the primary index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if the key is not present.
    pub fn apply_remove(&self, key: &str, revision: u64, mode: IndexMode) -> CoreResult<Undo> {
        let mut state = self.state.write();
        let previous = state
            .primary
            .remove(key)
            .ok_or_else(|| CoreError::document_not_found(key))?;

        let index_keys = match mode {
            IndexMode::Maintain => Some(
                state
                    .indexes
                    .iter_mut()
                    .map(|index| (index.id(), index.remove(key)))
                    .collect(),
            ),
            IndexMode::Deferred => None,
        };

        let marked_dead = self.mark_previous_dead(Some(previous));
        self.revision.fetch_max(revision, Ordering::AcqRel);

        Ok(Undo {
            key: key.to_string(),
            previous: Some(previous),
            index_keys,
            marked_dead,
        })
    }

    fn mark_previous_dead(&self, previous: Option<DocumentPosition>) -> Option<(DatafileId, u64)> {
        let position = previous?;
        let DocumentLocation::Datafile { datafile, .. } = position.location else {
            return None;
        };
        let mut storage = self.storage.lock();
        storage.statistics_mut(datafile)?.mark_dead(position.size);
        Some((datafile, position.size))
    }

    /// Undoes a write made by [`Collection::apply_document`] or
    /// [`Collection::apply_remove`]. Writes must be reverted newest first.
    pub fn revert(&self, undo: Undo) {
        let mut state = self.state.write();
        match undo.previous {
            Some(position) => {
                state.primary.insert(undo.key.clone(), position);
            }
            None => {
                state.primary.remove(&undo.key);
            }
        }

        if let Some(index_keys) = undo.index_keys {
            for (id, key) in index_keys {
                let Some(index) = state.indexes.iter_mut().find(|i| i.id() == id) else {
                    continue;
                };
                index.remove(&undo.key);
                if let Some(key) = key {
                    if let Err(err) = index.insert(&undo.key, key) {
                        warn!(collection = %self.id, key = %undo.key, error = %err, "index entry not restored");
                    }
                }
            }
        }

        if let Some((datafile, size)) = undo.marked_dead {
            if let Some(stats) = self.storage.lock().statistics_mut(datafile) {
                stats.mark_alive(size);
            }
        }
    }

    /// Records the committed position of `key` before the lock holder
    /// writes it, so readers keep seeing it until
    /// [`Collection::clear_uncommitted`]. Only the first call per key counts.
    pub fn remember_committed(&self, key: &str) {
        let mut state = self.state.write();
        let committed = state.primary.get(key).copied();
        state.committed.entry(key.to_string()).or_insert(committed);
    }

    /// Makes the writes of the lock holder visible to readers. Called on
    /// commit, and after the writes were reverted on abort.
    pub fn clear_uncommitted(&self) {
        self.state.write().committed.clear();
    }

    // === Reads ===

    /// Reads the newest committed version of document `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be read.
    pub fn read_document(&self, key: &str, wal: &dyn WalReader) -> CoreResult<Option<DocumentPayload>> {
        let state = self.state.read();
        let position = match state.committed.get(key) {
            Some(committed) => *committed,
            None => state.primary.get(key).copied(),
        };
        let Some(position) = position else {
            return Ok(None);
        };
        let storage = self.storage.lock();
        let bytes = read_position(&storage, position, Some(wal))?;
        decode_document(&bytes, position).map(Some)
    }

    /// Keys of the documents whose fields indexed by `index` equal `values`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] for an unknown index.
    pub fn lookup(&self, index: IndexId, values: &[Value]) -> CoreResult<Vec<String>> {
        let state = self.state.read();
        state
            .indexes
            .iter()
            .find(|i| i.id() == index)
            .ok_or(CoreError::IndexNotFound {
                index: index.as_u64(),
            })?
            .lookup(values)
    }

    // === Indexes ===

    /// Definitions of the secondary indexes.
    #[must_use]
    pub fn indexes(&self) -> Vec<IndexDefinition> {
        self.parameters.read().indexes.clone()
    }

    /// Adds a secondary index. With a reader the index is filled right
    /// away; without one it stays empty until [`Collection::fill_indexes`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the id is taken, or
    /// [`CoreError::UniqueConstraintViolated`] if existing documents
    /// violate a unique index. The index is not added then.
    pub fn create_index(&self, definition: &IndexDefinition, wal: Option<&dyn WalReader>) -> CoreResult<()> {
        let mut state = self.state.write();
        if state.indexes.iter().any(|i| i.id() == definition.id) {
            return Err(CoreError::invalid_operation(format!(
                "index {} already exists",
                definition.id
            )));
        }

        let mut index = SecondaryIndex::new(definition.clone());
        if let Some(wal) = wal {
            let storage = self.storage.lock();
            for (key, position) in &state.primary {
                let document = decode_document(&read_position(&storage, *position, Some(wal))?, *position)?;
                let index_key = index.key_for(&document.body)?;
                index.insert(key, index_key)?;
            }
        }

        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.indexes.push(definition.clone());
        write_parameter_file(&self.path, &updated)?;
        *parameters = updated;
        state.indexes.push(index);
        debug!(collection = %self.id, index = %definition.id, "created index");
        Ok(())
    }

    /// Removes a secondary index.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if it does not exist.
    pub fn drop_index(&self, id: IndexId) -> CoreResult<()> {
        let mut state = self.state.write();
        let position = state
            .indexes
            .iter()
            .position(|i| i.id() == id)
            .ok_or(CoreError::IndexNotFound { index: id.as_u64() })?;

        let mut parameters = self.parameters.write();
        let mut updated = parameters.clone();
        updated.indexes.retain(|d| d.id != id);
        write_parameter_file(&self.path, &updated)?;
        *parameters = updated;
        state.indexes.remove(position);
        debug!(collection = %self.id, index = %id, "dropped index");
        Ok(())
    }

    /// Rebuilds every secondary index from the documents and returns the
    /// number of unique violations found. Violating documents stay out of
    /// the index they violate.
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be read.
    pub fn fill_indexes(&self, wal: Option<&dyn WalReader>) -> CoreResult<u64> {
        let mut state = self.state.write();
        if state.indexes.is_empty() {
            return Ok(0);
        }
        let storage = self.storage.lock();
        let DocumentState { primary, indexes, .. } = &mut *state;
        for index in indexes.iter_mut() {
            index.clear();
        }

        let mut keys: Vec<_> = primary.iter().collect();
        keys.sort_by_key(|(_, position)| position.tick);

        let mut violations = 0;
        for (key, position) in keys {
            let document = decode_document(&read_position(&storage, *position, wal)?, *position)?;
            for index in indexes.iter_mut() {
                let index_key = index.key_for(&document.body)?;
                match index.insert(key, index_key) {
                    Ok(()) => {}
                    Err(CoreError::UniqueConstraintViolated { .. }) => {
                        violations += 1;
                        warn!(collection = %self.id, index = %index.id(), key = %key, "unique violation while filling index");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(violations)
    }

    // === Collector ===

    /// Copies the document and remove markers listed in `operations` from
    /// logfile data into the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation lies outside `data` or the journal
    /// cannot be written.
    pub fn transfer_markers(
        &self,
        logfile: LogfileId,
        data: &[u8],
        operations: &[CollectorOperation],
    ) -> CoreResult<CollectorCache> {
        let mut cache = CollectorCache::new(self.database_id, self.id, logfile);
        let mut storage = self.storage.lock();
        let mut last_tick = Tick::default();

        for operation in operations {
            if !operation.marker_type.is_document_operation() {
                continue;
            }
            let Some(key) = operation.key.clone() else {
                continue;
            };
            let start = operation.offset as usize;
            let bytes = data
                .get(start..start + operation.size as usize)
                .ok_or_else(|| {
                    CoreError::corrupt_marker(logfile.to_string(), operation.offset, "marker outside logfile")
                })?;
            let (datafile, datafile_offset) = storage.append(bytes)?;

            let is_remove = operation.marker_type == MarkerType::Remove;
            if !is_remove {
                if let Some(stats) = storage.statistics_mut(datafile) {
                    stats.number_uncollected += 1;
                }
            }
            last_tick = last_tick.max(operation.tick);
            cache.operations.push(TransferredMarker {
                key,
                tick: operation.tick,
                wal_offset: operation.offset,
                datafile,
                datafile_offset,
                size: operation.size,
                is_remove,
            });
        }
        storage.sync()?;
        self.max_tick.fetch_max(last_tick.as_u64(), Ordering::AcqRel);
        Ok(cache)
    }

    /// Repoints the primary index at transferred markers that are still
    /// the newest version and counts the others as dead. The caller holds
    /// the collection lock.
    pub fn apply_collected(&self, cache: &CollectorCache) {
        let mut state = self.state.write();
        let mut storage = self.storage.lock();

        for operation in &cache.operations {
            let Some(stats) = storage.statistics_mut(operation.datafile) else {
                continue;
            };
            if operation.is_remove {
                stats.number_deletions += 1;
                continue;
            }
            stats.number_uncollected = stats.number_uncollected.saturating_sub(1);

            match state.primary.get_mut(&operation.key) {
                Some(position)
                    if position.tick == operation.tick
                        && matches!(position.location, DocumentLocation::Wal { logfile, .. } if logfile == cache.logfile_id) =>
                {
                    position.location = DocumentLocation::Datafile {
                        datafile: operation.datafile,
                        offset: operation.datafile_offset,
                    };
                    stats.number_alive += 1;
                    stats.size_alive += operation.size;
                }
                _ => {
                    stats.number_dead += 1;
                    stats.size_dead += operation.size;
                }
            }
        }
        drop(storage);
        drop(state);
        self.decrease_uncollected(cache.seen);
    }
}

fn effective_journal_size(configured: u64, default: u64) -> u64 {
    if configured > 0 {
        configured
    } else {
        default
    }
}

/// Builds the primary index from datafile markers, newest tick wins, and
/// fills in the per-file statistics.
fn rebuild_primary(
    storage: &mut DatafileStore,
    markers: &[ScannedMarker],
) -> (HashMap<String, DocumentPosition>, Tick, u64) {
    let mut newest: HashMap<&str, &ScannedMarker> = HashMap::new();
    let mut max_tick = Tick::default();
    let mut revision = 0;
    for marker in markers {
        max_tick = max_tick.max(marker.tick);
        revision = revision.max(marker.revision);
        match newest.get(marker.key.as_str()) {
            Some(current) if current.tick > marker.tick => {}
            _ => {
                newest.insert(&marker.key, marker);
            }
        }
    }

    for marker in markers {
        let Some(stats) = storage.statistics_mut(marker.datafile) else {
            continue;
        };
        if marker.is_remove {
            stats.number_deletions += 1;
        } else if newest.get(marker.key.as_str()).is_some_and(|m| std::ptr::eq(*m, marker)) {
            stats.number_alive += 1;
            stats.size_alive += marker.size;
        } else {
            stats.number_dead += 1;
            stats.size_dead += marker.size;
        }
    }

    let primary = newest
        .into_values()
        .filter(|m| !m.is_remove)
        .map(|m| {
            (
                m.key.clone(),
                DocumentPosition {
                    revision: m.revision,
                    tick: m.tick,
                    location: DocumentLocation::Datafile {
                        datafile: m.datafile,
                        offset: m.offset,
                    },
                    size: m.size,
                },
            )
        })
        .collect();
    (primary, max_tick, revision)
}

fn read_position(
    storage: &DatafileStore,
    position: DocumentPosition,
    wal: Option<&dyn WalReader>,
) -> CoreResult<Vec<u8>> {
    match position.location {
        DocumentLocation::Datafile { datafile, offset } => storage.read_marker(datafile, offset),
        DocumentLocation::Wal { logfile, offset } => wal
            .ok_or_else(|| CoreError::internal(format!("document in {logfile} without log access")))?
            .read_wal_marker(logfile, offset),
    }
}

fn decode_document(bytes: &[u8], position: DocumentPosition) -> CoreResult<DocumentPayload> {
    let view = MarkerView::parse(bytes).map_err(|check| {
        CoreError::corrupt_marker(format!("{:?}", position.location), 0, format!("{check:?}"))
    })?;
    view.decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Marker;
    use tempfile::tempdir;

    struct NoWal;

    impl WalReader for NoWal {
        fn read_wal_marker(&self, logfile: LogfileId, _offset: u64) -> CoreResult<Vec<u8>> {
            Err(CoreError::internal(format!("{logfile} unavailable")))
        }
    }

    fn body(email: &str) -> Value {
        Value::Map(vec![(
            Value::Text("email".to_string()),
            Value::Text(email.to_string()),
        )])
    }

    fn payload(key: &str, rev: u64, email: &str) -> DocumentPayload {
        DocumentPayload {
            key: key.to_string(),
            rev,
            body: body(email),
        }
    }

    fn wal_position(tick: u64) -> DocumentPosition {
        DocumentPosition {
            revision: tick,
            tick: Tick::new(tick),
            location: DocumentLocation::Wal {
                logfile: LogfileId::new(1),
                offset: tick * 64,
            },
            size: 64,
        }
    }

    fn create(dir: &Path) -> Collection {
        Collection::create(
            dir,
            DatabaseId::new(1),
            CollectionId::new(2),
            &CollectionDefinition {
                name: "users".to_string(),
                wait_for_sync: false,
                journal_size: 0,
            },
            Arc::new(TickGenerator::new(1000)),
            1 << 20,
        )
        .unwrap()
    }

    fn unique_email() -> IndexDefinition {
        IndexDefinition {
            id: IndexId::new(7),
            fields: vec!["email".to_string()],
            unique: true,
        }
    }

    #[test]
    fn write_checks() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());
        collection
            .apply_document(&payload("a", 1, "a@x"), wal_position(1), IndexMode::Maintain)
            .unwrap();

        assert!(collection.check_write("a", None, WriteKind::Insert).is_err());
        assert!(collection.check_write("b", None, WriteKind::Insert).is_ok());
        assert!(collection
            .check_write("b", None, WriteKind::Replace)
            .unwrap_err()
            .is_not_found());
        assert!(collection.check_write("b", None, WriteKind::Upsert).is_ok());
        assert!(collection.check_write("a", None, WriteKind::Remove).is_ok());
    }

    #[test]
    fn revert_restores_previous_state() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());
        collection.create_index(&unique_email(), Some(&NoWal)).unwrap();

        collection
            .apply_document(&payload("a", 1, "a@x"), wal_position(1), IndexMode::Maintain)
            .unwrap();
        let undo = collection
            .apply_document(&payload("a", 2, "b@x"), wal_position(2), IndexMode::Maintain)
            .unwrap();
        assert_eq!(collection.revision(), Revision::new(2));
        assert_eq!(
            collection.lookup(IndexId::new(7), &[Value::Text("b@x".into())]).unwrap(),
            vec!["a".to_string()]
        );

        collection.revert(undo);
        assert_eq!(collection.position("a").unwrap().tick, Tick::new(1));
        assert_eq!(
            collection.lookup(IndexId::new(7), &[Value::Text("a@x".into())]).unwrap(),
            vec!["a".to_string()]
        );
        assert!(collection
            .lookup(IndexId::new(7), &[Value::Text("b@x".into())])
            .unwrap()
            .is_empty());

        let undo = collection.apply_remove("a", 3, IndexMode::Maintain).unwrap();
        assert!(!collection.contains("a"));
        collection.revert(undo);
        assert!(collection.contains("a"));
    }

    #[test]
    fn unique_index_rejects_second_document() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());
        collection.create_index(&unique_email(), Some(&NoWal)).unwrap();
        collection
            .apply_document(&payload("a", 1, "same@x"), wal_position(1), IndexMode::Maintain)
            .unwrap();

        let err = collection
            .apply_document(&payload("b", 2, "same@x"), wal_position(2), IndexMode::Maintain)
            .unwrap_err();
        assert!(matches!(err, CoreError::UniqueConstraintViolated { index: 7, .. }));
        assert!(!collection.contains("b"));
        assert!(collection
            .check_write("b", Some(&body("same@x")), WriteKind::Insert)
            .is_err());
    }

    #[test]
    fn lock_is_exclusive_and_reentrant() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());
        let t1 = LockOwner::Transaction(TransactionId::new(1));

        collection.lock(t1, Duration::from_millis(10)).unwrap();
        collection.lock(t1, Duration::from_millis(10)).unwrap();
        assert!(!collection.try_lock(LockOwner::Collector, Duration::from_millis(20)));

        collection.unlock(LockOwner::Collector);
        assert_eq!(collection.lock_owner(), Some(t1));
        collection.unlock(t1);
        assert!(collection.try_lock(LockOwner::Collector, Duration::ZERO));
    }

    #[test]
    fn collected_markers_move_to_datafiles() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());

        let mut data = Vec::new();
        let mut operations = Vec::new();
        for (key, tick) in [("a", 10u64), ("b", 11), ("a", 12)] {
            let doc = payload(key, tick, &format!("{key}{tick}@x"));
            let bytes = Marker::document(TransactionId::new(1), &doc)
                .unwrap()
                .encode(Tick::new(tick))
                .unwrap();
            let position = DocumentPosition {
                revision: tick,
                tick: Tick::new(tick),
                location: DocumentLocation::Wal {
                    logfile: LogfileId::new(1),
                    offset: data.len() as u64,
                },
                size: bytes.len() as u64,
            };
            operations.push(CollectorOperation {
                offset: data.len() as u64,
                size: bytes.len() as u64,
                tick: Tick::new(tick),
                marker_type: MarkerType::Document,
                key: Some(key.to_string()),
            });
            data.extend_from_slice(&bytes);
            collection.apply_document(&doc, position, IndexMode::Maintain).unwrap();
            collection.increase_uncollected(1);
        }

        let mut cache = collection
            .transfer_markers(LogfileId::new(1), &data, &operations)
            .unwrap();
        cache.seen = 3;
        assert_eq!(cache.len(), 3);
        assert_eq!(collection.statistics().number_uncollected, 3);
        assert_eq!(collection.max_tick(), Tick::new(12));

        collection.apply_collected(&cache);
        let stats = collection.statistics();
        assert_eq!(stats.number_alive, 2);
        assert_eq!(stats.number_dead, 1);
        assert_eq!(stats.number_uncollected, 0);
        assert_eq!(collection.uncollected(), 0);
        assert!(matches!(
            collection.position("a").unwrap().location,
            DocumentLocation::Datafile { .. }
        ));

        let doc = collection.read_document("a", &NoWal).unwrap().unwrap();
        assert_eq!(doc.rev, 12);
    }

    #[test]
    fn reopen_rebuilds_from_datafiles() {
        let dir = tempdir().unwrap();
        let path = {
            let collection = create(dir.path());
            collection.create_index(&unique_email(), Some(&NoWal)).unwrap();
            let mut data = Vec::new();
            let mut operations = Vec::new();
            for (key, tick, remove) in [("a", 10u64, false), ("b", 11, false), ("b", 12, true)] {
                let bytes = if remove {
                    Marker::remove(
                        TransactionId::new(1),
                        &crate::wal::RemovePayload {
                            key: key.to_string(),
                            rev: tick,
                        },
                    )
                } else {
                    Marker::document(TransactionId::new(1), &payload(key, tick, "x@x"))
                }
                .unwrap()
                .encode(Tick::new(tick))
                .unwrap();
                operations.push(CollectorOperation {
                    offset: data.len() as u64,
                    size: bytes.len() as u64,
                    tick: Tick::new(tick),
                    marker_type: if remove { MarkerType::Remove } else { MarkerType::Document },
                    key: Some(key.to_string()),
                });
                data.extend_from_slice(&bytes);
            }
            collection.transfer_markers(LogfileId::new(1), &data, &operations).unwrap();
            collection.path().to_path_buf()
        };

        let collection = Collection::open(&path, DatabaseId::new(1), Arc::new(TickGenerator::new(0)), 1 << 20).unwrap();
        assert_eq!(collection.name(), "users");
        assert!(collection.contains("a"));
        assert!(!collection.contains("b"));
        assert_eq!(collection.max_tick(), Tick::new(12));
        assert_eq!(collection.revision(), Revision::new(12));
        let stats = collection.statistics();
        assert_eq!(stats.number_alive, 1);
        assert_eq!(stats.number_dead, 1);
        assert_eq!(stats.number_deletions, 1);
        assert_eq!(collection.indexes().len(), 1);
        assert_eq!(
            collection.lookup(IndexId::new(7), &[Value::Text("x@x".into())]).unwrap(),
            vec!["a".to_string()]
        );
    }

    #[test]
    fn rename_and_change_persist() {
        let dir = tempdir().unwrap();
        let collection = create(dir.path());
        collection.rename("people").unwrap();
        collection
            .change(&CollectionDefinition {
                name: "ignored".to_string(),
                wait_for_sync: true,
                journal_size: 4 << 20,
            })
            .unwrap();

        let reopened = Collection::open(collection.path(), DatabaseId::new(1), Arc::new(TickGenerator::new(0)), 1 << 20).unwrap();
        let definition = reopened.definition();
        assert_eq!(definition.name, "people");
        assert!(definition.wait_for_sync);
        assert_eq!(definition.journal_size, 4 << 20);
    }
}
