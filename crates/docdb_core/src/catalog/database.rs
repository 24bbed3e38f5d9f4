//! A database: its collections, views and compaction blockers.

use super::collection::Collection;
use super::{cleanup_directory, create_directory, read_parameter_file, remove_directory, write_parameter_file};
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, TickGenerator};
use crate::wal::{CollectionDefinition, ViewDefinition};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A view as stored in the database parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewEntry {
    /// View id, from the collection id space.
    pub id: CollectionId,
    /// View properties.
    pub definition: ViewDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseParameters {
    id: DatabaseId,
    name: String,
    #[serde(default)]
    views: Vec<ViewEntry>,
}

/// A database.
#[derive(Debug)]
pub struct Database {
    id: DatabaseId,
    name: String,
    path: PathBuf,
    ticks: Arc<TickGenerator>,
    journal_size: u64,
    collections: RwLock<BTreeMap<CollectionId, Arc<Collection>>>,
    views: RwLock<BTreeMap<CollectionId, ViewDefinition>>,
    blockers: Mutex<BTreeMap<u64, Instant>>,
}

impl Database {
    pub(crate) fn create(
        root: &Path,
        id: DatabaseId,
        name: &str,
        ticks: Arc<TickGenerator>,
        journal_size: u64,
    ) -> CoreResult<Self> {
        let path = root.join(format!("database-{}", id.as_u64()));
        create_directory(
            &path,
            &DatabaseParameters {
                id,
                name: name.to_string(),
                views: Vec::new(),
            },
        )?;
        Self::open(&path, ticks, journal_size)
    }

    pub(crate) fn open(path: &Path, ticks: Arc<TickGenerator>, journal_size: u64) -> CoreResult<Self> {
        let parameters: DatabaseParameters = read_parameter_file(path)?;

        let mut collections = BTreeMap::new();
        for dir in cleanup_directory(path, "collection-")? {
            let collection = Collection::open(&dir, parameters.id, Arc::clone(&ticks), journal_size)?;
            ticks.observe(collection.id().as_u64());
            collections.insert(collection.id(), Arc::new(collection));
        }
        let views = parameters
            .views
            .into_iter()
            .map(|view| {
                ticks.observe(view.id.as_u64());
                (view.id, view.definition)
            })
            .collect();

        Ok(Self {
            id: parameters.id,
            name: parameters.name,
            path: path.to_path_buf(),
            ticks,
            journal_size,
            collections: RwLock::new(collections),
            views: RwLock::new(views),
            blockers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Database id.
    #[must_use]
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Collections ===

    /// All collections in id order.
    #[must_use]
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.collections.read().values().cloned().collect()
    }

    /// Looks up a collection by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn collection(&self, id: CollectionId) -> CoreResult<Arc<Collection>> {
        self.collections
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(id))
    }

    /// Looks up a collection by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn collection_by_name(&self, name: &str) -> CoreResult<Arc<Collection>> {
        self.collections
            .read()
            .values()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::collection_not_found(name))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.collections.read().values().any(|c| c.name() == name)
            || self.views.read().values().any(|v| v.name == name)
    }

    /// Creates collection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if a collection or view already
    /// has the name or id.
    pub fn create_collection(&self, id: CollectionId, definition: &CollectionDefinition) -> CoreResult<Arc<Collection>> {
        if self.name_taken(&definition.name)
            || self.collections.read().contains_key(&id)
            || self.views.read().contains_key(&id)
        {
            return Err(CoreError::duplicate_name(&definition.name));
        }
        let collection = Arc::new(Collection::create(
            &self.path,
            self.id,
            id,
            definition,
            Arc::clone(&self.ticks),
            self.journal_size,
        )?);
        self.collections.write().insert(id, Arc::clone(&collection));
        debug!(database = %self.id, collection = %id, name = %definition.name, "created collection");
        Ok(collection)
    }

    /// Drops collection `id` and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn drop_collection(&self, id: CollectionId) -> CoreResult<()> {
        let collection = self
            .collections
            .write()
            .remove(&id)
            .ok_or_else(|| CoreError::collection_not_found(id))?;
        remove_directory(collection.path())?;
        debug!(database = %self.id, collection = %id, "dropped collection");
        Ok(())
    }

    /// Renames collection `id` and returns its old name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] or
    /// [`CoreError::DuplicateName`].
    pub fn rename_collection(&self, id: CollectionId, name: &str) -> CoreResult<String> {
        let collection = self.collection(id)?;
        let old = collection.name();
        if old == name {
            return Ok(old);
        }
        if self.name_taken(name) {
            return Err(CoreError::duplicate_name(name));
        }
        collection.rename(name)?;
        Ok(old)
    }

    /// Changes the properties of collection `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn change_collection(&self, id: CollectionId, definition: &CollectionDefinition) -> CoreResult<()> {
        self.collection(id)?.change(definition)
    }

    // === Views ===

    /// All views in id order.
    #[must_use]
    pub fn views(&self) -> Vec<ViewEntry> {
        self.views
            .read()
            .iter()
            .map(|(id, definition)| ViewEntry {
                id: *id,
                definition: definition.clone(),
            })
            .collect()
    }

    /// Looks up a view by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] if it does not exist.
    pub fn view(&self, id: CollectionId) -> CoreResult<ViewDefinition> {
        self.views
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::view_not_found(id))
    }

    /// Looks up a view by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] if it does not exist.
    pub fn view_by_name(&self, name: &str) -> CoreResult<ViewEntry> {
        self.views()
            .into_iter()
            .find(|v| v.definition.name == name)
            .ok_or_else(|| CoreError::view_not_found(name))
    }

    /// Creates view `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateName`] if the name or id is taken.
    pub fn create_view(&self, id: CollectionId, definition: &ViewDefinition) -> CoreResult<()> {
        if self.name_taken(&definition.name)
            || self.collections.read().contains_key(&id)
            || self.views.read().contains_key(&id)
        {
            return Err(CoreError::duplicate_name(&definition.name));
        }
        self.update_views(|views| {
            views.insert(id, definition.clone());
            Ok(())
        })
    }

    /// Drops view `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] if it does not exist.
    pub fn drop_view(&self, id: CollectionId) -> CoreResult<()> {
        self.update_views(|views| {
            views
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| CoreError::view_not_found(id))
        })
    }

    /// Replaces the properties of view `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ViewNotFound`] or [`CoreError::DuplicateName`].
    pub fn change_view(&self, id: CollectionId, definition: &ViewDefinition) -> CoreResult<()> {
        let current = self.view(id)?;
        if current.name != definition.name && self.name_taken(&definition.name) {
            return Err(CoreError::duplicate_name(&definition.name));
        }
        self.update_views(|views| {
            views.insert(id, definition.clone());
            Ok(())
        })
    }

    fn update_views(
        &self,
        change: impl FnOnce(&mut BTreeMap<CollectionId, ViewDefinition>) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut views = self.views.write();
        let mut updated = views.clone();
        change(&mut updated)?;
        write_parameter_file(
            &self.path,
            &DatabaseParameters {
                id: self.id,
                name: self.name.clone(),
                views: updated
                    .iter()
                    .map(|(id, definition)| ViewEntry {
                        id: *id,
                        definition: definition.clone(),
                    })
                    .collect(),
            },
        )?;
        *views = updated;
        Ok(())
    }

    // === Compaction blockers ===

    /// Adds a compaction blocker that expires after `ttl` and returns its id.
    pub fn insert_compaction_blocker(&self, ttl: Duration) -> u64 {
        let id = self.ticks.next();
        self.blockers.lock().insert(id, Instant::now() + ttl);
        id
    }

    /// Extends blocker `id`. Returns false if it does not exist.
    pub fn touch_compaction_blocker(&self, id: u64, ttl: Duration) -> bool {
        match self.blockers.lock().get_mut(&id) {
            Some(expires) => {
                *expires = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    /// Removes blocker `id`. Returns false if it does not exist.
    pub fn remove_compaction_blocker(&self, id: u64) -> bool {
        self.blockers.lock().remove(&id).is_some()
    }

    /// Returns true while an unexpired blocker exists. Expired blockers are
    /// dropped.
    #[must_use]
    pub fn has_compaction_blockers(&self) -> bool {
        let now = Instant::now();
        let mut blockers = self.blockers.lock();
        blockers.retain(|_, expires| *expires > now);
        !blockers.is_empty()
    }
}
