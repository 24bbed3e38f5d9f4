//! Per-collection datafiles receiving collected markers.
//!
//! A collection writes into exactly one journal (`journal-<fid>.db`). A
//! full journal gets a footer and is renamed to `datafile-<fid>.db`.
//! Leftover `compaction-<fid>.db` files are deleted on open.

use crate::error::{CoreError, CoreResult};
use crate::types::{DatafileId, LogfileId, Tick, TickGenerator};
use crate::wal::{Marker, MarkerReader, MarkerType, MarkerView, RemovePayload, HEADER_MARKER_SIZE};
use docdb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters kept per datafile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatafileStatistics {
    /// Document markers the primary index points at.
    pub number_alive: u64,
    /// Bytes of alive markers.
    pub size_alive: u64,
    /// Superseded document markers.
    pub number_dead: u64,
    /// Bytes of dead markers.
    pub size_dead: u64,
    /// Markers transferred by the collector but not yet applied.
    pub number_uncollected: u64,
    /// Remove markers.
    pub number_deletions: u64,
}

impl DatafileStatistics {
    /// Adds `other` to `self`.
    pub fn merge(&mut self, other: &Self) {
        self.number_alive += other.number_alive;
        self.size_alive += other.size_alive;
        self.number_dead += other.number_dead;
        self.size_dead += other.size_dead;
        self.number_uncollected += other.number_uncollected;
        self.number_deletions += other.number_deletions;
    }

    /// Moves one marker of `size` bytes from alive to dead.
    pub fn mark_dead(&mut self, size: u64) {
        self.number_alive = self.number_alive.saturating_sub(1);
        self.size_alive = self.size_alive.saturating_sub(size);
        self.number_dead += 1;
        self.size_dead += size;
    }

    /// Moves one marker of `size` bytes from dead back to alive.
    pub fn mark_alive(&mut self, size: u64) {
        self.number_dead = self.number_dead.saturating_sub(1);
        self.size_dead = self.size_dead.saturating_sub(size);
        self.number_alive += 1;
        self.size_alive += size;
    }
}

/// Role of a file in the collection directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatafileKind {
    /// Receives new markers.
    Journal,
    /// Sealed, read-only.
    Datafile,
}

impl DatafileKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Datafile => "datafile",
        }
    }

    /// File name for datafile `id` of this kind.
    #[must_use]
    pub fn filename(self, id: DatafileId) -> String {
        format!("{}-{}.db", self.prefix(), id.as_u64())
    }

    /// Parses a datafile name.
    #[must_use]
    pub fn parse(name: &str) -> Option<(Self, DatafileId)> {
        let (kind, rest) = if let Some(rest) = name.strip_prefix("journal-") {
            (Self::Journal, rest)
        } else if let Some(rest) = name.strip_prefix("datafile-") {
            (Self::Datafile, rest)
        } else {
            return None;
        };
        let id = rest.strip_suffix(".db")?.parse().ok()?;
        Some((kind, DatafileId::new(id)))
    }
}

/// A document or remove marker found while opening a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedMarker {
    /// File holding the marker.
    pub datafile: DatafileId,
    /// Offset of the marker.
    pub offset: u64,
    /// Size of the marker.
    pub size: u64,
    /// Tick of the marker.
    pub tick: Tick,
    /// Document key.
    pub key: String,
    /// Document revision.
    pub revision: u64,
    /// Whether this is a remove marker.
    pub is_remove: bool,
}

struct Datafile {
    kind: DatafileKind,
    path: PathBuf,
    backend: FileBackend,
    statistics: DatafileStatistics,
}

/// The datafiles of one collection.
pub struct DatafileStore {
    directory: PathBuf,
    journal_size: u64,
    ticks: Arc<TickGenerator>,
    files: BTreeMap<DatafileId, Datafile>,
    journal: Option<DatafileId>,
}

impl std::fmt::Debug for DatafileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatafileStore")
            .field("directory", &self.directory)
            .field("files", &self.files.len())
            .field("journal", &self.journal)
            .finish()
    }
}

impl DatafileStore {
    /// Opens the datafiles in `directory` and returns their document and
    /// remove markers in file order.
    ///
    /// A torn tail in the journal is cut off. Sealed datafiles must be
    /// intact.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptMarker`] for a damaged datafile, or an
    /// I/O error.
    pub fn open(
        directory: &Path,
        journal_size: u64,
        ticks: Arc<TickGenerator>,
    ) -> CoreResult<(Self, Vec<ScannedMarker>)> {
        let mut store = Self {
            directory: directory.to_path_buf(),
            journal_size,
            ticks,
            files: BTreeMap::new(),
            journal: None,
        };

        let mut found = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("compaction-") {
                warn!(file = name, "removing leftover compaction file");
                fs::remove_file(entry.path())?;
                continue;
            }
            if let Some((kind, id)) = DatafileKind::parse(name) {
                found.push((id, kind, entry.path()));
            }
        }
        found.sort_by_key(|(id, _, _)| *id);

        let mut markers = Vec::new();
        for (id, kind, path) in found {
            let mut backend = FileBackend::open_existing(&path)?;
            let data = backend.read_at(0, backend.size()? as usize)?;
            let name = kind.filename(id);

            let mut reader = MarkerReader::new(&data, name.clone()).ignore_errors(kind == DatafileKind::Journal);
            for item in reader.by_ref() {
                let (offset, marker) = item?;
                if !marker.marker_type().is_document_operation() {
                    continue;
                }
                let payload: RemovePayload = marker.decode()?;
                markers.push(ScannedMarker {
                    datafile: id,
                    offset,
                    size: marker.size() as u64,
                    tick: marker.tick(),
                    key: payload.key,
                    revision: payload.rev,
                    is_remove: marker.marker_type() == MarkerType::Remove,
                });
                store.ticks.observe(marker.tick().as_u64());
            }
            if kind == DatafileKind::Journal && reader.end_offset() < data.len() as u64 {
                warn!(file = %name, end = reader.end_offset(), "cutting torn journal tail");
                backend.truncate(reader.end_offset())?;
            }
            store.ticks.observe(id.as_u64());

            if kind == DatafileKind::Journal {
                if let Some(previous) = store.journal.replace(id) {
                    // Only the newest journal stays writeable
                    store.seal(previous)?;
                }
            }
            store.files.insert(
                id,
                Datafile {
                    kind,
                    path,
                    backend,
                    statistics: DatafileStatistics::default(),
                },
            );
        }
        Ok((store, markers))
    }

    /// Directory of the collection.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Changes the size of future journals.
    pub fn set_journal_size(&mut self, size: u64) {
        self.journal_size = size;
    }

    /// Ids of all files, oldest first.
    #[must_use]
    pub fn datafile_ids(&self) -> Vec<DatafileId> {
        self.files.keys().copied().collect()
    }

    /// Kind of file `id`.
    #[must_use]
    pub fn kind(&self, id: DatafileId) -> Option<DatafileKind> {
        self.files.get(&id).map(|f| f.kind)
    }

    /// Appends a complete marker to the journal, starting a new journal if
    /// the current one is full. Returns where the marker went.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn append(&mut self, bytes: &[u8]) -> CoreResult<(DatafileId, u64)> {
        let needed = bytes.len() as u64 + HEADER_MARKER_SIZE;
        let id = match self.journal {
            Some(id) if self.has_room(id, bytes.len() as u64) => id,
            Some(id) => {
                self.seal(id)?;
                self.create_journal(needed)?
            }
            None => self.create_journal(needed)?,
        };
        let file = self
            .files
            .get_mut(&id)
            .ok_or_else(|| CoreError::internal(format!("journal {id} vanished")))?;
        let offset = file.backend.append(bytes)?;
        Ok((id, offset))
    }

    fn has_room(&self, id: DatafileId, len: u64) -> bool {
        self.files.get(&id).is_some_and(|f| {
            let used = f.backend.size().unwrap_or(u64::MAX);
            used <= HEADER_MARKER_SIZE || used + len + FOOTER_SIZE <= self.journal_size
        })
    }

    fn create_journal(&mut self, min_size: u64) -> CoreResult<DatafileId> {
        let id = DatafileId::new(self.ticks.next());
        let path = self.directory.join(DatafileKind::Journal.filename(id));
        let mut backend = FileBackend::create_new(&path)?;
        let size = self.journal_size.max(min_size);
        let header = Marker::header(LogfileId::new(id.as_u64()), u32::try_from(size).unwrap_or(u32::MAX));
        backend.append(&header.encode(self.ticks.next_tick())?)?;
        backend.sync()?;
        debug!(datafile = %id, directory = ?self.directory, "created journal");
        self.files.insert(
            id,
            Datafile {
                kind: DatafileKind::Journal,
                path,
                backend,
                statistics: DatafileStatistics::default(),
            },
        );
        self.journal = Some(id);
        Ok(id)
    }

    /// Writes the footer into journal `id` and renames it to a datafile.
    fn seal(&mut self, id: DatafileId) -> CoreResult<()> {
        let tick = self.ticks.next_tick();
        let Some(file) = self.files.get_mut(&id) else {
            return Ok(());
        };
        file.backend.append(&Marker::footer().encode(tick)?)?;
        file.backend.sync()?;
        let target = self.directory.join(DatafileKind::Datafile.filename(id));
        fs::rename(&file.path, &target)?;
        file.path = target;
        file.kind = DatafileKind::Datafile;
        if self.journal == Some(id) {
            self.journal = None;
        }
        info!(datafile = %id, directory = ?self.directory, "sealed journal");
        Ok(())
    }

    /// Makes the journal durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> CoreResult<()> {
        if let Some(id) = self.journal {
            if let Some(file) = self.files.get_mut(&id) {
                file.backend.sync()?;
            }
        }
        Ok(())
    }

    /// Reads and validates the marker at `offset` of file `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptMarker`] if the bytes are not a valid
    /// marker, or an error if the file is unknown.
    pub fn read_marker(&self, id: DatafileId, offset: u64) -> CoreResult<Vec<u8>> {
        let file = self
            .files
            .get(&id)
            .ok_or_else(|| CoreError::internal(format!("unknown datafile {id}")))?;
        let word = file.backend.read_at(offset, 4)?;
        let size = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        let bytes = file.backend.read_at(offset, size as usize)?;
        MarkerView::parse(&bytes).map_err(|check| {
            CoreError::corrupt_marker(file.kind.filename(id), offset, format!("{check:?}"))
        })?;
        Ok(bytes)
    }

    /// Statistics of file `id`.
    #[must_use]
    pub fn statistics(&self, id: DatafileId) -> Option<DatafileStatistics> {
        self.files.get(&id).map(|f| f.statistics)
    }

    /// Mutable statistics of file `id`.
    pub fn statistics_mut(&mut self, id: DatafileId) -> Option<&mut DatafileStatistics> {
        self.files.get_mut(&id).map(|f| &mut f.statistics)
    }

    /// Statistics summed over all files.
    #[must_use]
    pub fn total_statistics(&self) -> DatafileStatistics {
        let mut total = DatafileStatistics::default();
        for file in self.files.values() {
            total.merge(&file.statistics);
        }
        total
    }
}

/// Size of the footer that seals a journal.
const FOOTER_SIZE: u64 = crate::wal::FOOTER_RESERVE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use crate::wal::DocumentPayload;
    use ciborium::Value;
    use tempfile::tempdir;

    fn document(key: &str, tick: u64) -> Vec<u8> {
        Marker::document(
            TransactionId::new(1),
            &DocumentPayload {
                key: key.to_string(),
                rev: tick,
                body: Value::Text("x".repeat(100)),
            },
        )
        .unwrap()
        .encode(Tick::new(tick))
        .unwrap()
    }

    #[test]
    fn filenames_round_trip() {
        assert_eq!(DatafileKind::Journal.filename(DatafileId::new(12)), "journal-12.db");
        assert_eq!(
            DatafileKind::parse("datafile-9.db"),
            Some((DatafileKind::Datafile, DatafileId::new(9)))
        );
        assert_eq!(DatafileKind::parse("logfile-9.db"), None);
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        let ticks = Arc::new(TickGenerator::new(1000));
        let (mut store, markers) = DatafileStore::open(dir.path(), 1 << 20, Arc::clone(&ticks)).unwrap();
        assert!(markers.is_empty());

        let (fid, offset) = store.append(&document("a", 5)).unwrap();
        assert_eq!(offset, HEADER_MARKER_SIZE);
        assert_eq!(store.kind(fid), Some(DatafileKind::Journal));
        let bytes = store.read_marker(fid, offset).unwrap();
        assert_eq!(bytes, document("a", 5));
        store.sync().unwrap();
        drop(store);

        let (_, markers) = DatafileStore::open(dir.path(), 1 << 20, ticks).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].key, "a");
        assert_eq!(markers[0].tick, Tick::new(5));
        assert!(!markers[0].is_remove);
    }

    #[test]
    fn full_journal_is_sealed() {
        let dir = tempdir().unwrap();
        let ticks = Arc::new(TickGenerator::new(1000));
        let (mut store, _) = DatafileStore::open(dir.path(), 512, ticks).unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(store.append(&document(&format!("k{i}"), i + 1)).unwrap().0);
        }
        ids.dedup();
        assert!(ids.len() > 1);
        assert_eq!(store.kind(ids[0]), Some(DatafileKind::Datafile));
        assert!(dir.path().join(DatafileKind::Datafile.filename(ids[0])).exists());
        assert_eq!(store.kind(*ids.last().unwrap()), Some(DatafileKind::Journal));
    }

    #[test]
    fn torn_journal_tail_is_cut() {
        let dir = tempdir().unwrap();
        let ticks = Arc::new(TickGenerator::new(1000));
        let (mut store, _) = DatafileStore::open(dir.path(), 1 << 20, Arc::clone(&ticks)).unwrap();
        let (fid, _) = store.append(&document("a", 5)).unwrap();
        let partial = document("b", 6);
        store.append(&partial[..30]).unwrap();
        drop(store);

        let (store, markers) = DatafileStore::open(dir.path(), 1 << 20, ticks).unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(store.kind(fid), Some(DatafileKind::Journal));
    }

    #[test]
    fn statistics_transitions() {
        let mut stats = DatafileStatistics {
            number_alive: 2,
            size_alive: 200,
            ..Default::default()
        };
        stats.mark_dead(100);
        assert_eq!((stats.number_alive, stats.number_dead, stats.size_dead), (1, 1, 100));
        stats.mark_alive(100);
        assert_eq!(stats.number_alive, 2);
        assert_eq!(stats.size_dead, 0);
    }
}
