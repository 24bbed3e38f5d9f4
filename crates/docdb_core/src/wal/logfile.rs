//! A single WAL logfile.

use super::marker::{Marker, MarkerType, MARKER_HEADER_SIZE};
use super::reader::{MarkerReader, MarkerView};
use crate::error::{CoreError, CoreResult};
use crate::types::{LogfileId, Tick};
use docdb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Bytes kept free in every logfile for the footer that seals it.
pub const FOOTER_RESERVE: u64 = MARKER_HEADER_SIZE as u64;

/// Size of the header marker that opens every logfile.
pub const HEADER_MARKER_SIZE: u64 = (MARKER_HEADER_SIZE + 16) as u64;

/// Lifecycle status of a logfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogfileStatus {
    /// Allocated, nothing written yet.
    Empty,
    /// Receiving markers.
    Open,
    /// Footer written, waiting for the synchronizer.
    SealRequested,
    /// Durable and complete, waiting for the collector.
    Sealed,
    /// Being collected.
    Collecting,
    /// Every surviving marker lives in a datafile.
    Collected,
    /// Collection failed permanently.
    CollectionError,
}

impl LogfileStatus {
    /// Human readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Open => "open",
            Self::SealRequested => "seal-requested",
            Self::Sealed => "sealed",
            Self::Collecting => "collecting",
            Self::Collected => "collected",
            Self::CollectionError => "collection-error",
        }
    }
}

impl fmt::Display for LogfileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What [`Logfile::open_existing`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogfileScan {
    /// Number of valid markers.
    pub markers: u64,
    /// Whether a header marker was found.
    pub has_header: bool,
    /// Whether a footer marker was found.
    pub has_footer: bool,
    /// Whether any marker other than header, footer or prologue exists.
    pub has_data: bool,
}

/// A preallocated, append-only file of markers.
///
/// Space is reserved by the slot allocator through [`Logfile::reserve`] and
/// filled later with [`Logfile::write_at`]; writers never overlap because
/// every reservation is a disjoint range.
pub struct Logfile {
    id: LogfileId,
    path: Option<PathBuf>,
    allocated_size: u64,
    backend: Mutex<Box<dyn StorageBackend>>,
    status: Mutex<LogfileStatus>,
    used: AtomicU64,
    tick_min: AtomicU64,
    tick_max: AtomicU64,
    collect_queue: AtomicU64,
}

impl fmt::Debug for Logfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logfile")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("used", &self.used())
            .field("allocated_size", &self.allocated_size)
            .finish()
    }
}

impl Logfile {
    /// File name of logfile `id`.
    #[must_use]
    pub fn filename(id: LogfileId) -> String {
        format!("logfile-{}.db", id.as_u64())
    }

    /// Parses a logfile id out of a file name.
    #[must_use]
    pub fn parse_filename(name: &str) -> Option<LogfileId> {
        name.strip_prefix("logfile-")?
            .strip_suffix(".db")?
            .parse()
            .ok()
            .map(LogfileId::new)
    }

    /// Creates and preallocates a new logfile in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be allocated.
    pub fn create(dir: &Path, id: LogfileId, size: u64) -> CoreResult<Self> {
        let path = dir.join(Self::filename(id));
        let mut backend = FileBackend::create_new(&path)?;
        if let Err(err) = backend.allocate(size) {
            let _ = std::fs::remove_file(&path);
            return Err(err.into());
        }
        debug!(logfile = %id, size, "created logfile");
        Ok(Self::with_backend(id, Some(path), size, Box::new(backend)))
    }

    /// Creates a logfile that lives only in memory.
    #[must_use]
    pub fn in_memory(id: LogfileId, size: u64) -> Self {
        let mut backend = InMemoryBackend::new();
        // In-memory allocation cannot fail short of an abort
        let _ = backend.allocate(size);
        Self::with_backend(id, None, size, Box::new(backend))
    }

    pub(crate) fn with_backend(
        id: LogfileId,
        path: Option<PathBuf>,
        allocated_size: u64,
        backend: Box<dyn StorageBackend>,
    ) -> Self {
        Self {
            id,
            path,
            allocated_size,
            backend: Mutex::new(backend),
            status: Mutex::new(LogfileStatus::Empty),
            used: AtomicU64::new(0),
            tick_min: AtomicU64::new(0),
            tick_max: AtomicU64::new(0),
            collect_queue: AtomicU64::new(0),
        }
    }

    /// Opens an existing logfile and scans it.
    ///
    /// The status is `Empty` if nothing was written, `Sealed` if a footer
    /// was found and `Open` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or contains a corrupt
    /// marker and `ignore_errors` is false.
    pub fn open_existing(
        path: &Path,
        id: LogfileId,
        ignore_errors: bool,
    ) -> CoreResult<(Self, LogfileScan)> {
        let backend = FileBackend::open_existing(path)?;
        let allocated_size = backend.size()?;
        let logfile = Self::with_backend(id, Some(path.to_path_buf()), allocated_size, Box::new(backend));
        let scan = logfile.scan(ignore_errors)?;
        Ok((logfile, scan))
    }

    fn scan(&self, ignore_errors: bool) -> CoreResult<LogfileScan> {
        let data = {
            let backend = self.backend.lock();
            backend.read_at(0, self.allocated_size as usize)?
        };

        let mut scan = LogfileScan {
            markers: 0,
            has_header: false,
            has_footer: false,
            has_data: false,
        };
        let mut reader = MarkerReader::new(&data, Self::filename(self.id)).ignore_errors(ignore_errors);
        for item in reader.by_ref() {
            let (_, marker) = item?;
            scan.markers += 1;
            match marker.marker_type() {
                MarkerType::Header => scan.has_header = true,
                MarkerType::Footer => scan.has_footer = true,
                other if other.is_data() => scan.has_data = true,
                _ => {}
            }
            self.update_ticks(marker.tick());
        }

        self.used.store(reader.end_offset(), Ordering::Release);
        let status = if scan.markers == 0 {
            LogfileStatus::Empty
        } else if scan.has_footer || reader.corrupt_at().is_some() {
            LogfileStatus::Sealed
        } else {
            LogfileStatus::Open
        };
        self.set_status(status);
        Ok(scan)
    }

    /// Id of the logfile.
    #[must_use]
    pub const fn id(&self) -> LogfileId {
        self.id
    }

    /// Path of the file, `None` for in-memory logfiles.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Allocated size in bytes.
    #[must_use]
    pub const fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> LogfileStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: LogfileStatus) {
        *self.status.lock() = status;
    }

    /// Bytes reserved so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available for markers, keeping room for the footer.
    #[must_use]
    pub fn free_size(&self) -> u64 {
        self.allocated_size
            .saturating_sub(self.used())
            .saturating_sub(FOOTER_RESERVE)
    }

    /// Returns true if the logfile can take a marker of `min_size` bytes.
    #[must_use]
    pub fn is_writeable(&self, min_size: u64) -> bool {
        matches!(self.status(), LogfileStatus::Empty | LogfileStatus::Open)
            && self.free_size() >= min_size
    }

    /// Returns true if the collector may pick this logfile.
    #[must_use]
    pub fn can_be_collected(&self) -> bool {
        self.status() == LogfileStatus::Sealed && self.collect_queue_size() == 0
    }

    /// Returns true if the remover may delete this logfile.
    #[must_use]
    pub fn can_be_removed(&self) -> bool {
        self.status() == LogfileStatus::Collected && self.collect_queue_size() == 0
    }

    /// Returns true if nothing but bookkeeping markers were reserved.
    #[must_use]
    pub fn is_empty_of_data(&self) -> bool {
        self.used() <= HEADER_MARKER_SIZE
    }

    /// Smallest and largest tick written to the logfile.
    #[must_use]
    pub fn tick_range(&self) -> (Tick, Tick) {
        (
            Tick::new(self.tick_min.load(Ordering::Acquire)),
            Tick::new(self.tick_max.load(Ordering::Acquire)),
        )
    }

    pub(crate) fn update_ticks(&self, tick: Tick) {
        let tick = tick.as_u64();
        let _ = self
            .tick_min
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == 0 || tick < current).then_some(tick)
            });
        self.tick_max.fetch_max(tick, Ordering::AcqRel);
    }

    /// Reserves `size` bytes and returns their offset.
    ///
    /// Only the slot allocator calls this, under its ring lock.
    pub(crate) fn reserve(&self, size: u64) -> u64 {
        self.used.fetch_add(size, Ordering::AcqRel)
    }

    /// Writes reserved bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> CoreResult<()> {
        self.backend.lock().write_at(offset, bytes)?;
        Ok(())
    }

    /// Reserves space for `marker` and writes it immediately.
    pub(crate) fn write_marker(&self, marker: &Marker, tick: Tick) -> CoreResult<u64> {
        let bytes = marker.encode(tick)?;
        let offset = self.reserve(bytes.len() as u64);
        self.write_at(offset, &bytes)?;
        self.update_ticks(tick);
        Ok(offset)
    }

    /// Makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Reads the reserved region of the logfile.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_used(&self) -> CoreResult<Vec<u8>> {
        let used = self.used().min(self.allocated_size);
        Ok(self.backend.lock().read_at(0, used as usize)?)
    }

    /// Reads and validates the marker at `offset`, returning its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptMarker`] if the bytes do not form a
    /// valid marker.
    pub fn read_marker(&self, offset: u64) -> CoreResult<Vec<u8>> {
        let backend = self.backend.lock();
        let size_word = backend.read_at(offset, 4)?;
        let size = u32::from_le_bytes([size_word[0], size_word[1], size_word[2], size_word[3]]);
        let bytes = backend.read_at(offset, size as usize)?;
        drop(backend);

        MarkerView::parse(&bytes).map_err(|check| {
            CoreError::corrupt_marker(Self::filename(self.id), offset, format!("{check:?}"))
        })?;
        Ok(bytes)
    }

    /// Pending collector queue entries referencing this logfile.
    #[must_use]
    pub fn collect_queue_size(&self) -> u64 {
        self.collect_queue.load(Ordering::Acquire)
    }

    pub(crate) fn increase_collect_queue(&self) {
        self.collect_queue.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrease_collect_queue(&self) {
        let _ = self
            .collect_queue
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    /// Deletes the file behind the logfile.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove_file(&self) -> CoreResult<()> {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionId, DatabaseId};
    use tempfile::tempdir;

    #[test]
    fn filename_round_trip() {
        let name = Logfile::filename(LogfileId::new(1234));
        assert_eq!(name, "logfile-1234.db");
        assert_eq!(Logfile::parse_filename(&name), Some(LogfileId::new(1234)));
        assert_eq!(Logfile::parse_filename("logfile-x.db"), None);
        assert_eq!(Logfile::parse_filename("datafile-1.db"), None);
    }

    #[test]
    fn reserve_and_write_in_memory() {
        let logfile = Logfile::in_memory(LogfileId::new(1), 4096);
        assert_eq!(logfile.status(), LogfileStatus::Empty);
        assert!(logfile.is_writeable(1024));
        assert_eq!(logfile.free_size(), 4096 - FOOTER_RESERVE);

        logfile
            .write_marker(&Marker::header(LogfileId::new(1), 4096), Tick::new(5))
            .unwrap();
        assert!(logfile.is_empty_of_data());
        let offset = logfile
            .write_marker(
                &Marker::prologue(DatabaseId::new(1), CollectionId::new(2)),
                Tick::new(6),
            )
            .unwrap();
        assert_eq!(offset, 40);
        assert!(!logfile.is_empty_of_data());
        assert_eq!(logfile.tick_range(), (Tick::new(5), Tick::new(6)));

        let bytes = logfile.read_marker(offset).unwrap();
        assert_eq!(bytes.len(), 40);
        assert_eq!(logfile.read_used().unwrap().len(), 80);
    }

    #[test]
    fn writeable_depends_on_status() {
        let logfile = Logfile::in_memory(LogfileId::new(2), 4096);
        logfile.set_status(LogfileStatus::Sealed);
        assert!(!logfile.is_writeable(8));
        assert!(logfile.can_be_collected());

        logfile.increase_collect_queue();
        assert!(!logfile.can_be_collected());
        logfile.set_status(LogfileStatus::Collected);
        assert!(!logfile.can_be_removed());
        logfile.decrease_collect_queue();
        logfile.decrease_collect_queue();
        assert!(logfile.can_be_removed());
    }

    #[test]
    fn open_existing_detects_status() {
        let dir = tempdir().unwrap();

        // Untouched preallocated file
        let empty = Logfile::create(dir.path(), LogfileId::new(10), 4096).unwrap();
        let path = empty.path().unwrap().to_path_buf();
        drop(empty);
        let (logfile, scan) = Logfile::open_existing(&path, LogfileId::new(10), false).unwrap();
        assert_eq!(logfile.status(), LogfileStatus::Empty);
        assert_eq!(scan.markers, 0);

        // Header and data but no footer
        let open = Logfile::create(dir.path(), LogfileId::new(11), 4096).unwrap();
        open.write_marker(&Marker::header(LogfileId::new(11), 4096), Tick::new(1))
            .unwrap();
        open.write_marker(
            &Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2)),
            Tick::new(2),
        )
        .unwrap();
        open.sync().unwrap();
        let path = open.path().unwrap().to_path_buf();
        drop(open);
        let (logfile, scan) = Logfile::open_existing(&path, LogfileId::new(11), false).unwrap();
        assert_eq!(logfile.status(), LogfileStatus::Open);
        assert!(scan.has_header && scan.has_data && !scan.has_footer);
        assert_eq!(logfile.used(), 40 + 40);
        assert_eq!(logfile.tick_range(), (Tick::new(1), Tick::new(2)));

        // Footer present
        let sealed = Logfile::create(dir.path(), LogfileId::new(12), 4096).unwrap();
        sealed
            .write_marker(&Marker::header(LogfileId::new(12), 4096), Tick::new(3))
            .unwrap();
        sealed.write_marker(&Marker::footer(), Tick::new(4)).unwrap();
        let path = sealed.path().unwrap().to_path_buf();
        drop(sealed);
        let (logfile, _) = Logfile::open_existing(&path, LogfileId::new(12), false).unwrap();
        assert_eq!(logfile.status(), LogfileStatus::Sealed);

        logfile.remove_file().unwrap();
        assert!(!path.exists());
    }
}
