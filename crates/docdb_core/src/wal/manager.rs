//! Logfile manager: owns the logfiles and drives their lifecycle.
//!
//! ## Status Transitions
//!
//! ```text
//! Empty -> Open -> SealRequested -> Sealed -> Collecting -> Collected
//!                                      ^          |
//!                                      +----------+  (collection failed)
//! ```
//!
//! The slot allocator moves logfiles from `Empty` to `SealRequested`, the
//! synchronizer seals them once the footer is durable, the collector moves
//! them on to `Collected` and the remover deletes them once more than
//! `historic_logfiles` collected files exist.

use super::logfile::{
    Logfile, LogfileScan, LogfileStatus, FOOTER_RESERVE, HEADER_MARKER_SIZE,
};
use super::marker::{Marker, MAX_ENTRY_SIZE};
use super::shutdown::ShutdownInfo;
use super::signal::Signal;
use super::slots::{FlushOutcome, LogfileProvider, Slots, SlotsState, PROLOGUE_SIZE};
use super::worker::{StopFlag, Worker};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::transaction::{RunningTransaction, TransactionManager};
use crate::types::{CollectionId, DatabaseId, LogfileId, Tick, TickGenerator, TransactionId};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Bytes every logfile needs besides its markers.
pub const LOGFILE_OVERHEAD: u64 = HEADER_MARKER_SIZE + FOOTER_RESERVE + PROLOGUE_SIZE;

/// Wait between attempts to find a writeable logfile.
const WRITEABLE_WAIT: Duration = Duration::from_millis(15);

/// Logfiles deleted per remover pass.
const MAX_REMOVALS_PER_PASS: usize = 5;

/// Where a marker ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenMarker {
    /// Tick assigned to the marker.
    pub tick: Tick,
    /// Logfile holding the marker.
    pub logfile_id: LogfileId,
    /// Offset of the marker inside the logfile.
    pub offset: u64,
    /// Size of the marker.
    pub size: u64,
}

/// Id, status and tick range of one logfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogfileRange {
    /// Logfile id.
    pub id: LogfileId,
    /// Current status.
    #[serde(serialize_with = "serialize_status")]
    pub status: LogfileStatus,
    /// Smallest tick.
    pub tick_min: Tick,
    /// Largest tick.
    pub tick_max: Tick,
}

fn serialize_status<S: serde::Serializer>(status: &LogfileStatus, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(status.name())
}

/// A named hold that keeps logfiles with newer ticks from being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierInfo {
    /// Barrier id.
    pub id: u64,
    /// Smallest tick that has to stay available.
    pub min_tick: Tick,
    /// Time left before the barrier expires.
    pub expires_in: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Barrier {
    min_tick: Tick,
    expires: Instant,
}

#[derive(Debug, Default)]
struct LogfileIds {
    last_collected: LogfileId,
    last_sealed: LogfileId,
}

#[derive(Debug, Default)]
struct Workers {
    allocator: Option<Worker>,
    synchronizer: Option<Worker>,
    remover: Option<Worker>,
}

/// Owner of all logfiles and of the slot allocator.
///
/// ## Background Threads
///
/// - **synchronizer**: makes returned slot regions durable and seals
///   logfiles whose footer was synced
/// - **allocator**: keeps `reserve_logfiles` empty logfiles ready and
///   serves explicit requests from writers
/// - **remover**: deletes collected logfiles beyond the retention count
///   and drops expired barriers
///
/// The collector thread lives with the catalog and only talks to the
/// manager through [`LogfileManager::get_collectable_logfile`] and the
/// status setters.
pub struct LogfileManager {
    config: Config,
    directory: PathBuf,
    ticks: Arc<TickGenerator>,
    slots: Slots,
    logfiles: RwLock<BTreeMap<LogfileId, Arc<Logfile>>>,
    ids: Mutex<LogfileIds>,
    collected: Condvar,
    barriers: RwLock<HashMap<u64, Barrier>>,
    transactions: Arc<TransactionManager>,
    stats: Arc<EngineStats>,
    allow_writes: AtomicBool,
    in_recovery: AtomicBool,
    shutting_down: AtomicBool,
    collector_running: AtomicBool,
    throttled: Mutex<bool>,
    throttle_changed: Condvar,
    allocator_request: AtomicU64,
    empty_at_startup: Mutex<Vec<LogfileId>>,
    sync_signal: Signal,
    allocator_signal: Signal,
    remover_signal: Signal,
    collector_signal: Arc<Signal>,
    logfile_created: Signal,
    workers: Mutex<Workers>,
}

impl std::fmt::Debug for LogfileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogfileManager")
            .field("directory", &self.directory)
            .field("logfiles", &self.logfiles.read().len())
            .field("allow_writes", &self.allow_writes.load(Ordering::Relaxed))
            .finish()
    }
}

impl LogfileManager {
    /// Creates a manager for the logfiles in `directory`.
    ///
    /// Writes stay disabled and the manager is in recovery mode until the
    /// engine finishes startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(
        config: Config,
        directory: impl Into<PathBuf>,
        ticks: Arc<TickGenerator>,
        transactions: Arc<TransactionManager>,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        let slots = Slots::new(config.slots as usize, Arc::clone(&ticks));
        Ok(Self {
            config,
            directory,
            ticks,
            slots,
            logfiles: RwLock::new(BTreeMap::new()),
            ids: Mutex::new(LogfileIds::default()),
            collected: Condvar::new(),
            barriers: RwLock::new(HashMap::new()),
            transactions,
            stats,
            allow_writes: AtomicBool::new(false),
            in_recovery: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            collector_running: AtomicBool::new(false),
            throttled: Mutex::new(false),
            throttle_changed: Condvar::new(),
            allocator_request: AtomicU64::new(0),
            empty_at_startup: Mutex::new(Vec::new()),
            sync_signal: Signal::new(),
            allocator_signal: Signal::new(),
            remover_signal: Signal::new(),
            collector_signal: Arc::new(Signal::new()),
            logfile_created: Signal::new(),
            workers: Mutex::new(Workers::default()),
        })
    }

    /// Directory holding the logfiles.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The configuration the manager runs with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The slot allocator.
    #[must_use]
    pub const fn slots(&self) -> &Slots {
        &self.slots
    }

    /// Signal that wakes the collector thread.
    #[must_use]
    pub fn collector_signal(&self) -> Arc<Signal> {
        Arc::clone(&self.collector_signal)
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Applies the state persisted by the previous run.
    pub fn apply_shutdown_info(&self, info: &ShutdownInfo) {
        self.ticks.observe(info.tick.as_u64());
        self.ticks.observe(info.last_sealed.as_u64());
        let mut ids = self.ids.lock();
        ids.last_collected = info.last_collected;
        ids.last_sealed = info.last_sealed.max(info.last_collected);
        debug!(
            last_collected = %ids.last_collected,
            last_sealed = %ids.last_sealed,
            tick = info.tick.as_u64(),
            "applied shutdown info"
        );
    }

    /// Opens every logfile in the directory.
    ///
    /// Files at or below the last collected id are marked collected. Empty
    /// files are remembered and deleted by
    /// [`LogfileManager::remove_empty_logfiles`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CorruptMarker`] for a damaged logfile unless
    /// `ignore_logfile_errors` is set, or an I/O error.
    pub fn inventory(&self) -> CoreResult<Vec<(LogfileId, LogfileScan)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(Logfile::parse_filename) else {
                continue;
            };
            found.push((id, entry.path()));
        }
        found.sort_by_key(|(id, _)| *id);

        let last_collected = self.ids.lock().last_collected;
        let mut scans = Vec::with_capacity(found.len());
        for (id, path) in found {
            let (logfile, scan) =
                Logfile::open_existing(&path, id, self.config.ignore_logfile_errors)?;
            self.ticks.observe(id.as_u64());
            let (_, tick_max) = logfile.tick_range();
            self.ticks.observe(tick_max.as_u64());

            if logfile.status() == LogfileStatus::Empty {
                self.empty_at_startup.lock().push(id);
            } else if id <= last_collected {
                logfile.set_status(LogfileStatus::Collected);
            } else if logfile.status() == LogfileStatus::Sealed {
                let mut ids = self.ids.lock();
                ids.last_sealed = ids.last_sealed.max(id);
            }
            debug!(logfile = %id, status = %logfile.status(), markers = scan.markers, "found logfile");
            self.logfiles.write().insert(id, Arc::new(logfile));
            scans.push((id, scan));
        }
        info!(count = scans.len(), directory = ?self.directory, "logfile inventory done");
        Ok(scans)
    }

    /// Logfiles recovery has to replay, in id order.
    #[must_use]
    pub fn logfiles_for_recovery(&self) -> Vec<Arc<Logfile>> {
        self.logfiles
            .read()
            .values()
            .filter(|l| {
                !matches!(
                    l.status(),
                    LogfileStatus::Empty | LogfileStatus::Collected
                )
            })
            .cloned()
            .collect()
    }

    /// Seals logfiles a crash left open.
    pub fn seal_open_logfiles(&self) {
        let logfiles: Vec<_> = self.logfiles.read().values().cloned().collect();
        for logfile in logfiles {
            if matches!(
                logfile.status(),
                LogfileStatus::Open | LogfileStatus::SealRequested
            ) {
                info!(logfile = %logfile.id(), "force-sealing logfile left open");
                self.set_logfile_sealed(&logfile);
            }
        }
    }

    /// Deletes logfiles the inventory found without any marker.
    pub fn remove_empty_logfiles(&self) {
        let ids = std::mem::take(&mut *self.empty_at_startup.lock());
        for id in ids {
            let Some(logfile) = self.logfiles.write().remove(&id) else {
                continue;
            };
            if let Err(err) = logfile.remove_file() {
                warn!(logfile = %id, error = %err, "cannot remove empty logfile");
            } else {
                debug!(logfile = %id, "removed empty logfile");
            }
        }
    }

    /// Seeds the slot allocator with the highest tick seen so far.
    pub fn set_last_tick(&self, tick: Tick) {
        self.ticks.observe(tick.as_u64());
        self.slots.set_last_tick(tick);
    }

    /// Allows or rejects new markers.
    pub fn set_allow_writes(&self, value: bool) {
        self.allow_writes.store(value, Ordering::Release);
    }

    /// Returns true if markers may be written.
    #[must_use]
    pub fn allows_writes(&self) -> bool {
        self.allow_writes.load(Ordering::Acquire)
    }

    /// Enters or leaves recovery mode.
    pub fn set_in_recovery(&self, value: bool) {
        self.in_recovery.store(value, Ordering::Release);
    }

    /// Returns true while recovery runs.
    #[must_use]
    pub fn is_in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    /// Tells the manager whether a collector thread is running.
    pub fn set_collector_running(&self, value: bool) {
        self.collector_running.store(value, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Writes `marker` for `(database_id, collection_id)` into the log.
    ///
    /// `wake_sync` nudges the synchronizer, `want_sync` marks the slot as
    /// requiring a sync and `wait_until_synced` blocks until the marker is
    /// durable.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ReadOnly`] if writes are disabled
    /// - [`CoreError::DocumentTooLarge`] if the marker can never fit
    /// - [`CoreError::NoJournalSpace`] if no space became available
    pub fn allocate_and_write(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        marker: &Marker,
        wake_sync: bool,
        want_sync: bool,
        wait_until_synced: bool,
    ) -> CoreResult<WrittenMarker> {
        if !self.allows_writes() {
            return Err(CoreError::ReadOnly);
        }
        let size = marker.size() as u64;
        if size > MAX_ENTRY_SIZE {
            return Err(CoreError::DocumentTooLarge {
                size,
                max: MAX_ENTRY_SIZE,
            });
        }
        let max_regular = u64::from(self.config.logfile_size).saturating_sub(LOGFILE_OVERHEAD);
        if !self.config.allow_oversize_entries && size > max_regular {
            return Err(CoreError::DocumentTooLarge {
                size,
                max: max_regular,
            });
        }

        let mut handle = self
            .slots
            .reserve(self, database_id, collection_id, marker.size())?;
        let logfile_id = handle.logfile_id();
        let offset = handle.offset();
        let filled = handle.fill(marker);
        let released = self
            .slots
            .release(self, handle, wake_sync, want_sync, wait_until_synced);
        filled?;
        let tick = released?;

        self.stats.record_marker(size);
        Ok(WrittenMarker {
            tick,
            logfile_id,
            offset,
            size,
        })
    }

    /// Finds or waits for a logfile with `min_size` free bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoJournalSpace`] after `flush_timeout`.
    pub fn get_writeable_logfile(&self, min_size: u64) -> CoreResult<Arc<Logfile>> {
        let deadline = Instant::now() + self.config.flush_timeout;
        let mut iterations = 0u64;

        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(CoreError::ShuttingDown);
            }

            let mut too_small = Vec::new();
            {
                let logfiles = self.logfiles.read();
                for logfile in logfiles.values() {
                    match logfile.status() {
                        LogfileStatus::Open if logfile.free_size() >= min_size => {
                            return Ok(Arc::clone(logfile));
                        }
                        LogfileStatus::Empty => {
                            if logfile.free_size() >= min_size + HEADER_MARKER_SIZE {
                                return Ok(Arc::clone(logfile));
                            }
                            too_small.push(logfile.id());
                        }
                        _ => {}
                    }
                }
            }

            for id in too_small {
                if let Some(logfile) = self.remove_logfile_if(id, LogfileStatus::Empty) {
                    debug!(logfile = %logfile.id(), min_size, "removed empty logfile too small for entry");
                }
            }

            iterations += 1;
            self.allocator_request.fetch_max(min_size, Ordering::AcqRel);
            if iterations % 10 == 1 {
                self.allocator_signal.notify();
            }
            if Instant::now() >= deadline {
                warn!(min_size, iterations, "no writeable logfile within flush timeout");
                return Err(CoreError::NoJournalSpace);
            }
            self.logfile_created.wait(WRITEABLE_WAIT);
        }
    }

    fn remove_logfile_if(&self, id: LogfileId, status: LogfileStatus) -> Option<Arc<Logfile>> {
        let logfile = {
            let mut logfiles = self.logfiles.write();
            match logfiles.get(&id) {
                Some(l) if l.status() == status => logfiles.remove(&id),
                _ => None,
            }
        }?;
        if let Err(err) = logfile.remove_file() {
            warn!(logfile = %id, error = %err, "cannot delete logfile");
        }
        Some(logfile)
    }

    /// Creates a logfile big enough for an entry of `request` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_logfile(&self, request: u64) -> CoreResult<Arc<Logfile>> {
        let regular = u64::from(self.config.logfile_size);
        let size = if request + LOGFILE_OVERHEAD > regular {
            (request + LOGFILE_OVERHEAD).next_multiple_of(8)
        } else {
            regular
        };
        let id = LogfileId::new(self.ticks.next());
        let logfile = Arc::new(Logfile::create(&self.directory, id, size)?);
        self.logfiles.write().insert(id, Arc::clone(&logfile));
        self.stats.record_logfile_created();
        self.logfile_created.notify();
        info!(logfile = %id, size, "created logfile");
        Ok(logfile)
    }

    /// Returns true if enough empty logfiles are ready.
    #[must_use]
    pub fn has_reserve_logfiles(&self) -> bool {
        let empty = self
            .logfiles
            .read()
            .values()
            .filter(|l| l.status() == LogfileStatus::Empty)
            .count();
        empty >= self.config.reserve_logfiles as usize
    }

    /// Returns true if a new logfile for `request` bytes may be created.
    #[must_use]
    pub fn logfile_creation_allowed(&self, request: u64) -> bool {
        if request + LOGFILE_OVERHEAD > u64::from(self.config.logfile_size) {
            return true;
        }
        if self.config.max_open_logfiles == 0 {
            return true;
        }
        let open = self
            .logfiles
            .read()
            .values()
            .filter(|l| {
                matches!(
                    l.status(),
                    LogfileStatus::Open | LogfileStatus::SealRequested
                )
            })
            .count();
        open < self.config.max_open_logfiles as usize
    }

    /// Seals the current logfile.
    ///
    /// With `wait_for_collector` the call also waits until the collector
    /// processed the sealed logfile, bounded by `flush_timeout`. With
    /// `write_shutdown_file` the `SHUTDOWN` file is rewritten afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the footer cannot be written or the sync wait
    /// is interrupted.
    pub fn flush(
        &self,
        wait_for_sync: bool,
        wait_for_collector: bool,
        write_shutdown_file: bool,
    ) -> CoreResult<FlushOutcome> {
        let outcome = self.slots.flush(self, wait_for_sync)?;

        if wait_for_collector {
            let target = match outcome {
                FlushOutcome::Flushed { logfile, .. } => logfile,
                FlushOutcome::Empty => self.ids.lock().last_sealed,
            };
            if !target.is_none() && !self.wait_for_collector(target, self.config.flush_timeout) {
                warn!(logfile = %target, "collector did not reach logfile before timeout");
            }
        }

        if write_shutdown_file {
            self.write_shutdown_info(false)?;
        }
        Ok(outcome)
    }

    /// Waits until `tick` is durable. Returns false on timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine stops while waiting.
    pub fn wait_for_tick(&self, tick: Tick, timeout: Duration) -> CoreResult<bool> {
        self.sync_signal.notify();
        self.slots.wait_for_tick(tick, timeout)
    }

    /// Waits until everything assigned so far is durable.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine stops while waiting.
    pub fn wait_for_sync(&self, max_wait: Duration) -> CoreResult<bool> {
        let target = self.slots.state().last_assigned_tick;
        self.wait_for_tick(target, max_wait)
    }

    /// Waits until logfile `id` was collected. Returns false on timeout or
    /// when no collector runs.
    pub fn wait_for_collector(&self, id: LogfileId, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut ids = self.ids.lock();
        while ids.last_collected < id {
            if !self.collector_running.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.collector_signal.notify();
            let slice = (deadline - now).min(Duration::from_millis(50));
            if self.collected.wait_for(&mut ids, slice).timed_out() {
                trace!(logfile = %id, last_collected = %ids.last_collected, "waiting for collector");
            }
        }
        true
    }

    /// Watermarks and event counters of the slot allocator.
    #[must_use]
    pub fn state(&self) -> SlotsState {
        self.slots.state()
    }

    /// Id, status and tick range of every logfile.
    #[must_use]
    pub fn ranges(&self) -> Vec<LogfileRange> {
        self.logfiles
            .read()
            .values()
            .map(|l| {
                let (tick_min, tick_max) = l.tick_range();
                LogfileRange {
                    id: l.id(),
                    status: l.status(),
                    tick_min,
                    tick_max,
                }
            })
            .collect()
    }

    /// Looks up a logfile.
    #[must_use]
    pub fn get_logfile(&self, id: LogfileId) -> Option<Arc<Logfile>> {
        self.logfiles.read().get(&id).cloned()
    }

    /// Ids of the last collected and last sealed logfile.
    #[must_use]
    pub fn last_ids(&self) -> (LogfileId, LogfileId) {
        let ids = self.ids.lock();
        (ids.last_collected, ids.last_sealed)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Registers a transaction with the logfile ids current at its start.
    ///
    /// Read-only transactions never hold back collection.
    pub fn register_transaction(&self, id: TransactionId, database_id: DatabaseId, read_only: bool) {
        let ids = self.ids.lock();
        self.transactions.register(
            id,
            RunningTransaction {
                database_id,
                last_collected: ids.last_collected,
                last_sealed: (!read_only).then_some(ids.last_sealed),
            },
        );
    }

    /// Unregisters a transaction, remembering it as failed if it aborted.
    pub fn unregister_transaction(&self, id: TransactionId, failed: bool) {
        if failed {
            self.transactions.register_failed(id);
        }
        self.transactions.unregister(id);
    }

    // ------------------------------------------------------------------
    // Collection and removal
    // ------------------------------------------------------------------

    /// Oldest sealed logfile the collector may process. A logfile whose
    /// collection failed or is still in progress blocks all newer ones.
    ///
    /// Logfiles newer than the oldest last-sealed id of a running write
    /// transaction may still receive its markers and are skipped.
    #[must_use]
    pub fn get_collectable_logfile(&self) -> Option<Arc<Logfile>> {
        let min_sealed = self.transactions.min_last_sealed();
        let logfiles = self.logfiles.read();
        for (id, logfile) in logfiles.iter() {
            if min_sealed.is_some_and(|min| *id > min) {
                break;
            }
            match logfile.status() {
                LogfileStatus::Sealed if logfile.can_be_collected() => {
                    return Some(Arc::clone(logfile));
                }
                LogfileStatus::Collected => {}
                // Collection is strictly in id order: nothing passes a
                // logfile that is not collected yet.
                _ => break,
            }
        }
        None
    }

    /// Oldest collected logfile beyond the retention count, if any.
    #[must_use]
    pub fn get_removable_logfile(&self) -> Option<Arc<Logfile>> {
        let min_collected = self.transactions.min_last_collected();
        let min_barrier = self.min_barrier_tick();
        let logfiles = self.logfiles.read();

        let mut removable = 0usize;
        let mut first = None;
        for (id, logfile) in logfiles.iter() {
            if min_collected.is_some_and(|min| *id > min) {
                break;
            }
            if !logfile.can_be_removed() {
                continue;
            }
            let (_, tick_max) = logfile.tick_range();
            if min_barrier.is_some_and(|barrier| tick_max >= barrier) {
                continue;
            }
            removable += 1;
            if first.is_none() {
                first = Some(Arc::clone(logfile));
            }
        }

        if removable > self.config.historic_logfiles as usize {
            first
        } else {
            None
        }
    }

    /// Deletes up to five removable logfiles. Returns how many went.
    pub fn remove_logfiles(&self) -> usize {
        let mut removed = 0;
        while removed < MAX_REMOVALS_PER_PASS {
            let Some(logfile) = self.get_removable_logfile() else {
                break;
            };
            if self
                .remove_logfile_if(logfile.id(), LogfileStatus::Collected)
                .is_none()
            {
                break;
            }
            self.stats.record_logfile_removed();
            info!(logfile = %logfile.id(), "removed collected logfile");
            removed += 1;
        }
        removed
    }

    /// Marks a logfile as being collected.
    pub fn set_collection_requested(&self, logfile: &Logfile) {
        logfile.set_status(LogfileStatus::Collecting);
        debug!(logfile = %logfile.id(), "collection requested");
    }

    /// Marks a logfile as collected and persists the new watermark.
    pub fn set_collection_done(&self, logfile: &Logfile) {
        logfile.set_status(LogfileStatus::Collected);
        {
            let mut ids = self.ids.lock();
            ids.last_collected = ids.last_collected.max(logfile.id());
            self.collected.notify_all();
        }
        debug!(logfile = %logfile.id(), "collection done");

        if !self.is_in_recovery() {
            if let Err(err) = self.write_shutdown_info(false) {
                warn!(error = %err, "cannot write shutdown info after collection");
            }
        }
        self.remover_signal.notify();
    }

    /// Puts a logfile back after a failed collection attempt.
    pub fn set_collection_failed(&self, logfile: &Logfile, permanent: bool) {
        let status = if permanent {
            LogfileStatus::CollectionError
        } else {
            LogfileStatus::Sealed
        };
        logfile.set_status(status);
        self.stats.record_collector_error();
        error!(logfile = %logfile.id(), %status, "collection failed");
    }

    fn set_logfile_sealed(&self, logfile: &Logfile) {
        logfile.set_status(LogfileStatus::Sealed);
        {
            let mut ids = self.ids.lock();
            ids.last_sealed = ids.last_sealed.max(logfile.id());
        }
        debug!(logfile = %logfile.id(), "sealed logfile");
        self.collector_signal.notify();
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Adds a barrier keeping ticks from `min_tick` on for `ttl`.
    pub fn add_barrier(&self, min_tick: Tick, ttl: Duration) -> u64 {
        let id = self.ticks.next();
        self.barriers.write().insert(
            id,
            Barrier {
                min_tick,
                expires: Instant::now() + ttl,
            },
        );
        debug!(barrier = id, tick = min_tick.as_u64(), "added barrier");
        id
    }

    /// Extends a barrier by `ttl` from now. Returns false if unknown.
    pub fn extend_barrier(&self, id: u64, ttl: Duration) -> bool {
        match self.barriers.write().get_mut(&id) {
            Some(barrier) => {
                barrier.expires = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    /// Removes a barrier. Returns false if unknown.
    pub fn remove_barrier(&self, id: u64) -> bool {
        self.barriers.write().remove(&id).is_some()
    }

    /// Currently active barriers.
    #[must_use]
    pub fn barriers(&self) -> Vec<BarrierInfo> {
        let now = Instant::now();
        let mut list: Vec<_> = self
            .barriers
            .read()
            .iter()
            .map(|(id, b)| BarrierInfo {
                id: *id,
                min_tick: b.min_tick,
                expires_in: b.expires.saturating_duration_since(now),
            })
            .collect();
        list.sort_by_key(|b| b.id);
        list
    }

    fn min_barrier_tick(&self) -> Option<Tick> {
        self.barriers.read().values().map(|b| b.min_tick).min()
    }

    fn remove_expired_barriers(&self) {
        let now = Instant::now();
        self.barriers.write().retain(|id, barrier| {
            let keep = barrier.expires > now;
            if !keep {
                debug!(barrier = *id, "barrier expired");
            }
            keep
        });
    }

    // ------------------------------------------------------------------
    // Throttling
    // ------------------------------------------------------------------

    /// Pending collector operations that activate throttling (0 = never).
    #[must_use]
    pub const fn throttle_when_pending(&self) -> u64 {
        self.config.throttle_when_pending
    }

    /// Makes new transactions wait.
    pub fn activate_write_throttling(&self) {
        let mut throttled = self.throttled.lock();
        if !*throttled {
            *throttled = true;
            self.stats.record_throttle_activation();
            info!("write throttling activated");
        }
    }

    /// Lets waiting transactions proceed.
    pub fn deactivate_write_throttling(&self) {
        let mut throttled = self.throttled.lock();
        if *throttled {
            *throttled = false;
            self.throttle_changed.notify_all();
            info!("write throttling deactivated");
        }
    }

    /// Returns true while throttling is active.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        *self.throttled.lock()
    }

    /// Blocks while throttling is active.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WriteThrottleTimeout`] if throttling outlasts
    /// `max_wait`.
    pub fn wait_for_throttle(&self, max_wait: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + max_wait;
        let mut throttled = self.throttled.lock();
        while *throttled {
            if self.throttle_changed.wait_until(&mut throttled, deadline).timed_out() && *throttled {
                return Err(CoreError::WriteThrottleTimeout);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown info
    // ------------------------------------------------------------------

    /// Current bookkeeping as persisted in the `SHUTDOWN` file.
    #[must_use]
    pub fn shutdown_info(&self) -> ShutdownInfo {
        let ids = self.ids.lock();
        ShutdownInfo {
            tick: Tick::new(self.ticks.current()),
            last_collected: ids.last_collected,
            last_sealed: ids.last_sealed,
            shutdown_time: None,
        }
    }

    /// Rewrites the `SHUTDOWN` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_shutdown_info(&self, clean: bool) -> CoreResult<()> {
        self.shutdown_info().write(&self.directory, clean)
    }

    // ------------------------------------------------------------------
    // Background threads
    // ------------------------------------------------------------------

    /// Starts the allocator and the synchronizer.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn start_threads(self: &Arc<Self>) -> CoreResult<()> {
        let mut workers = self.workers.lock();
        if workers.synchronizer.is_none() {
            let manager = Arc::clone(self);
            workers.synchronizer =
                Some(Worker::spawn("docdb-wal-sync", move |stop| manager.synchronizer_loop(&stop))?);
        }
        if workers.allocator.is_none() {
            let manager = Arc::clone(self);
            workers.allocator =
                Some(Worker::spawn("docdb-wal-alloc", move |stop| manager.allocator_loop(&stop))?);
        }
        Ok(())
    }

    /// Starts the remover.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start_remover(self: &Arc<Self>) -> CoreResult<()> {
        let mut workers = self.workers.lock();
        if workers.remover.is_none() {
            let manager = Arc::clone(self);
            workers.remover =
                Some(Worker::spawn("docdb-wal-remove", move |stop| manager.remover_loop(&stop))?);
        }
        Ok(())
    }

    /// Makes returned slots durable. Returns the number of synced regions.
    ///
    /// # Errors
    ///
    /// Returns an error if a sync fails; the region stays pending.
    pub fn sync_pending(&self) -> CoreResult<usize> {
        let mut count = 0;
        while let Some(region) = self.slots.sync_region() {
            region.logfile().sync()?;
            if region.seals_logfile() {
                self.set_logfile_sealed(region.logfile());
            }
            self.slots.release_region(&region);
            self.stats.record_sync();
            count += 1;
        }
        Ok(count)
    }

    fn synchronizer_loop(&self, stop: &StopFlag) {
        loop {
            let synced = match self.sync_pending() {
                Ok(count) => count,
                Err(err) => {
                    error!(error = %err, "synchronizer cannot sync logfile");
                    if stop.is_set() {
                        break;
                    }
                    0
                }
            };
            if stop.is_set() && !self.slots.has_pending_region() {
                break;
            }
            if synced == 0 {
                self.sync_signal.wait(self.config.sync_interval);
            }
        }
    }

    fn allocator_loop(&self, stop: &StopFlag) {
        let mut interval = self.config.allocator_interval;
        while !stop.is_set() {
            let request = self.allocator_request.swap(0, Ordering::AcqRel);
            let needed = if request > 0 {
                self.logfile_creation_allowed(request)
            } else {
                !self.has_reserve_logfiles() && self.logfile_creation_allowed(0)
            };

            if needed {
                match self.create_logfile(request) {
                    Ok(_) => {
                        interval = self.config.allocator_interval;
                        continue;
                    }
                    Err(CoreError::FilesystemFull) => {
                        interval = (interval * 2).min(Duration::from_secs(10));
                        warn!(?interval, "filesystem full, cannot create logfile");
                    }
                    Err(err) => error!(error = %err, "cannot create logfile"),
                }
            }
            self.allocator_signal.wait(interval);
        }
    }

    fn remover_loop(&self, stop: &StopFlag) {
        while !stop.is_set() {
            self.remove_expired_barriers();
            self.remove_logfiles();
            self.remover_signal.wait(self.config.remover_interval);
        }
    }

    /// First shutdown step: stop accepting writes, stop the allocator and
    /// seal the current logfile.
    pub fn begin_shutdown(&self) {
        self.deactivate_write_throttling();
        self.set_allow_writes(false);
        if let Some(worker) = self.workers.lock().allocator.take() {
            worker.stop(|| self.allocator_signal.notify());
        }
        let collector = self.collector_running.load(Ordering::Acquire);
        if let Err(err) = self.flush(true, collector, false) {
            warn!(error = %err, "final flush failed");
        }
    }

    /// Stops the remover.
    pub fn stop_remover(&self) {
        if let Some(worker) = self.workers.lock().remover.take() {
            worker.stop(|| self.remover_signal.notify());
        }
    }

    /// Last shutdown step: stop the synchronizer, close the logfiles and
    /// write the `SHUTDOWN` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown file cannot be written.
    pub fn finish_shutdown(&self) -> CoreResult<()> {
        if let Some(worker) = self.workers.lock().synchronizer.take() {
            worker.stop(|| self.sync_signal.notify());
        }
        if let Err(err) = self.sync_pending() {
            warn!(error = %err, "cannot sync remaining slots");
        }
        self.shutting_down.store(true, Ordering::Release);
        self.slots.shutdown();
        self.write_shutdown_info(true)?;
        self.logfiles.write().clear();
        info!("logfile manager shut down");
        Ok(())
    }

    /// Stops every thread the way a killed process would: nothing is
    /// flushed or sealed and the `SHUTDOWN` file is left alone.
    pub fn halt(&self) {
        self.set_allow_writes(false);
        let workers = std::mem::take(&mut *self.workers.lock());
        if let Some(worker) = workers.allocator {
            worker.stop(|| self.allocator_signal.notify());
        }
        if let Some(worker) = workers.remover {
            worker.stop(|| self.remover_signal.notify());
        }
        if let Some(worker) = workers.synchronizer {
            worker.stop(|| self.sync_signal.notify());
        }
        self.shutting_down.store(true, Ordering::Release);
        self.slots.shutdown();
        self.logfiles.write().clear();
        warn!("logfile manager halted");
    }

    /// Runs every shutdown step of the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown file cannot be written.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        self.begin_shutdown();
        self.stop_remover();
        self.finish_shutdown()
    }
}

impl LogfileProvider for LogfileManager {
    fn writeable_logfile(&self, min_size: u64) -> CoreResult<Arc<Logfile>> {
        self.get_writeable_logfile(min_size)
    }

    fn logfile_opened(&self, logfile: &Logfile) {
        logfile.set_status(LogfileStatus::Open);
        debug!(logfile = %logfile.id(), "opened logfile");
        self.allocator_signal.notify();
    }

    fn seal_requested(&self, logfile: &Logfile) {
        logfile.set_status(LogfileStatus::SealRequested);
        debug!(logfile = %logfile.id(), "seal requested");
    }

    fn signal_sync(&self) {
        self.sync_signal.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::payload::DocumentPayload;
    use crate::wal::reader::MarkerReader;
    use crate::wal::marker::MarkerType;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::default()
            .logfile_size(1024 * 1024)
            .reserve_logfiles(1)
            .historic_logfiles(0)
            .sync_interval(Duration::from_millis(5))
            .flush_timeout(Duration::from_secs(5))
    }

    fn manager(dir: &Path, config: Config) -> Arc<LogfileManager> {
        let ticks = Arc::new(TickGenerator::new(0));
        let transactions = Arc::new(TransactionManager::new(Arc::clone(&ticks)));
        Arc::new(
            LogfileManager::new(config, dir, ticks, transactions, Arc::new(EngineStats::new()))
                .unwrap(),
        )
    }

    fn running(dir: &Path) -> Arc<LogfileManager> {
        let manager = manager(dir, config());
        manager.set_in_recovery(false);
        manager.set_allow_writes(true);
        manager.start_threads().unwrap();
        manager
    }

    fn document(key: &str) -> Marker {
        Marker::document(
            TransactionId::new(1),
            &DocumentPayload {
                key: key.to_string(),
                rev: 1,
                body: ciborium::Value::Null,
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_writes_until_allowed() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), config());
        let err = manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), false, false, false)
            .unwrap_err();
        assert!(matches!(err, CoreError::ReadOnly));
    }

    #[test]
    fn oversize_entry_rejected_when_disabled() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), config().allow_oversize_entries(false));
        manager.set_allow_writes(true);
        let big = Marker::document(
            TransactionId::new(1),
            &DocumentPayload {
                key: "big".to_string(),
                rev: 1,
                body: ciborium::Value::Bytes(vec![7u8; 2 * 1024 * 1024]),
            },
        )
        .unwrap();
        let err = manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &big, false, false, false)
            .unwrap_err();
        assert!(matches!(err, CoreError::DocumentTooLarge { .. }));
    }

    #[test]
    fn write_sync_and_seal() {
        let dir = tempdir().unwrap();
        let manager = running(dir.path());

        let written = manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), true, true, true)
            .unwrap();
        assert!(manager.wait_for_tick(written.tick, Duration::from_secs(1)).unwrap());

        let outcome = manager.flush(true, false, false).unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed { logfile, .. } if logfile == written.logfile_id));

        let logfile = manager.get_logfile(written.logfile_id).unwrap();
        assert_eq!(logfile.status(), LogfileStatus::Sealed);
        assert_eq!(manager.last_ids().1, written.logfile_id);

        let data = logfile.read_used().unwrap();
        let types: Vec<_> = MarkerReader::new(&data, "test")
            .map(|m| m.unwrap().1.marker_type())
            .collect();
        assert_eq!(
            types,
            vec![MarkerType::Header, MarkerType::Prologue, MarkerType::Document, MarkerType::Footer]
        );

        assert_eq!(manager.get_collectable_logfile().map(|l| l.id()), Some(written.logfile_id));
        manager.shutdown().unwrap();
    }

    #[test]
    fn running_write_transaction_blocks_collection() {
        let dir = tempdir().unwrap();
        let manager = running(dir.path());

        manager.register_transaction(TransactionId::new(500), DatabaseId::new(1), false);
        manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), false, false, false)
            .unwrap();
        manager.flush(true, false, false).unwrap();
        assert!(manager.get_collectable_logfile().is_none());

        manager.unregister_transaction(TransactionId::new(500), false);
        assert!(manager.get_collectable_logfile().is_some());
        manager.shutdown().unwrap();
    }

    #[test]
    fn failed_collection_blocks_newer_logfiles() {
        let dir = tempdir().unwrap();
        let manager = running(dir.path());

        let mut ids = Vec::new();
        for key in ["a", "b"] {
            let written = manager
                .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document(key), false, false, false)
                .unwrap();
            manager.flush(true, false, false).unwrap();
            ids.push(written.logfile_id);
        }
        assert!(ids[0] < ids[1]);

        let first = manager.get_collectable_logfile().unwrap();
        assert_eq!(first.id(), ids[0]);
        manager.set_collection_requested(&first);
        assert!(manager.get_collectable_logfile().is_none());

        manager.set_collection_failed(&first, true);
        assert_eq!(first.status(), LogfileStatus::CollectionError);
        assert!(manager.get_collectable_logfile().is_none());
        assert!(manager.last_ids().0 < ids[0]);

        manager.set_collection_failed(&first, false);
        assert_eq!(manager.get_collectable_logfile().map(|l| l.id()), Some(ids[0]));
        manager.shutdown().unwrap();
    }

    #[test]
    fn collector_wait_ends_on_collection_or_deadline() {
        let dir = tempdir().unwrap();
        let manager = running(dir.path());
        let written = manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), false, false, false)
            .unwrap();
        manager.flush(true, false, false).unwrap();
        let target = written.logfile_id;

        assert!(!manager.wait_for_collector(target, Duration::from_millis(20)));

        manager.set_collector_running(true);
        let started = Instant::now();
        assert!(!manager.wait_for_collector(target, Duration::from_millis(120)));
        assert!(started.elapsed() >= Duration::from_millis(120));

        let logfile = manager.get_logfile(target).unwrap();
        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.wait_for_collector(target, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(30));
        manager.set_collection_requested(&logfile);
        manager.set_collection_done(&logfile);
        assert!(waiter.join().unwrap());

        manager.set_collector_running(false);
        manager.shutdown().unwrap();
    }

    #[test]
    fn collected_logfiles_beyond_history_are_removed() {
        let dir = tempdir().unwrap();
        let manager = running(dir.path());

        manager
            .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), false, false, false)
            .unwrap();
        manager.flush(true, false, false).unwrap();
        let logfile = manager.get_collectable_logfile().unwrap();
        manager.set_collection_requested(&logfile);
        manager.set_collection_done(&logfile);

        let barrier = manager.add_barrier(Tick::new(1), Duration::from_secs(60));
        assert!(manager.get_removable_logfile().is_none());
        assert!(manager.remove_barrier(barrier));

        let path = logfile.path().unwrap().to_path_buf();
        assert_eq!(manager.remove_logfiles(), 1);
        assert!(!path.exists());
        assert!(manager.get_logfile(logfile.id()).is_none());
        manager.shutdown().unwrap();
    }

    #[test]
    fn throttle_wait_times_out() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), config());
        manager.wait_for_throttle(Duration::from_millis(1)).unwrap();

        manager.activate_write_throttling();
        assert!(manager.is_throttled());
        let err = manager.wait_for_throttle(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CoreError::WriteThrottleTimeout));

        manager.deactivate_write_throttling();
        manager.wait_for_throttle(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn barriers_expire() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), config());
        let id = manager.add_barrier(Tick::new(10), Duration::from_millis(1));
        assert_eq!(manager.barriers().len(), 1);
        assert!(manager.extend_barrier(id, Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        manager.remove_expired_barriers();
        assert!(manager.barriers().is_empty());
        assert!(!manager.extend_barrier(id, Duration::from_secs(1)));
    }

    #[test]
    fn inventory_after_restart() {
        let dir = tempdir().unwrap();
        let first;
        {
            let manager = running(dir.path());
            first = manager
                .allocate_and_write(DatabaseId::new(1), CollectionId::new(2), &document("a"), false, true, true)
                .unwrap();
            // Crash: leave the logfile open, no shutdown
            manager.halt();
        }

        let manager = manager(dir.path(), config());
        if let Some(info) = ShutdownInfo::read(dir.path()).unwrap() {
            manager.apply_shutdown_info(&info);
        }
        let scans = manager.inventory().unwrap();
        assert!(scans.iter().any(|(id, scan)| *id == first.logfile_id && scan.has_data));
        assert_eq!(
            manager.get_logfile(first.logfile_id).unwrap().status(),
            LogfileStatus::Open
        );
        assert_eq!(manager.logfiles_for_recovery().len(), 1);

        manager.seal_open_logfiles();
        assert_eq!(
            manager.get_logfile(first.logfile_id).unwrap().status(),
            LogfileStatus::Sealed
        );
        manager.remove_empty_logfiles();
        assert!(manager.ranges().iter().all(|r| r.status != LogfileStatus::Empty));
    }
}
