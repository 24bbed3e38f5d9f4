//! Slot allocator: hands out byte ranges of the open logfile.
//!
//! The allocator owns a fixed ring of slots. A writer reserves a slot (and
//! the slot after it, in case a prologue has to precede its marker), fills
//! the handle's buffer, and returns it. The synchronizer walks returned
//! slots in ring order from the recycle cursor, makes them durable as one
//! region per logfile, and hands the region back, which advances the
//! committed-tick watermark and recycles the slots.
//!
//! ## Invariants
//!
//! - Ticks are assigned under the ring lock, so ring order is tick order
//! - Slots are recycled strictly in ring order; a region never skips a
//!   slot that has not been returned
//! - The committed-tick watermark never decreases
//! - A returned slot holds its marker or a blank marker of the same size;
//!   a slot that could not be written at all stops the watermark

use super::logfile::Logfile;
use super::marker::{Marker, MARKER_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, LogfileId, Tick, TickGenerator};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Default number of wait rounds before `reserve` gives up.
const MAX_RESERVE_ITERATIONS: u32 = 1000;

/// Wait between reservation attempts.
const RESERVE_WAIT: Duration = Duration::from_millis(10);

/// Size of a prologue marker.
pub const PROLOGUE_SIZE: u64 = (MARKER_HEADER_SIZE + 16) as u64;

/// Source of writeable logfiles for the allocator.
///
/// Implemented by the logfile manager. Calls are made without the ring
/// lock held, except for the status notifications.
pub trait LogfileProvider: Send + Sync {
    /// Returns a logfile with at least `min_size` free bytes, waiting for
    /// the allocator thread if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoJournalSpace`] if none became available in time.
    fn writeable_logfile(&self, min_size: u64) -> CoreResult<Arc<Logfile>>;

    /// The header of an empty logfile was written.
    fn logfile_opened(&self, logfile: &Logfile);

    /// The footer of a logfile was written.
    fn seal_requested(&self, logfile: &Logfile);

    /// Asks the synchronizer to run.
    fn signal_sync(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unused,
    Used,
    Returned,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    tick: Tick,
    logfile: Option<Arc<Logfile>>,
    offset: u64,
    size: u64,
    wants_sync: bool,
    seals_logfile: bool,
    carries_data: bool,
    broken: bool,
}

impl Slot {
    fn unused() -> Self {
        Self {
            state: SlotState::Unused,
            tick: Tick::default(),
            logfile: None,
            offset: 0,
            size: 0,
            wants_sync: false,
            seals_logfile: false,
            carries_data: false,
            broken: false,
        }
    }

    fn is_unused(&self) -> bool {
        self.state == SlotState::Unused
    }

    fn assign(&mut self, tick: Tick, logfile: &Arc<Logfile>, offset: u64, size: u64) {
        self.state = SlotState::Used;
        self.tick = tick;
        self.logfile = Some(Arc::clone(logfile));
        self.offset = offset;
        self.size = size;
        self.wants_sync = false;
        self.seals_logfile = false;
        self.carries_data = false;
        self.broken = false;
    }
}

#[derive(Debug)]
struct SlotRing {
    slots: Vec<Slot>,
    handout_index: usize,
    recycle_index: usize,
    logfile: Option<Arc<Logfile>>,
    last_assigned_tick: Tick,
    last_committed_tick: Tick,
    last_committed_data_tick: Tick,
    num_events: u64,
    num_events_sync: u64,
    last_database: DatabaseId,
    last_collection: CollectionId,
}

impl SlotRing {
    fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn advance_handout(&mut self) -> usize {
        let index = self.handout_index;
        self.handout_index = self.next_index(index);
        index
    }
}

/// A prologue that has to be written in front of a reserved marker.
#[derive(Debug)]
struct PrologueWrite {
    index: usize,
    tick: Tick,
    offset: u64,
    bytes: Vec<u8>,
}

/// A header or footer assigned to a slot but not yet written.
#[derive(Debug)]
struct BookkeepingWrite {
    index: usize,
    tick: Tick,
    logfile: Arc<Logfile>,
    offset: u64,
    bytes: Vec<u8>,
}

/// Writes `bytes` into the reserved range at `offset`. Without bytes, or
/// if the write fails, a blank marker of `size` bytes takes their place so
/// readers can step over the range.
///
/// Returns `Ok(None)` if the bytes landed, `Ok(Some(cause))` if the blank
/// did, and `Err(cause)` if nothing could be written.
fn write_or_blank(
    logfile: &Logfile,
    offset: u64,
    tick: Tick,
    size: usize,
    bytes: Option<&[u8]>,
) -> CoreResult<Option<CoreError>> {
    let cause = match bytes {
        Some(bytes) => match logfile.write_at(offset, bytes) {
            Ok(()) => return Ok(None),
            Err(err) => err,
        },
        None => CoreError::internal("slot released without a marker"),
    };
    let blank = Marker::blank(size)
        .and_then(|marker| marker.encode(tick))
        .and_then(|bytes| logfile.write_at(offset, &bytes));
    match blank {
        Ok(()) => {
            warn!(logfile = %logfile.id(), offset, size, error = %cause, "blanked reserved range");
            Ok(Some(cause))
        }
        Err(err) => {
            error!(logfile = %logfile.id(), offset, size, error = %err, "reserved range left unwritten");
            Err(cause)
        }
    }
}

/// A reserved byte range inside the open logfile.
///
/// Fill it with [`SlotHandle::fill`] and hand it back with
/// [`Slots::release`]. Dropping a handle without releasing it stalls the
/// ring.
#[derive(Debug)]
pub struct SlotHandle {
    index: usize,
    tick: Tick,
    logfile: Arc<Logfile>,
    offset: u64,
    buffer: Vec<u8>,
    filled: bool,
    prologue: Option<PrologueWrite>,
}

impl SlotHandle {
    /// Tick assigned to the marker.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Logfile the marker goes to.
    #[must_use]
    pub fn logfile_id(&self) -> LogfileId {
        self.logfile.id()
    }

    /// Offset of the marker inside the logfile.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the reserved range.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if a prologue precedes the marker.
    #[must_use]
    pub fn has_prologue(&self) -> bool {
        self.prologue.is_some()
    }

    /// Encodes `marker` with the assigned tick into the reserved bytes.
    /// A handle released without a successful fill is written as a blank.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker size differs from the reservation.
    pub fn fill(&mut self, marker: &Marker) -> CoreResult<()> {
        self.filled = false;
        marker.encode_into(self.tick, &mut self.buffer)?;
        self.filled = true;
        Ok(())
    }
}

/// Contiguous returned slots of one logfile, ready to be synced.
#[derive(Debug, Clone)]
pub struct SyncRegion {
    logfile: Arc<Logfile>,
    count: usize,
    first_offset: u64,
    end_offset: u64,
    last_tick: Tick,
    last_data_tick: Tick,
    seals_logfile: bool,
    wants_sync: bool,
}

impl SyncRegion {
    /// Logfile covered by the region.
    #[must_use]
    pub fn logfile(&self) -> &Arc<Logfile> {
        &self.logfile
    }

    /// Number of slots in the region.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Always false; empty regions are never produced.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Byte range covered by the region.
    #[must_use]
    pub const fn byte_range(&self) -> (u64, u64) {
        (self.first_offset, self.end_offset)
    }

    /// Highest tick in the region.
    #[must_use]
    pub const fn last_tick(&self) -> Tick {
        self.last_tick
    }

    /// Returns true if the region ends with the footer of its logfile.
    #[must_use]
    pub const fn seals_logfile(&self) -> bool {
        self.seals_logfile
    }

    /// Returns true if a writer asked for this region to be synced.
    #[must_use]
    pub const fn wants_sync(&self) -> bool {
        self.wants_sync
    }
}

/// Result of [`Slots::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A footer was written; the logfile will be sealed.
    Flushed {
        /// The logfile that received the footer.
        logfile: LogfileId,
        /// Tick of the footer.
        tick: Tick,
    },
    /// There was no open logfile with data.
    Empty,
}

/// Watermarks and counters of the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotsState {
    /// Last tick handed out.
    pub last_assigned_tick: Tick,
    /// Highest tick known to be durable.
    pub last_committed_tick: Tick,
    /// Highest durable tick of a data marker.
    pub last_committed_data_tick: Tick,
    /// Markers returned.
    pub num_events: u64,
    /// Markers returned with a sync request.
    pub num_events_sync: u64,
}

/// The slot allocator.
pub struct Slots {
    ring: Mutex<SlotRing>,
    changed: Condvar,
    ticks: Arc<TickGenerator>,
    shutdown: AtomicBool,
    max_iterations: u32,
}

impl Slots {
    /// Creates a ring of `count` slots drawing ticks from `ticks`.
    ///
    /// # Panics
    ///
    /// Never; rings smaller than two slots are rounded up to two.
    #[must_use]
    pub fn new(count: usize, ticks: Arc<TickGenerator>) -> Self {
        let count = count.max(2);
        let slots = (0..count).map(|_| Slot::unused()).collect();
        Self {
            ring: Mutex::new(SlotRing {
                slots,
                handout_index: 0,
                recycle_index: 0,
                logfile: None,
                last_assigned_tick: Tick::default(),
                last_committed_tick: Tick::default(),
                last_committed_data_tick: Tick::default(),
                num_events: 0,
                num_events_sync: 0,
                last_database: DatabaseId::default(),
                last_collection: CollectionId::default(),
            }),
            changed: Condvar::new(),
            ticks,
            shutdown: AtomicBool::new(false),
            max_iterations: MAX_RESERVE_ITERATIONS,
        }
    }

    /// Limits how many wait rounds `reserve` and `flush` make.
    #[must_use]
    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    /// Seeds the watermarks after recovery.
    pub fn set_last_tick(&self, tick: Tick) {
        let mut ring = self.ring.lock();
        ring.last_assigned_tick = ring.last_assigned_tick.max(tick);
        ring.last_committed_tick = ring.last_committed_tick.max(tick);
        ring.last_committed_data_tick = ring.last_committed_data_tick.max(tick);
    }

    /// Makes blocked and future reservations fail with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ring = self.ring.lock();
        self.changed.notify_all();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Assigns the slot at the handout index to a bookkeeping marker.
    fn assign_bookkeeping(
        &self,
        ring: &mut SlotRing,
        logfile: &Arc<Logfile>,
        marker: &Marker,
    ) -> CoreResult<BookkeepingWrite> {
        let tick = self.ticks.next_tick();
        let bytes = marker.encode(tick)?;
        let index = ring.advance_handout();
        let offset = logfile.reserve(bytes.len() as u64);
        logfile.update_ticks(tick);
        ring.last_assigned_tick = tick;

        let slot = &mut ring.slots[index];
        slot.assign(tick, logfile, offset, bytes.len() as u64);
        slot.seals_logfile = marker.marker_type() == super::marker::MarkerType::Footer;
        Ok(BookkeepingWrite {
            index,
            tick,
            logfile: Arc::clone(logfile),
            offset,
            bytes,
        })
    }

    /// Writes an assigned bookkeeping marker with the ring unlocked, then
    /// returns its slot.
    fn write_bookkeeping(
        &self,
        ring: &mut MutexGuard<'_, SlotRing>,
        write: BookkeepingWrite,
    ) -> CoreResult<Tick> {
        let result = MutexGuard::unlocked(ring, || write.logfile.write_at(write.offset, &write.bytes));
        let slot = &mut ring.slots[write.index];
        slot.state = SlotState::Returned;
        slot.broken = result.is_err();
        if let Err(err) = result {
            error!(logfile = %write.logfile.id(), offset = write.offset, error = %err, "bookkeeping marker not written");
            return Err(err);
        }
        Ok(write.tick)
    }

    /// Reserves space for a marker of `size` bytes destined for
    /// `(database_id, collection_id)`.
    ///
    /// A prologue is inserted first whenever the target differs from the
    /// last marker written to the current logfile.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoJournalSpace`] if no slot pair or logfile
    /// space became available, or any error from the provider.
    pub fn reserve(
        &self,
        provider: &dyn LogfileProvider,
        database_id: DatabaseId,
        collection_id: CollectionId,
        size: usize,
    ) -> CoreResult<SlotHandle> {
        let size = size as u64;
        let mut iterations = 0u32;
        let mut ring = self.ring.lock();

        loop {
            if self.is_shutting_down() {
                return Err(CoreError::ShuttingDown);
            }

            let index = ring.handout_index;
            let next = ring.next_index(index);
            if ring.slots[index].is_unused() && ring.slots[next].is_unused() {
                let needs_prologue = !database_id.is_none()
                    && !collection_id.is_none()
                    && (ring.last_database != database_id
                        || ring.last_collection != collection_id);
                let required = size + if needs_prologue { PROLOGUE_SIZE } else { 0 };

                match ring.logfile.clone() {
                    None => {
                        let logfile = MutexGuard::unlocked(&mut ring, || {
                            provider.writeable_logfile(required)
                        })?;
                        if ring.logfile.is_some() {
                            // Another writer installed a logfile meanwhile
                            continue;
                        }
                        let header = if logfile.status() == super::logfile::LogfileStatus::Empty {
                            let marker = Marker::header(logfile.id(), logfile.allocated_size() as u32);
                            let write = self.assign_bookkeeping(&mut ring, &logfile, &marker)?;
                            provider.logfile_opened(&logfile);
                            Some(write)
                        } else {
                            None
                        };
                        debug!(logfile = %logfile.id(), "slot allocator switched logfile");
                        ring.last_database = DatabaseId::default();
                        ring.last_collection = CollectionId::default();
                        ring.logfile = Some(logfile);
                        if let Some(write) = header {
                            self.write_bookkeeping(&mut ring, write)?;
                        }
                        continue;
                    }
                    Some(logfile) if logfile.free_size() < required => {
                        let write = self.assign_bookkeeping(&mut ring, &logfile, &Marker::footer())?;
                        provider.seal_requested(&logfile);
                        ring.logfile = None;
                        self.write_bookkeeping(&mut ring, write)?;
                        provider.signal_sync();
                        continue;
                    }
                    Some(logfile) => {
                        let prologue = if needs_prologue {
                            let prologue_index = ring.advance_handout();
                            let tick = self.ticks.next_tick();
                            let bytes =
                                Marker::prologue(database_id, collection_id).encode(tick)?;
                            let offset = logfile.reserve(PROLOGUE_SIZE);
                            logfile.update_ticks(tick);
                            ring.slots[prologue_index].assign(tick, &logfile, offset, PROLOGUE_SIZE);
                            ring.last_database = database_id;
                            ring.last_collection = collection_id;
                            Some(PrologueWrite {
                                index: prologue_index,
                                tick,
                                offset,
                                bytes,
                            })
                        } else {
                            None
                        };

                        let index = ring.advance_handout();
                        let tick = self.ticks.next_tick();
                        let offset = logfile.reserve(size);
                        logfile.update_ticks(tick);
                        ring.slots[index].assign(tick, &logfile, offset, size);
                        ring.slots[index].carries_data = true;
                        ring.last_assigned_tick = tick;

                        trace!(logfile = %logfile.id(), offset, size, tick = tick.as_u64(), "reserved slot");
                        return Ok(SlotHandle {
                            index,
                            tick,
                            logfile,
                            offset,
                            buffer: vec![0u8; size as usize],
                            filled: false,
                            prologue,
                        });
                    }
                }
            }

            iterations += 1;
            if iterations > self.max_iterations {
                warn!(size, "no free slot pair after waiting, giving up");
                return Err(CoreError::NoJournalSpace);
            }
            provider.signal_sync();
            self.changed.wait_for(&mut ring, RESERVE_WAIT);
        }
    }

    /// Returns a slot.
    ///
    /// The bytes are written to the logfile before the slot is marked
    /// returned. A handle that was never filled, or whose write fails, is
    /// written as a blank marker instead. With `wait_for_sync` the call
    /// blocks until the synchronizer made the marker durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker was not written, or `ShuttingDown`
    /// if the engine stopped while waiting for the sync.
    pub fn release(
        &self,
        provider: &dyn LogfileProvider,
        handle: SlotHandle,
        wake_sync: bool,
        want_sync: bool,
        wait_for_sync: bool,
    ) -> CoreResult<Tick> {
        let logfile = &handle.logfile;
        let prologue = handle.prologue.as_ref().map(|prologue| {
            write_or_blank(logfile, prologue.offset, prologue.tick, prologue.bytes.len(), Some(prologue.bytes.as_slice()))
        });
        let filled = handle.filled.then_some(handle.buffer.as_slice());
        let marker = write_or_blank(logfile, handle.offset, handle.tick, handle.buffer.len(), filled);

        {
            let mut ring = self.ring.lock();
            if let (Some(write), Some(outcome)) = (&handle.prologue, &prologue) {
                let slot = &mut ring.slots[write.index];
                slot.state = SlotState::Returned;
                slot.broken = outcome.is_err();
            }
            let slot = &mut ring.slots[handle.index];
            slot.state = SlotState::Returned;
            slot.broken = marker.is_err();
            slot.wants_sync = want_sync || wait_for_sync;
            ring.num_events += 1;
            if want_sync || wait_for_sync {
                ring.num_events_sync += 1;
            }
        }

        let failure = prologue
            .into_iter()
            .chain(std::iter::once(marker))
            .find_map(|outcome| match outcome {
                Ok(None) => None,
                Ok(Some(err)) | Err(err) => Some(err),
            });
        if let Some(err) = failure {
            provider.signal_sync();
            return Err(err);
        }

        if wake_sync || want_sync || wait_for_sync {
            provider.signal_sync();
        }
        if wait_for_sync {
            self.wait_until_committed(handle.tick, None)?;
        }
        Ok(handle.tick)
    }

    fn wait_until_committed(&self, tick: Tick, timeout: Option<Duration>) -> CoreResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.ring.lock();
        while ring.last_committed_tick < tick {
            if self.is_shutting_down() {
                return Err(CoreError::ShuttingDown);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(RESERVE_WAIT)
                }
                None => RESERVE_WAIT,
            };
            self.changed.wait_for(&mut ring, wait);
        }
        Ok(true)
    }

    /// Waits until `tick` is durable. Returns false on timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` if the engine stops while waiting.
    pub fn wait_for_tick(&self, tick: Tick, timeout: Duration) -> CoreResult<bool> {
        self.wait_until_committed(tick, Some(timeout))
    }

    /// Collects the returned slots at the recycle cursor into one region.
    ///
    /// Only the synchronizer calls this, followed by [`Slots::release_region`].
    #[must_use]
    pub fn sync_region(&self) -> Option<SyncRegion> {
        let ring = self.ring.lock();
        let mut index = ring.recycle_index;
        let mut region: Option<SyncRegion> = None;

        for _ in 0..ring.slots.len() {
            let slot = &ring.slots[index];
            if slot.state != SlotState::Returned || slot.broken {
                break;
            }
            let Some(logfile) = slot.logfile.as_ref() else {
                break;
            };

            match region.as_mut() {
                None => {
                    region = Some(SyncRegion {
                        logfile: Arc::clone(logfile),
                        count: 1,
                        first_offset: slot.offset,
                        end_offset: slot.offset + slot.size,
                        last_tick: slot.tick,
                        last_data_tick: if slot.carries_data {
                            slot.tick
                        } else {
                            Tick::default()
                        },
                        seals_logfile: slot.seals_logfile,
                        wants_sync: slot.wants_sync,
                    });
                }
                Some(current) => {
                    if !Arc::ptr_eq(&current.logfile, logfile) {
                        break;
                    }
                    current.count += 1;
                    current.end_offset = current.end_offset.max(slot.offset + slot.size);
                    current.last_tick = slot.tick;
                    if slot.carries_data {
                        current.last_data_tick = slot.tick;
                    }
                    current.seals_logfile |= slot.seals_logfile;
                    current.wants_sync |= slot.wants_sync;
                }
            }

            if slot.seals_logfile {
                break;
            }
            index = ring.next_index(index);
        }

        region
    }

    /// Recycles the slots of a synced region and advances the watermark.
    pub fn release_region(&self, region: &SyncRegion) {
        let mut ring = self.ring.lock();
        for _ in 0..region.count {
            let index = ring.recycle_index;
            ring.slots[index] = Slot::unused();
            ring.recycle_index = ring.next_index(index);
        }
        if region.last_tick > ring.last_committed_tick {
            ring.last_committed_tick = region.last_tick;
        }
        if region.last_data_tick > ring.last_committed_data_tick {
            ring.last_committed_data_tick = region.last_data_tick;
        }
        self.changed.notify_all();
    }

    /// Seals the current logfile if it holds data.
    ///
    /// # Errors
    ///
    /// Returns `NoJournalSpace` if no slot frees up for the footer, or
    /// `ShuttingDown` while waiting for the sync.
    pub fn flush(&self, provider: &dyn LogfileProvider, wait_for_sync: bool) -> CoreResult<FlushOutcome> {
        let (logfile_id, tick) = {
            let mut ring = self.ring.lock();
            let mut iterations = 0u32;
            loop {
                let Some(logfile) = ring.logfile.clone() else {
                    return Ok(FlushOutcome::Empty);
                };
                if logfile.is_empty_of_data() {
                    return Ok(FlushOutcome::Empty);
                }
                if ring.slots[ring.handout_index].is_unused() {
                    let write = self.assign_bookkeeping(&mut ring, &logfile, &Marker::footer())?;
                    provider.seal_requested(&logfile);
                    ring.logfile = None;
                    let tick = self.write_bookkeeping(&mut ring, write)?;
                    debug!(logfile = %logfile.id(), "flushed logfile");
                    break (logfile.id(), tick);
                }
                iterations += 1;
                if iterations > self.max_iterations {
                    return Err(CoreError::NoJournalSpace);
                }
                provider.signal_sync();
                self.changed.wait_for(&mut ring, RESERVE_WAIT);
            }
        };

        provider.signal_sync();
        if wait_for_sync {
            self.wait_until_committed(tick, None)?;
        }
        Ok(FlushOutcome::Flushed {
            logfile: logfile_id,
            tick,
        })
    }

    /// Id of the logfile currently receiving markers.
    #[must_use]
    pub fn current_logfile(&self) -> Option<LogfileId> {
        self.ring.lock().logfile.as_ref().map(|l| l.id())
    }

    /// Returns true if returned slots wait for the synchronizer.
    #[must_use]
    pub fn has_pending_region(&self) -> bool {
        let ring = self.ring.lock();
        let slot = &ring.slots[ring.recycle_index];
        slot.state == SlotState::Returned && !slot.broken
    }

    /// Watermarks and counters.
    #[must_use]
    pub fn state(&self) -> SlotsState {
        let ring = self.ring.lock();
        SlotsState {
            last_assigned_tick: ring.last_assigned_tick,
            last_committed_tick: ring.last_committed_tick,
            last_committed_data_tick: ring.last_committed_data_tick,
            num_events: ring.num_events,
            num_events_sync: ring.num_events_sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::logfile::LogfileStatus;
    use crate::wal::marker::MarkerType;
    use crate::wal::reader::MarkerReader;
    use docdb_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::sync::mpsc;

    /// In-memory storage whose next `failures` writes fail. With a gate
    /// the first write reports itself and waits for the go-ahead.
    struct ScriptedBackend {
        inner: InMemoryBackend,
        failures: Arc<AtomicU32>,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl StorageBackend for ScriptedBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
            if let Some((entered, proceed)) = self.gate.lock().take() {
                entered.send(()).unwrap();
                proceed.recv_timeout(Duration::from_secs(5)).unwrap();
            }
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(StorageError::Io(std::io::Error::other("write refused")));
            }
            self.inner.write_at(offset, data)
        }

        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.inner.append(data)
        }

        fn allocate(&mut self, len: u64) -> StorageResult<()> {
            self.inner.allocate(len)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }

        fn sync(&mut self) -> StorageResult<()> {
            self.inner.sync()
        }

        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
    }

    fn scripted_logfile(
        size: u64,
        gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    ) -> (Arc<Logfile>, Arc<AtomicU32>) {
        let failures = Arc::new(AtomicU32::new(0));
        let mut inner = InMemoryBackend::new();
        inner.allocate(size).unwrap();
        let backend = ScriptedBackend {
            inner,
            failures: Arc::clone(&failures),
            gate: Mutex::new(gate),
        };
        let logfile = Logfile::with_backend(LogfileId::new(1), None, size, Box::new(backend));
        (Arc::new(logfile), failures)
    }

    struct MemoryProvider {
        logfiles: Mutex<Vec<Arc<Logfile>>>,
        next_id: AtomicU64,
        logfile_size: u64,
    }

    impl MemoryProvider {
        fn new(logfile_size: u64) -> Self {
            Self {
                logfiles: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                logfile_size,
            }
        }

        fn with_logfile(logfile: Arc<Logfile>) -> Self {
            let provider = Self::new(logfile.allocated_size());
            provider.next_id.store(logfile.id().as_u64() + 1, Ordering::SeqCst);
            provider.logfiles.lock().push(logfile);
            provider
        }

        fn logfiles(&self) -> Vec<Arc<Logfile>> {
            self.logfiles.lock().clone()
        }
    }

    impl LogfileProvider for MemoryProvider {
        fn writeable_logfile(&self, min_size: u64) -> CoreResult<Arc<Logfile>> {
            let mut logfiles = self.logfiles.lock();
            if let Some(logfile) = logfiles.iter().find(|l| l.is_writeable(min_size)) {
                return Ok(Arc::clone(logfile));
            }
            let id = LogfileId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            let logfile = Arc::new(Logfile::in_memory(id, self.logfile_size));
            logfiles.push(Arc::clone(&logfile));
            Ok(logfile)
        }

        fn logfile_opened(&self, logfile: &Logfile) {
            logfile.set_status(LogfileStatus::Open);
        }

        fn seal_requested(&self, logfile: &Logfile) {
            logfile.set_status(LogfileStatus::SealRequested);
        }

        fn signal_sync(&self) {}
    }

    fn slots(count: usize) -> Slots {
        Slots::new(count, Arc::new(TickGenerator::new(0)))
    }

    fn sync_all(slots: &Slots) {
        while let Some(region) = slots.sync_region() {
            region.logfile().sync().unwrap();
            if region.seals_logfile() {
                region.logfile().set_status(LogfileStatus::Sealed);
            }
            slots.release_region(&region);
        }
    }

    fn write(
        slots: &Slots,
        provider: &MemoryProvider,
        collection: u64,
        marker: &Marker,
    ) -> Tick {
        let mut handle = slots
            .reserve(provider, DatabaseId::new(1), CollectionId::new(collection), marker.size())
            .unwrap();
        handle.fill(marker).unwrap();
        slots.release(provider, handle, false, false, false).unwrap()
    }

    fn types_in(logfile: &Logfile) -> Vec<MarkerType> {
        let data = logfile.read_used().unwrap();
        MarkerReader::new(&data, "test")
            .map(|m| m.unwrap().1.marker_type())
            .collect()
    }

    #[test]
    fn prologue_precedes_marker_of_new_collection() {
        let provider = MemoryProvider::new(64 * 1024);
        let slots = slots(16);
        let marker = Marker::drop_index(
            DatabaseId::new(1),
            CollectionId::new(7),
            &crate::wal::payload::DropIndexDefinition {
                id: crate::types::IndexId::new(3),
            },
        )
        .unwrap();

        write(&slots, &provider, 7, &marker);
        write(&slots, &provider, 7, &marker);
        write(&slots, &provider, 8, &marker);
        sync_all(&slots);

        let logfile = &provider.logfiles()[0];
        assert_eq!(logfile.status(), LogfileStatus::Open);
        assert_eq!(
            types_in(logfile),
            vec![
                MarkerType::Header,
                MarkerType::Prologue,
                MarkerType::DropIndex,
                MarkerType::DropIndex,
                MarkerType::Prologue,
                MarkerType::DropIndex,
            ]
        );
    }

    #[test]
    fn full_logfile_gets_footer_and_rotates() {
        let provider = MemoryProvider::new(1024);
        let slots = slots(64);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));

        for _ in 0..40 {
            write(&slots, &provider, 2, &marker);
        }
        sync_all(&slots);

        let logfiles = provider.logfiles();
        assert!(logfiles.len() >= 2);
        assert_eq!(logfiles[0].status(), LogfileStatus::Sealed);
        assert_eq!(types_in(&logfiles[0]).last(), Some(&MarkerType::Footer));
        assert_eq!(types_in(&logfiles[1])[0], MarkerType::Header);
        assert!(logfiles[0].used() <= logfiles[0].allocated_size());
    }

    #[test]
    fn ticks_follow_ring_order() {
        let provider = MemoryProvider::new(64 * 1024);
        let slots = slots(16);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));

        let first = write(&slots, &provider, 2, &marker);
        let second = write(&slots, &provider, 2, &marker);
        assert!(second > first);
        assert_eq!(slots.state().last_assigned_tick, second);
        assert_eq!(slots.state().num_events, 2);
    }

    #[test]
    fn reserve_gives_up_without_free_slots() {
        let provider = MemoryProvider::new(64 * 1024);
        let slots = slots(4).with_max_iterations(2);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));

        // Header plus prologue plus marker leaves a single free slot
        let _held = slots
            .reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size())
            .unwrap();
        let result = slots.reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size());
        assert!(matches!(result, Err(CoreError::NoJournalSpace)));
    }

    #[test]
    fn release_waits_for_synchronizer() {
        let provider = Arc::new(MemoryProvider::new(64 * 1024));
        let slots = Arc::new(slots(16));
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));

        let syncer = {
            let slots = Arc::clone(&slots);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    sync_all(&slots);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut handle = slots
            .reserve(provider.as_ref(), DatabaseId::new(1), CollectionId::new(2), marker.size())
            .unwrap();
        handle.fill(&marker).unwrap();
        let tick = slots
            .release(provider.as_ref(), handle, true, true, true)
            .unwrap();
        assert!(slots.state().last_committed_tick >= tick);
        assert!(slots.wait_for_tick(tick, Duration::from_millis(1)).unwrap());
        syncer.join().unwrap();
    }

    #[test]
    fn flush_seals_only_logfiles_with_data() {
        let provider = MemoryProvider::new(64 * 1024);
        let slots = slots(16);
        assert_eq!(slots.flush(&provider, false).unwrap(), FlushOutcome::Empty);

        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));
        write(&slots, &provider, 2, &marker);
        let outcome = slots.flush(&provider, false).unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed { .. }));
        assert_eq!(slots.current_logfile(), None);
        assert_eq!(provider.logfiles()[0].status(), LogfileStatus::SealRequested);

        sync_all(&slots);
        assert_eq!(provider.logfiles()[0].status(), LogfileStatus::Sealed);
    }

    #[test]
    fn unfilled_slot_is_blanked_and_later_markers_survive() {
        let provider = MemoryProvider::new(64 * 1024);
        let slots = slots(16);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));
        write(&slots, &provider, 2, &marker);

        let mut handle = slots
            .reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size())
            .unwrap();
        let too_big = Marker::drop_index(
            DatabaseId::new(1),
            CollectionId::new(2),
            &crate::wal::payload::DropIndexDefinition {
                id: crate::types::IndexId::new(3),
            },
        )
        .unwrap();
        assert!(handle.fill(&too_big).is_err());
        let blank_tick = handle.tick();
        assert!(slots.release(&provider, handle, false, false, false).is_err());

        let last = write(&slots, &provider, 2, &marker);
        sync_all(&slots);

        assert!(slots.state().last_committed_tick >= last);
        assert!(last > blank_tick);
        assert_eq!(
            types_in(&provider.logfiles()[0]),
            vec![
                MarkerType::Header,
                MarkerType::Prologue,
                MarkerType::DropCollection,
                MarkerType::Blank,
                MarkerType::DropCollection,
            ]
        );
    }

    #[test]
    fn failed_write_is_blanked_and_later_markers_survive() {
        let (logfile, failures) = scripted_logfile(64 * 1024, None);
        let provider = MemoryProvider::with_logfile(Arc::clone(&logfile));
        let slots = slots(16);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));
        write(&slots, &provider, 2, &marker);

        let mut handle = slots
            .reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size())
            .unwrap();
        handle.fill(&marker).unwrap();
        failures.store(1, Ordering::SeqCst);
        let err = slots.release(&provider, handle, false, false, false).unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)), "{err:?}");

        let last = write(&slots, &provider, 2, &marker);
        sync_all(&slots);

        assert_eq!(slots.state().last_committed_tick, last);
        assert_eq!(
            types_in(&logfile),
            vec![
                MarkerType::Header,
                MarkerType::Prologue,
                MarkerType::DropCollection,
                MarkerType::Blank,
                MarkerType::DropCollection,
            ]
        );
    }

    #[test]
    fn unwritable_slot_stops_watermark() {
        let (logfile, failures) = scripted_logfile(64 * 1024, None);
        let provider = MemoryProvider::with_logfile(Arc::clone(&logfile));
        let slots = slots(16);
        let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));
        let first = write(&slots, &provider, 2, &marker);

        let mut handle = slots
            .reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size())
            .unwrap();
        handle.fill(&marker).unwrap();
        failures.store(2, Ordering::SeqCst);
        assert!(slots.release(&provider, handle, false, false, false).is_err());

        write(&slots, &provider, 2, &marker);
        sync_all(&slots);
        assert_eq!(slots.state().last_committed_tick, first);
        assert!(!slots.has_pending_region());
    }

    #[test]
    fn header_write_does_not_hold_ring() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let (logfile, _) = scripted_logfile(64 * 1024, Some((entered_tx, proceed_rx)));
        let provider = Arc::new(MemoryProvider::with_logfile(Arc::clone(&logfile)));
        let slots = Arc::new(slots(16));

        let writer = {
            let provider = Arc::clone(&provider);
            let slots = Arc::clone(&slots);
            std::thread::spawn(move || {
                let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));
                write(&slots, &provider, 2, &marker)
            })
        };

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let started = Instant::now();
        assert_eq!(slots.current_logfile(), Some(logfile.id()));
        assert!(!slots.has_pending_region());
        assert!(started.elapsed() < Duration::from_secs(1));
        proceed_tx.send(()).unwrap();

        let tick = writer.join().unwrap();
        sync_all(&slots);
        assert_eq!(slots.state().last_committed_tick, tick);
        assert_eq!(
            types_in(&logfile),
            vec![MarkerType::Header, MarkerType::Prologue, MarkerType::DropCollection]
        );
    }

    #[test]
    fn wait_for_tick_times_out() {
        let slots = slots(4);
        assert!(!slots
            .wait_for_tick(Tick::new(10), Duration::from_millis(20))
            .unwrap());
        slots.set_last_tick(Tick::new(10));
        assert!(slots
            .wait_for_tick(Tick::new(10), Duration::from_millis(20))
            .unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn watermark_tracks_contiguous_returns(order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle()) {
            let provider = MemoryProvider::new(64 * 1024);
            let slots = slots(64);
            let marker = Marker::drop_collection(DatabaseId::new(1), CollectionId::new(2));

            let mut handles: Vec<Option<SlotHandle>> = (0..12)
                .map(|_| {
                    let mut handle = slots
                        .reserve(&provider, DatabaseId::new(1), CollectionId::new(2), marker.size())
                        .unwrap();
                    handle.fill(&marker).unwrap();
                    Some(handle)
                })
                .collect();
            let ticks: Vec<Tick> = handles.iter().map(|h| h.as_ref().unwrap().tick()).collect();

            // Everything before the first handle (header, prologue) is returned already
            sync_all(&slots);
            let mut returned = vec![false; 12];
            let mut previous = slots.state().last_committed_tick;

            for index in order {
                let handle = handles[index].take().unwrap();
                slots.release(&provider, handle, false, false, false).unwrap();
                returned[index] = true;
                sync_all(&slots);

                let watermark = slots.state().last_committed_tick;
                let prefix = returned.iter().take_while(|r| **r).count();
                if prefix > 0 {
                    prop_assert_eq!(watermark, ticks[prefix - 1]);
                } else {
                    prop_assert!(watermark < ticks[0]);
                }
                prop_assert!(watermark >= previous);
                previous = watermark;
            }
            prop_assert_eq!(previous, *ticks.iter().max().unwrap());
        }
    }
}
