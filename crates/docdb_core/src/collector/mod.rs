//! The collector moves surviving markers from sealed logfiles into the
//! datafiles of their collections.
//!
//! ## Phases
//!
//! Every iteration runs two phases:
//!
//! 1. **Collect**: the oldest collectable logfile is scanned once. For every
//!    collection the newest marker per document key is copied into the
//!    collection journal. Once every collection of the logfile is copied the
//!    resulting [`CollectorCache`]s are queued and the logfile is marked
//!    collected.
//! 2. **Apply**: for every queued cache the collection lock is tried with a
//!    bounded wait. On success the primary index is repointed at the copied
//!    markers that are still the newest version and the datafile statistics
//!    are updated. Collections whose lock is busy are retried next time.
//!
//! ## Failures
//!
//! A dropped database or collection is not an error; its markers are
//! discarded. A corrupt marker marks the logfile `CollectionError`. Any
//! other failure puts the logfile back to `Sealed` so the next iteration
//! retries it. Caches copied before the failure are kept and reused by the
//! retry, so no marker is copied twice.

mod cache;
mod scan;

pub use cache::{CollectorCache, CollectorOperation, TransferredMarker};
pub use scan::ScanResult;

use crate::catalog::LockOwner;
use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, LogfileId};
use crate::wal::{Logfile, StopFlag, Worker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest idle wait after repeated `FilesystemFull` errors.
const MAX_INTERVAL: Duration = Duration::from_secs(30);

type StagedCaches = BTreeMap<(DatabaseId, CollectionId), CollectorCache>;

/// The collector and its queue of transferred markers.
pub struct Collector {
    context: Arc<Context>,
    queue: Mutex<BTreeMap<(DatabaseId, CollectionId), VecDeque<CollectorCache>>>,
    /// Caches of logfiles whose collection failed part way.
    staged: Mutex<HashMap<LogfileId, StagedCaches>>,
    pending: AtomicU64,
    halted: AtomicBool,
    worker: Mutex<Option<Worker>>,
    #[cfg(test)]
    refuse_transfer: Mutex<Option<CollectionId>>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("pending", &self.pending_operations())
            .field("running", &self.worker.lock().is_some())
            .finish()
    }
}

impl Collector {
    /// Creates a stopped collector.
    #[must_use]
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            queue: Mutex::new(BTreeMap::new()),
            staged: Mutex::new(HashMap::new()),
            pending: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            worker: Mutex::new(None),
            #[cfg(test)]
            refuse_transfer: Mutex::new(None),
        }
    }

    /// Transferred markers waiting to be applied.
    #[must_use]
    pub fn pending_operations(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns true if caches are waiting to be applied.
    #[must_use]
    pub fn has_queued(&self) -> bool {
        self.queue.lock().values().any(|q| !q.is_empty())
    }

    // === Phase 1 ===

    /// Collects the oldest collectable logfile. Returns false if there was
    /// none.
    ///
    /// # Errors
    ///
    /// Returns the error that made collection fail; the logfile status was
    /// already updated.
    pub fn collect_once(&self) -> CoreResult<bool> {
        let manager = self.context.manager();
        let Some(logfile) = manager.get_collectable_logfile() else {
            return Ok(false);
        };

        manager.set_collection_requested(&logfile);
        match self.collect_logfile(&logfile) {
            Ok(transferred) => {
                manager.set_collection_done(&logfile);
                self.context.stats().record_logfile_collected(transferred);
                info!(logfile = %logfile.id(), transferred, "collected logfile");
                Ok(true)
            }
            Err(err) => {
                let permanent = matches!(err, CoreError::CorruptMarker { .. });
                manager.set_collection_failed(&logfile, permanent);
                Err(err)
            }
        }
    }

    fn collect_logfile(&self, logfile: &Logfile) -> CoreResult<u64> {
        let data = logfile.read_used()?;
        let failed = self.context.transactions().failed_transactions();
        let scan = ScanResult::scan(&data, &logfile.id().to_string(), &failed)?;

        let mut staged = self.staged.lock().remove(&logfile.id()).unwrap_or_default();
        let mut caches = Vec::new();
        if let Err(err) = self.transfer_logfile(logfile, &data, &scan, &mut staged, &mut caches) {
            staged.extend(
                caches
                    .into_iter()
                    .map(|cache| ((cache.database_id, cache.collection_id), cache)),
            );
            debug!(logfile = %logfile.id(), caches = staged.len(), "keeping transferred caches for retry");
            self.staged.lock().insert(logfile.id(), staged);
            return Err(err);
        }
        if !staged.is_empty() {
            debug!(logfile = %logfile.id(), caches = staged.len(), "discarding caches of dropped collections");
        }

        let mut transferred = 0;
        for cache in caches {
            transferred += cache.len() as u64;
            self.enqueue(cache, logfile);
        }

        self.context
            .transactions()
            .unregister_failed_transactions(&scan.aborted);
        Ok(transferred)
    }

    /// Copies the markers of every live collection in `scan` into its
    /// journal, taking caches from `staged` where an earlier attempt
    /// already copied them.
    fn transfer_logfile(
        &self,
        logfile: &Logfile,
        data: &[u8],
        scan: &ScanResult,
        staged: &mut StagedCaches,
        caches: &mut Vec<CollectorCache>,
    ) -> CoreResult<()> {
        for (database_id, collection_id) in scan.collections() {
            if scan.is_dropped(database_id, collection_id) {
                debug!(logfile = %logfile.id(), collection = %collection_id, "skipping dropped collection");
                continue;
            }
            let collection = match self
                .context
                .catalog()
                .database(database_id)
                .and_then(|db| db.collection(collection_id))
            {
                Ok(collection) => collection,
                Err(err) if err.is_not_found() => {
                    debug!(logfile = %logfile.id(), collection = %collection_id, "collection is gone");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(cache) = staged.remove(&(database_id, collection_id)) {
                debug!(logfile = %logfile.id(), collection = %collection_id, "reusing transferred cache");
                caches.push(cache);
                continue;
            }

            #[cfg(test)]
            self.check_refused(collection_id)?;

            let operations = scan.operations(database_id, collection_id);
            let mut cache = collection.transfer_markers(logfile.id(), data, &operations)?;
            cache.seen = scan.seen(database_id, collection_id);
            caches.push(cache);
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_refused(&self, collection_id: CollectionId) -> CoreResult<()> {
        let mut refused = self.refuse_transfer.lock();
        if *refused == Some(collection_id) {
            *refused = None;
            return Err(CoreError::internal(format!("transfer to {collection_id} refused")));
        }
        Ok(())
    }

    fn enqueue(&self, cache: CollectorCache, logfile: &Logfile) {
        logfile.increase_collect_queue();
        let added = cache.len() as u64;
        self.queue
            .lock()
            .entry((cache.database_id, cache.collection_id))
            .or_default()
            .push_back(cache);

        let pending = self.pending.fetch_add(added, Ordering::AcqRel) + added;
        let threshold = self.context.config().throttle_when_pending;
        if threshold > 0 && pending >= threshold && !self.context.manager().is_throttled() {
            self.context.manager().activate_write_throttling();
        }
    }

    // === Phase 2 ===

    /// Applies queued caches whose collection lock can be taken. Returns
    /// the number of caches applied or discarded.
    pub fn process_queue(&self) -> usize {
        let keys: Vec<_> = self.queue.lock().keys().copied().collect();
        let mut processed = 0;
        for (database_id, collection_id) in keys {
            let caches = {
                let mut queue = self.queue.lock();
                match queue.get_mut(&(database_id, collection_id)) {
                    Some(entries) if !entries.is_empty() => std::mem::take(entries),
                    _ => continue,
                }
            };
            processed += self.process_collection(database_id, collection_id, caches);
        }
        self.queue.lock().retain(|_, entries| !entries.is_empty());

        let threshold = self.context.config().throttle_when_pending;
        if self.context.manager().is_throttled() && (threshold == 0 || self.pending_operations() < threshold) {
            self.context.manager().deactivate_write_throttling();
        }
        processed
    }

    fn process_collection(
        &self,
        database_id: DatabaseId,
        collection_id: CollectionId,
        caches: VecDeque<CollectorCache>,
    ) -> usize {
        let collection = match self
            .context
            .catalog()
            .database(database_id)
            .and_then(|db| db.collection(collection_id))
        {
            Ok(collection) => Some(collection),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                error!(collection = %collection_id, error = %err, "cannot resolve collection");
                self.requeue(database_id, collection_id, caches);
                return 0;
            }
        };

        let Some(collection) = collection else {
            debug!(collection = %collection_id, caches = caches.len(), "discarding queue of dropped collection");
            let count = caches.len();
            for cache in caches {
                self.retire(&cache);
            }
            return count;
        };

        if !collection.try_lock(LockOwner::Collector, self.context.config().collector_lock_timeout) {
            debug!(collection = %collection_id, "collection busy, retrying later");
            self.requeue(database_id, collection_id, caches);
            return 0;
        }

        let count = caches.len();
        for cache in caches {
            collection.apply_collected(&cache);
            self.retire(&cache);
        }
        collection.unlock(LockOwner::Collector);
        debug!(collection = %collection_id, caches = count, "applied collector queue");
        count
    }

    fn requeue(&self, database_id: DatabaseId, collection_id: CollectionId, mut caches: VecDeque<CollectorCache>) {
        let mut queue = self.queue.lock();
        let entries = queue.entry((database_id, collection_id)).or_default();
        caches.append(entries);
        *entries = caches;
    }

    fn retire(&self, cache: &CollectorCache) {
        if let Some(logfile) = self.context.manager().get_logfile(cache.logfile_id) {
            logfile.decrease_collect_queue();
        }
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(cache.len() as u64))
            });
    }

    // === Thread ===

    /// Starts the collector thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            self.context.manager().set_collector_running(true);
            let collector = Arc::clone(self);
            *worker = Some(Worker::spawn("docdb-collector", move |stop| collector.run(&stop))?);
        }
        Ok(())
    }

    /// Stops the thread after it drained its queue or ran out of forced
    /// iterations.
    pub fn stop(&self) {
        self.stop_worker();
    }

    /// Stops the thread without draining the queue.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.stop_worker();
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let signal = self.context.manager().collector_signal();
            worker.stop(|| signal.notify());
        }
        self.context.manager().set_collector_running(false);
    }

    fn run(&self, stop: &StopFlag) {
        let base = self.context.config().collector_interval;
        let signal = self.context.manager().collector_signal();
        let mut interval = base;
        let mut forced = 0u32;

        loop {
            if self.halted.load(Ordering::Acquire) {
                break;
            }
            let mut worked = false;
            match self.collect_once() {
                Ok(collected) => {
                    worked |= collected;
                    interval = base;
                }
                Err(CoreError::FilesystemFull) => {
                    interval = (interval * 2).min(MAX_INTERVAL);
                    warn!(?interval, "filesystem full, collector backing off");
                }
                Err(err) => error!(error = %err, "collection failed"),
            }
            worked |= self.process_queue() > 0;

            if stop.is_set() {
                if !self.has_queued() && !worked {
                    break;
                }
                forced += 1;
                if forced >= self.context.config().collector_stop_iterations {
                    if self.has_queued() {
                        warn!(pending = self.pending_operations(), "collector stopping with queued operations");
                    }
                    break;
                }
            }
            if !worked {
                signal.wait(interval);
            }
        }
        debug!("collector thread finished");
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}
