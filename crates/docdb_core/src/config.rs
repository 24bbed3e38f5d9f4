//! Storage engine configuration.

use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted logfile size.
pub const MIN_LOGFILE_SIZE: u32 = 1024 * 1024;

/// Smallest accepted collection journal size.
pub const MIN_JOURNAL_SIZE: u64 = 1024 * 1024;

/// Bounds for the number of slots in the allocator ring.
pub const MIN_SLOTS: u32 = 1024;
/// Upper bound for the number of slots in the allocator ring.
pub const MAX_SLOTS: u32 = 16 * 1024 * 1024;

/// Shortest accepted synchronizer interval.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(5);

/// Smallest non-zero throttling threshold.
pub const MIN_THROTTLE_WHEN_PENDING: u64 = 1024;

/// Configuration for opening a storage engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Directory holding the logfiles. Defaults to `<root>/journals`.
    pub wal_directory: Option<PathBuf>,

    /// Size of each logfile in bytes.
    pub logfile_size: u32,

    /// Number of collected logfiles kept before the remover deletes them.
    pub historic_logfiles: u32,

    /// Number of empty logfiles the allocator keeps ready.
    pub reserve_logfiles: u32,

    /// Maximum number of open or seal-requested logfiles (0 = unlimited).
    pub max_open_logfiles: u32,

    /// Number of slots in the allocator ring.
    pub slots: u32,

    /// How often the synchronizer flushes returned slots.
    pub sync_interval: Duration,

    /// How long a writer waits for a writeable logfile.
    pub flush_timeout: Duration,

    /// Pending collector operations that activate write throttling (0 = never).
    pub throttle_when_pending: u64,

    /// How long `begin` waits while throttling is active.
    pub throttle_wait: Duration,

    /// Whether entries larger than a logfile get a dedicated logfile.
    pub allow_oversize_entries: bool,

    /// Whether corrupt logfile contents are skipped instead of failing startup.
    pub ignore_logfile_errors: bool,

    /// Per-marker recovery errors tolerated before recovery fails.
    pub max_recovery_errors: u64,

    /// Size of each collection journal in bytes.
    pub journal_size: u64,

    /// Idle wait of the collector between iterations.
    pub collector_interval: Duration,

    /// Bounded wait of the collector for a collection lock.
    pub collector_lock_timeout: Duration,

    /// Queue draining iterations the collector runs after shutdown begins.
    pub collector_stop_iterations: u32,

    /// Idle wait of the allocator between checks.
    pub allocator_interval: Duration,

    /// Idle wait of the remover between passes.
    pub remover_interval: Duration,

    /// How long a transaction waits for collection locks.
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            wal_directory: None,
            logfile_size: 32 * 1024 * 1024, // 32 MB
            historic_logfiles: 10,
            reserve_logfiles: 3,
            max_open_logfiles: 0,
            slots: 16384,
            sync_interval: Duration::from_millis(100),
            flush_timeout: Duration::from_secs(15),
            throttle_when_pending: 0, // disabled
            throttle_wait: Duration::from_secs(15),
            allow_oversize_entries: true,
            ignore_logfile_errors: false,
            max_recovery_errors: 0,
            journal_size: 32 * 1024 * 1024, // 32 MB
            collector_interval: Duration::from_secs(1),
            collector_lock_timeout: Duration::from_millis(50),
            collector_stop_iterations: 3,
            allocator_interval: Duration::from_millis(500),
            remover_interval: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Places the logfiles in a separate directory.
    #[must_use]
    pub fn wal_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_directory = Some(path.into());
        self
    }

    /// Sets the logfile size.
    #[must_use]
    pub const fn logfile_size(mut self, size: u32) -> Self {
        self.logfile_size = size;
        self
    }

    /// Sets how many collected logfiles are retained.
    #[must_use]
    pub const fn historic_logfiles(mut self, count: u32) -> Self {
        self.historic_logfiles = count;
        self
    }

    /// Sets how many empty logfiles are kept in reserve.
    #[must_use]
    pub const fn reserve_logfiles(mut self, count: u32) -> Self {
        self.reserve_logfiles = count;
        self
    }

    /// Limits the number of open logfiles.
    #[must_use]
    pub const fn max_open_logfiles(mut self, count: u32) -> Self {
        self.max_open_logfiles = count;
        self
    }

    /// Sets the number of allocator slots.
    #[must_use]
    pub const fn slots(mut self, count: u32) -> Self {
        self.slots = count;
        self
    }

    /// Sets the synchronizer interval.
    #[must_use]
    pub const fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets how long writers wait for logfile space.
    #[must_use]
    pub const fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Sets the throttling threshold and the longest throttled wait.
    #[must_use]
    pub const fn throttle(mut self, when_pending: u64, wait: Duration) -> Self {
        self.throttle_when_pending = when_pending;
        self.throttle_wait = wait;
        self
    }

    /// Sets whether oversize entries are accepted.
    #[must_use]
    pub const fn allow_oversize_entries(mut self, value: bool) -> Self {
        self.allow_oversize_entries = value;
        self
    }

    /// Sets whether corrupt logfile contents are tolerated.
    #[must_use]
    pub const fn ignore_logfile_errors(mut self, value: bool) -> Self {
        self.ignore_logfile_errors = value;
        self
    }

    /// Tolerates any number of recovery errors, or none.
    #[must_use]
    pub const fn ignore_recovery_errors(mut self, value: bool) -> Self {
        self.max_recovery_errors = if value { u64::MAX } else { 0 };
        self
    }

    /// Sets the recovery error budget.
    #[must_use]
    pub const fn max_recovery_errors(mut self, count: u64) -> Self {
        self.max_recovery_errors = count;
        self
    }

    /// Sets the collection journal size.
    #[must_use]
    pub const fn journal_size(mut self, size: u64) -> Self {
        self.journal_size = size;
        self
    }

    /// Sets the collector idle interval.
    #[must_use]
    pub const fn collector_interval(mut self, interval: Duration) -> Self {
        self.collector_interval = interval;
        self
    }

    /// Sets the transaction lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Checks every setting against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> CoreResult<()> {
        if self.logfile_size < MIN_LOGFILE_SIZE {
            return Err(CoreError::invalid_config(format!(
                "logfile_size must be at least {MIN_LOGFILE_SIZE}"
            )));
        }
        if self.journal_size < MIN_JOURNAL_SIZE {
            return Err(CoreError::invalid_config(format!(
                "journal_size must be at least {MIN_JOURNAL_SIZE}"
            )));
        }
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&self.slots) {
            return Err(CoreError::invalid_config(format!(
                "slots must be between {MIN_SLOTS} and {MAX_SLOTS}"
            )));
        }
        if self.reserve_logfiles == 0 {
            return Err(CoreError::invalid_config("reserve_logfiles must be at least 1"));
        }
        if self.sync_interval < MIN_SYNC_INTERVAL {
            return Err(CoreError::invalid_config("sync_interval must be at least 5ms"));
        }
        if self.throttle_when_pending != 0 && self.throttle_when_pending < MIN_THROTTLE_WHEN_PENDING
        {
            return Err(CoreError::invalid_config(format!(
                "throttle_when_pending must be 0 or at least {MIN_THROTTLE_WHEN_PENDING}"
            )));
        }
        if self.collector_stop_iterations == 0 {
            return Err(CoreError::invalid_config(
                "collector_stop_iterations must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.logfile_size, 32 * 1024 * 1024);
        assert_eq!(config.throttle_when_pending, 0);
        assert!(config.allow_oversize_entries);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .logfile_size(MIN_LOGFILE_SIZE)
            .throttle(4096, Duration::from_millis(10))
            .ignore_recovery_errors(true);

        assert!(!config.create_if_missing);
        assert_eq!(config.logfile_size, MIN_LOGFILE_SIZE);
        assert_eq!(config.throttle_when_pending, 4096);
        assert_eq!(config.max_recovery_errors, u64::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(Config::new().logfile_size(4096).validate().is_err());
        assert!(Config::new().slots(16).validate().is_err());
        assert!(Config::new()
            .sync_interval(Duration::from_millis(1))
            .validate()
            .is_err());
        assert!(Config::new()
            .throttle(10, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(Config::new().reserve_logfiles(0).validate().is_err());
    }
}
