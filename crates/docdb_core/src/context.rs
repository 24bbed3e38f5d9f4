//! Shared state of one storage engine instance.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::CoreResult;
use crate::stats::EngineStats;
use crate::transaction::TransactionManager;
use crate::types::TickGenerator;
use crate::wal::LogfileManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the logfile directory below the engine root.
pub const WAL_DIRECTORY: &str = "journals";

/// Everything the transaction, collector and recovery code share.
///
/// One context exists per open engine; components hold it through an
/// `Arc` instead of reaching for process-wide state.
#[derive(Debug)]
pub struct Context {
    root: PathBuf,
    config: Config,
    ticks: Arc<TickGenerator>,
    revisions: Arc<TickGenerator>,
    stats: Arc<EngineStats>,
    transactions: Arc<TransactionManager>,
    manager: Arc<LogfileManager>,
    catalog: Catalog,
}

impl Context {
    /// Opens the catalog below `root` and creates the logfile manager.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or the catalog
    /// cannot be opened.
    pub fn new(root: &Path, config: Config) -> CoreResult<Self> {
        let ticks = Arc::new(TickGenerator::new(0));
        let revisions = Arc::new(TickGenerator::new(0));
        let stats = Arc::new(EngineStats::new());
        let transactions = Arc::new(TransactionManager::new(Arc::clone(&ticks)));

        let wal_directory = config
            .wal_directory
            .clone()
            .unwrap_or_else(|| root.join(WAL_DIRECTORY));
        let manager = Arc::new(LogfileManager::new(
            config.clone(),
            wal_directory,
            Arc::clone(&ticks),
            Arc::clone(&transactions),
            Arc::clone(&stats),
        )?);
        let catalog = Catalog::open(root, Arc::clone(&ticks), config.journal_size)?;

        Ok(Self {
            root: root.to_path_buf(),
            config,
            ticks,
            revisions,
            stats,
            transactions,
            manager,
            catalog,
        })
    }

    /// Engine root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Generator of ticks and object ids.
    #[must_use]
    pub fn ticks(&self) -> &Arc<TickGenerator> {
        &self.ticks
    }

    /// Generator of document revisions.
    #[must_use]
    pub fn revisions(&self) -> &Arc<TickGenerator> {
        &self.revisions
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Running and failed transactions.
    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// The logfile manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<LogfileManager> {
        &self.manager
    }

    /// Databases and collections.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) fn test_config() -> Config {
        Config::default()
            .logfile_size(1024 * 1024)
            .reserve_logfiles(1)
            .historic_logfiles(0)
            .sync_interval(Duration::from_millis(5))
            .flush_timeout(Duration::from_secs(5))
            .journal_size(1024 * 1024)
            .collector_interval(Duration::from_millis(20))
            .lock_timeout(Duration::from_millis(50))
            .throttle(0, Duration::from_millis(20))
    }

    /// A context whose logfile manager accepts writes.
    pub(crate) fn running_context(dir: &Path) -> Arc<Context> {
        let context = Arc::new(Context::new(dir, test_config()).unwrap());
        context.manager().set_in_recovery(false);
        context.manager().set_allow_writes(true);
        context.manager().start_threads().unwrap();
        context
    }

    #[test]
    fn wal_directory_defaults_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::new(dir.path(), test_config()).unwrap();
        assert_eq!(context.manager().directory(), dir.path().join(WAL_DIRECTORY));
        assert!(context.catalog().databases().is_empty());
        assert_eq!(context.root(), dir.path());
    }
}
