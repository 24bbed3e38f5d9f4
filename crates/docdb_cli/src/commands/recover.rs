//! Recover command implementation.

use docdb_core::{Config, StorageEngine};
use std::path::Path;

/// Runs the recover command.
///
/// Opening the engine replays the logfiles and aborts transactions left
/// open by a crash. The engine is then flushed and shut down cleanly.
pub fn run(path: &Path, ignore_errors: bool, max_errors: u64) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default()
        .create_if_missing(false)
        .ignore_logfile_errors(ignore_errors)
        .max_recovery_errors(max_errors);

    println!("Recovering engine at {:?}", path);
    let engine = StorageEngine::open(path, config)?;
    engine.flush(true, true, false)?;
    let stats = engine.stats();
    let databases = engine.catalog().databases().len();
    let collections = engine.catalog().collections().len();
    engine.shutdown()?;

    println!();
    println!("Recovery summary:");
    println!("  Markers replayed:  {}", stats.recovery_markers_replayed);
    println!("  Replay errors:     {}", stats.recovery_errors);
    println!("  Databases:         {}", databases);
    println!("  Collections:       {}", collections);
    println!("  Logfiles collected: {}", stats.logfiles_collected);
    println!();
    println!("✓ Engine shut down cleanly");

    Ok(())
}
