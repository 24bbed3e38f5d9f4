//! Inspect command implementation.

use super::logfiles;
use docdb_core::wal::{Logfile, ShutdownInfo};
use docdb_core::{EngineDir, WAL_DIRECTORY};
use serde::Serialize;
use std::path::Path;

/// Engine directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Engine path.
    pub path: String,
    /// Contents of the `SHUTDOWN` file, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownInfo>,
    /// Logfiles ordered by id.
    pub logfiles: Vec<LogfileInfo>,
}

/// Summary of one logfile.
#[derive(Debug, Serialize)]
pub struct LogfileInfo {
    /// Logfile id.
    pub id: u64,
    /// Status derived from the scan.
    pub status: String,
    /// File size in bytes.
    pub allocated_size: u64,
    /// Bytes up to the end of the last valid marker.
    pub used: u64,
    /// Number of valid markers.
    pub markers: u64,
    /// Whether the logfile carries document or structural markers.
    pub has_data: bool,
    /// Smallest tick.
    pub tick_min: u64,
    /// Largest tick.
    pub tick_max: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = EngineDir::open(path, false)?;

    let mut result = InspectResult {
        path: path.display().to_string(),
        shutdown: ShutdownInfo::read(&path.join(WAL_DIRECTORY))?,
        logfiles: Vec::new(),
    };

    for (id, file) in logfiles(path)? {
        let (logfile, scan) = Logfile::open_existing(&file, id, true)?;
        let (tick_min, tick_max) = logfile.tick_range();
        result.logfiles.push(LogfileInfo {
            id: id.as_u64(),
            status: logfile.status().name().to_string(),
            allocated_size: logfile.allocated_size(),
            used: logfile.used(),
            markers: scan.markers,
            has_data: scan.has_data,
            tick_min: tick_min.as_u64(),
            tick_max: tick_max.as_u64(),
        });
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Engine: {}", result.path);
    println!();

    match &result.shutdown {
        Some(info) => {
            println!("Shutdown file:");
            println!("  Last tick:           {}", info.tick.as_u64());
            println!("  Last collected:      {}", info.last_collected.as_u64());
            println!("  Last sealed:         {}", info.last_sealed.as_u64());
            match info.shutdown_time {
                Some(time) => println!("  Clean shutdown at:   {time}"),
                None => println!("  Clean shutdown:      no"),
            }
        }
        None => println!("Shutdown file: missing"),
    }
    println!();

    println!("Logfiles ({}):", result.logfiles.len());
    println!(
        "  {:>8}  {:<16}  {:>10}  {:>10}  {:>8}  {:>12}",
        "ID", "STATUS", "SIZE", "USED", "MARKERS", "TICKS"
    );
    for logfile in &result.logfiles {
        println!(
            "  {:>8}  {:<16}  {:>10}  {:>10}  {:>8}  {:>5}-{:<6}",
            logfile.id,
            logfile.status,
            format_size(logfile.allocated_size),
            format_size(logfile.used),
            logfile.markers,
            logfile.tick_min,
            logfile.tick_max
        );
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
