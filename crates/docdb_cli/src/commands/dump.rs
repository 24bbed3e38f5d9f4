//! Dump command implementation.

use super::{logfiles, read_file};
use docdb_core::wal::{DocumentPayload, MarkerReader, MarkerType, MarkerView, RemovePayload};
use docdb_core::{EngineDir, LogfileId};
use serde::Serialize;
use std::path::Path;

/// A listed marker.
#[derive(Debug, Serialize)]
pub struct MarkerEntry {
    /// Offset in the logfile.
    pub offset: u64,
    /// Marker type name.
    #[serde(rename = "type")]
    pub marker_type: &'static str,
    /// Tick.
    pub tick: u64,
    /// Size including padding.
    pub size: usize,
    /// Database id, if the type carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<u64>,
    /// Collection or view id, if the type carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<u64>,
    /// Transaction id, if the type carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<u64>,
    /// Document key of document and remove markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Document revision of document and remove markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
}

impl MarkerEntry {
    fn from_view(offset: u64, marker: &MarkerView<'_>) -> Self {
        let non_zero = |value: u64| (value != 0).then_some(value);
        let (key, rev) = match marker.marker_type() {
            MarkerType::Document => match marker.decode::<DocumentPayload>() {
                Ok(doc) => (Some(doc.key), Some(doc.rev)),
                Err(_) => (None, None),
            },
            MarkerType::Remove => match marker.decode::<RemovePayload>() {
                Ok(remove) => (Some(remove.key), Some(remove.rev)),
                Err(_) => (None, None),
            },
            _ => (None, None),
        };
        Self {
            offset,
            marker_type: marker.marker_type().name(),
            tick: marker.tick().as_u64(),
            size: marker.size(),
            database: non_zero(marker.database_id().as_u64()),
            collection: non_zero(marker.collection_id().as_u64()),
            transaction: non_zero(marker.transaction_id().as_u64()),
            key,
            rev,
        }
    }
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    logfile: u64,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = EngineDir::open(path, false)?;

    let id = LogfileId::new(logfile);
    let (_, file) = logfiles(path)?
        .into_iter()
        .find(|(found, _)| *found == id)
        .ok_or_else(|| format!("Logfile {} not found", logfile))?;
    let data = read_file(&file)?;

    let limit = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    let mut error = None;
    for item in MarkerReader::new(&data, file.display().to_string()).take(limit) {
        match item {
            Ok((offset, marker)) => entries.push(MarkerEntry::from_view(offset, &marker)),
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("{:>10}  {:<18}  {:>8}  {:>6}  DETAILS", "OFFSET", "TYPE", "TICK", "SIZE");
            for entry in &entries {
                print_entry(entry);
            }
            println!();
            println!("Total markers: {}", entries.len());
        }
    }

    if let Some(error) = error {
        eprintln!("Stopped at corrupt marker: {}", error);
    }

    Ok(())
}

fn print_entry(entry: &MarkerEntry) {
    let mut details = Vec::new();
    if let Some(db) = entry.database {
        details.push(format!("db={db}"));
    }
    if let Some(collection) = entry.collection {
        details.push(format!("col={collection}"));
    }
    if let Some(trx) = entry.transaction {
        details.push(format!("trx={trx}"));
    }
    if let Some(key) = &entry.key {
        details.push(format!("key={key}"));
    }
    if let Some(rev) = entry.rev {
        details.push(format!("rev={rev}"));
    }
    println!(
        "{:>10}  {:<18}  {:>8}  {:>6}  {}",
        entry.offset,
        entry.marker_type,
        entry.tick,
        entry.size,
        details.join(" ")
    );
}
