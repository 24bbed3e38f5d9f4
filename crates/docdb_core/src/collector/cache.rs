//! Collector bookkeeping between the transfer and the apply phase.

use crate::types::{CollectionId, DatabaseId, DatafileId, LogfileId, Tick};
use crate::wal::MarkerType;

/// One marker of a logfile that survived the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorOperation {
    /// Offset of the marker in the logfile.
    pub offset: u64,
    /// Size of the marker.
    pub size: u64,
    /// Tick of the marker.
    pub tick: Tick,
    /// Type of the marker.
    pub marker_type: MarkerType,
    /// Document key for document and remove markers.
    pub key: Option<String>,
}

/// A marker copied into a collection datafile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredMarker {
    /// Document key.
    pub key: String,
    /// Tick of the marker.
    pub tick: Tick,
    /// Offset of the source marker in the logfile.
    pub wal_offset: u64,
    /// Datafile that received the copy.
    pub datafile: DatafileId,
    /// Offset of the copy.
    pub datafile_offset: u64,
    /// Size of the marker.
    pub size: u64,
    /// Whether the marker is a removal.
    pub is_remove: bool,
}

/// Markers of one collection moved out of one logfile, waiting to be
/// applied to the primary index and the datafile statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorCache {
    /// Database of the collection.
    pub database_id: DatabaseId,
    /// The collection.
    pub collection_id: CollectionId,
    /// Logfile the markers came from.
    pub logfile_id: LogfileId,
    /// Copied markers in tick order.
    pub operations: Vec<TransferredMarker>,
    /// Document operations the scan attributed to the collection,
    /// including superseded ones.
    pub seen: u64,
}

impl CollectorCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(database_id: DatabaseId, collection_id: CollectionId, logfile_id: LogfileId) -> Self {
        Self {
            database_id,
            collection_id,
            logfile_id,
            operations: Vec::new(),
            seen: 0,
        }
    }

    /// Number of copied markers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if nothing was copied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
