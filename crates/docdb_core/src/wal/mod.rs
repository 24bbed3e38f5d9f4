//! Write-ahead log: markers, logfiles and the slot allocator.
//!
//! Every mutating operation is written to a logfile as a self-describing
//! marker before it becomes visible. Logfiles are shared by all databases
//! and collections; the collector later moves surviving markers into
//! per-collection datafiles.
//!
//! ## Marker Format
//!
//! ```text
//! | size (4) | crc (4) | type (1) | pad (7) | tick (8) | fields (8 * n) | payload (N) | pad |
//! ```
//!
//! `size` covers the whole marker and is a multiple of 8. The crc is
//! computed over the marker with the crc field zeroed.
//!
//! ## Recovery Policy
//!
//! ### Tolerated Conditions (treat as clean end-of-log)
//!
//! - **Zero size word**: nothing was ever written here
//! - **Torn tail**: an invalid marker followed only by zero bytes, the
//!   remains of a write the crash interrupted
//!
//! ### Fatal Conditions
//!
//! - **CRC mismatch**, **unknown type**, **bad size** with data after it
//!   → `Err(CorruptMarker)`, unless `ignore_logfile_errors` is set, in
//!   which case the logfile ends at the damaged marker
//!
//! ## Invariants
//!
//! - Ticks strictly increase in the order slots are handed out
//! - The committed-tick watermark never decreases
//! - Markers are never modified after they were returned
//! - A logfile is removed only after it was collected and no running
//!   transaction or barrier still needs it

mod cursor;
mod logfile;
mod manager;
mod marker;
mod payload;
mod reader;
mod shutdown;
mod signal;
mod slots;
mod worker;

pub use cursor::ByteCursor;
pub use logfile::{Logfile, LogfileScan, LogfileStatus, FOOTER_RESERVE, HEADER_MARKER_SIZE};
pub use manager::{BarrierInfo, LogfileManager, LogfileRange, WrittenMarker, LOGFILE_OVERHEAD};
pub use marker::{
    aligned_size, Marker, MarkerField, MarkerType, MARKER_ALIGNMENT, MARKER_HEADER_SIZE,
    MAX_ENTRY_SIZE, WAL_VERSION,
};
pub use payload::{
    decode_payload, encode_payload, CollectionDefinition, DatabaseDefinition, DocumentPayload,
    DropIndexDefinition, IndexDefinition, RemovePayload, RenameDefinition, ViewDefinition,
};
pub use reader::{marker_crc, HeaderInfo, MarkerCheck, MarkerReader, MarkerView};
pub use shutdown::{ShutdownInfo, SHUTDOWN_FILE};
pub use signal::Signal;
pub use slots::{
    FlushOutcome, LogfileProvider, SlotHandle, Slots, SlotsState, SyncRegion, PROLOGUE_SIZE,
};
pub use worker::{StopFlag, Worker};
