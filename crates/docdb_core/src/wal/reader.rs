//! Validated, zero-copy access to markers stored in a byte buffer.
//!
//! # Design
//!
//! [`MarkerView::parse`] checks a marker before any field is trusted, in
//! this order: size covers the header, size is aligned, size fits the
//! buffer, type is known, tick is set, crc matches. [`MarkerReader`] walks
//! a whole logfile or datafile image and decides what a failed check means:
//!
//! - a zero size word is the clean end of the written region
//! - a failed marker followed only by zero bytes is a torn tail left by a
//!   crash during the last write, and also ends the log
//! - anything else is corruption: fatal, or the end of the usable log when
//!   errors are ignored

use super::cursor::ByteCursor;
use super::marker::{
    MarkerField, MarkerType, CRC_OFFSET, MARKER_ALIGNMENT, MARKER_HEADER_SIZE, SIZE_OFFSET,
    TICK_OFFSET, TYPE_OFFSET,
};
use super::payload::decode_payload;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, LogfileId, Tick, TransactionId};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Outcome of a failed [`MarkerView::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerCheck {
    /// No marker here: the written region ends.
    End,
    /// The bytes do not form a valid marker.
    Invalid {
        /// Declared size, if it was usable.
        size: Option<usize>,
        /// Which check failed.
        reason: &'static str,
    },
}

/// Contents of a header marker payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Logfile format version.
    pub version: u32,
    /// Allocated size of the logfile.
    pub size: u32,
    /// Id of the logfile.
    pub id: LogfileId,
}

/// A validated marker borrowed from a buffer.
#[derive(Debug, Clone, Copy)]
pub struct MarkerView<'a> {
    bytes: &'a [u8],
    marker_type: MarkerType,
    tick: Tick,
}

impl<'a> MarkerView<'a> {
    /// Validates the marker at the start of `data`.
    ///
    /// `data` may extend past the marker.
    pub fn parse(data: &'a [u8]) -> Result<Self, MarkerCheck> {
        let cursor = ByteCursor::new(data);

        let Some(size) = cursor.u32_at(SIZE_OFFSET) else {
            if cursor.is_zero_from(0) {
                return Err(MarkerCheck::End);
            }
            return Err(MarkerCheck::Invalid {
                size: None,
                reason: "truncated size word",
            });
        };
        let size = size as usize;
        if size == 0 {
            return Err(MarkerCheck::End);
        }
        if size < MARKER_HEADER_SIZE {
            return Err(MarkerCheck::Invalid {
                size: None,
                reason: "size smaller than marker header",
            });
        }
        if size % MARKER_ALIGNMENT != 0 {
            return Err(MarkerCheck::Invalid {
                size: None,
                reason: "unaligned marker size",
            });
        }
        let Some(bytes) = cursor.slice(0, size) else {
            return Err(MarkerCheck::Invalid {
                size: None,
                reason: "marker extends past end of data",
            });
        };

        let bytes_cursor = ByteCursor::new(bytes);
        let Some(marker_type) = bytes_cursor.u8_at(TYPE_OFFSET).and_then(MarkerType::from_byte)
        else {
            return Err(MarkerCheck::Invalid {
                size: Some(size),
                reason: "unknown marker type",
            });
        };
        if marker_type.payload_offset() > size {
            return Err(MarkerCheck::Invalid {
                size: Some(size),
                reason: "size smaller than fixed fields",
            });
        }
        let tick = bytes_cursor.u64_at(TICK_OFFSET).unwrap_or(0);
        if tick == 0 {
            return Err(MarkerCheck::Invalid {
                size: Some(size),
                reason: "zero tick",
            });
        }

        let stored = bytes_cursor.u32_at(CRC_OFFSET).unwrap_or(0);
        if stored != marker_crc(bytes) {
            return Err(MarkerCheck::Invalid {
                size: Some(size),
                reason: "crc mismatch",
            });
        }

        Ok(Self {
            bytes,
            marker_type,
            tick: Tick::new(tick),
        })
    }

    /// Type of the marker.
    #[must_use]
    pub const fn marker_type(&self) -> MarkerType {
        self.marker_type
    }

    /// Tick of the marker.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Aligned size of the marker.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Raw bytes of the marker.
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn field(&self, field: MarkerField) -> u64 {
        self.marker_type
            .field_offset(field)
            .and_then(|offset| ByteCursor::new(self.bytes).u64_at(offset))
            .unwrap_or(0)
    }

    /// Database id, zero if the type carries none.
    #[must_use]
    pub fn database_id(&self) -> DatabaseId {
        DatabaseId::new(self.field(MarkerField::Database))
    }

    /// Collection or view id, zero if the type carries none.
    #[must_use]
    pub fn collection_id(&self) -> CollectionId {
        CollectionId::new(self.field(MarkerField::Collection))
    }

    /// Transaction id, zero if the type carries none.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.field(MarkerField::Transaction))
    }

    /// Payload including alignment padding.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.marker_type.payload_offset()..]
    }

    /// Decodes the CBOR payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the payload is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        decode_payload(self.payload())
    }

    /// Reads the payload of a header marker.
    #[must_use]
    pub fn header_info(&self) -> Option<HeaderInfo> {
        if self.marker_type != MarkerType::Header {
            return None;
        }
        let payload = ByteCursor::new(self.payload());
        Some(HeaderInfo {
            version: payload.u32_at(0)?,
            size: payload.u32_at(4)?,
            id: LogfileId::new(payload.u64_at(8)?),
        })
    }
}

/// CRC-32 of a marker with its crc word treated as zero.
#[must_use]
pub fn marker_crc(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..CRC_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&bytes[CRC_OFFSET + 4..]);
    hasher.finalize()
}

/// Iterator over the markers of a logfile or datafile image.
///
/// Yields `(offset, marker)` pairs. After the iterator is exhausted,
/// [`MarkerReader::end_offset`] is the end of the last valid marker.
#[derive(Debug)]
pub struct MarkerReader<'a> {
    data: &'a [u8],
    offset: usize,
    source_name: String,
    ignore_errors: bool,
    finished: bool,
    corrupt_at: Option<u64>,
}

impl<'a> MarkerReader<'a> {
    /// Creates a reader over `data`. `source_name` names the file in
    /// errors and logs.
    #[must_use]
    pub fn new(data: &'a [u8], source_name: impl Into<String>) -> Self {
        Self {
            data,
            offset: 0,
            source_name: source_name.into(),
            ignore_errors: false,
            finished: false,
            corrupt_at: None,
        }
    }

    /// Starts reading at `offset` instead of the beginning.
    #[must_use]
    pub fn starting_at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Treats corruption as the end of the log instead of an error.
    #[must_use]
    pub fn ignore_errors(mut self, value: bool) -> Self {
        self.ignore_errors = value;
        self
    }

    /// Offset just past the last valid marker read so far.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.offset as u64
    }

    /// Offset of corruption that was skipped because errors are ignored.
    #[must_use]
    pub fn corrupt_at(&self) -> Option<u64> {
        self.corrupt_at
    }
}

impl<'a> Iterator for MarkerReader<'a> {
    type Item = CoreResult<(u64, MarkerView<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let rest = self.data.get(self.offset..).unwrap_or_default();

        match MarkerView::parse(rest) {
            Ok(marker) => {
                let offset = self.offset as u64;
                self.offset += marker.size();
                Some(Ok((offset, marker)))
            }
            Err(MarkerCheck::End) => {
                self.finished = true;
                None
            }
            Err(MarkerCheck::Invalid { size, reason }) => {
                self.finished = true;
                let offset = self.offset as u64;
                let tail = size.unwrap_or(MARKER_HEADER_SIZE);
                if ByteCursor::new(rest).is_zero_from(tail) {
                    warn!(
                        file = %self.source_name,
                        offset,
                        reason,
                        "ignoring torn marker at end of log"
                    );
                    return None;
                }
                if self.ignore_errors {
                    warn!(
                        file = %self.source_name,
                        offset,
                        reason,
                        "skipping rest of file after corrupt marker"
                    );
                    self.corrupt_at = Some(offset);
                    return None;
                }
                Some(Err(CoreError::corrupt_marker(
                    self.source_name.clone(),
                    offset,
                    reason,
                )))
            }
        }
    }
}
