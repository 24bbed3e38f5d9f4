//! Marker types, field layout and encoding.

use super::payload::{
    encode_payload, CollectionDefinition, DatabaseDefinition, DocumentPayload,
    DropIndexDefinition, IndexDefinition, RemovePayload, RenameDefinition, ViewDefinition,
};
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, DatabaseId, LogfileId, Tick, TransactionId};

/// Size of the common marker header.
pub const MARKER_HEADER_SIZE: usize = 24;

/// Every marker starts and ends on this boundary.
pub const MARKER_ALIGNMENT: usize = 8;

/// Largest marker the log accepts.
pub const MAX_ENTRY_SIZE: u64 = 2 << 30;

/// Logfile format version written into header markers.
pub const WAL_VERSION: u32 = 1;

/// Byte offset of the size word.
pub(crate) const SIZE_OFFSET: usize = 0;
/// Byte offset of the crc word.
pub(crate) const CRC_OFFSET: usize = 4;
/// Byte offset of the type byte.
pub(crate) const TYPE_OFFSET: usize = 8;
/// Byte offset of the tick.
pub(crate) const TICK_OFFSET: usize = 16;

/// Rounds `size` up to the marker alignment.
#[must_use]
pub const fn aligned_size(size: usize) -> usize {
    (size + MARKER_ALIGNMENT - 1) & !(MARKER_ALIGNMENT - 1)
}

/// Type of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MarkerType {
    /// First marker of every logfile.
    Header = 1,
    /// Last marker of a sealed logfile.
    Footer = 2,
    /// Sets the database/collection context of the following markers.
    Prologue = 3,
    /// Fills a reserved range whose marker could not be written.
    Blank = 4,
    /// Database created.
    CreateDatabase = 10,
    /// Database dropped.
    DropDatabase = 11,
    /// Collection created.
    CreateCollection = 20,
    /// Collection dropped.
    DropCollection = 21,
    /// Collection renamed.
    RenameCollection = 22,
    /// Collection properties changed.
    ChangeCollection = 23,
    /// Index created.
    CreateIndex = 24,
    /// Index dropped.
    DropIndex = 25,
    /// View created.
    CreateView = 30,
    /// View dropped.
    DropView = 31,
    /// View properties changed.
    ChangeView = 32,
    /// Document inserted or replaced.
    Document = 40,
    /// Document removed.
    Remove = 41,
    /// Multi-operation transaction started.
    BeginTransaction = 50,
    /// Transaction committed.
    CommitTransaction = 51,
    /// Transaction aborted.
    AbortTransaction = 52,
}

/// A fixed id field that follows the marker header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerField {
    /// Database id.
    Database,
    /// Collection (or view) id.
    Collection,
    /// Transaction id.
    Transaction,
}

const NO_FIELDS: &[MarkerField] = &[];
const DATABASE_FIELDS: &[MarkerField] = &[MarkerField::Database];
const COLLECTION_FIELDS: &[MarkerField] = &[MarkerField::Database, MarkerField::Collection];
const DOCUMENT_FIELDS: &[MarkerField] = &[MarkerField::Transaction];
const TRANSACTION_FIELDS: &[MarkerField] = &[MarkerField::Database, MarkerField::Transaction];

impl MarkerType {
    /// Converts a byte to a marker type.
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Header,
            2 => Self::Footer,
            3 => Self::Prologue,
            4 => Self::Blank,
            10 => Self::CreateDatabase,
            11 => Self::DropDatabase,
            20 => Self::CreateCollection,
            21 => Self::DropCollection,
            22 => Self::RenameCollection,
            23 => Self::ChangeCollection,
            24 => Self::CreateIndex,
            25 => Self::DropIndex,
            30 => Self::CreateView,
            31 => Self::DropView,
            32 => Self::ChangeView,
            40 => Self::Document,
            41 => Self::Remove,
            50 => Self::BeginTransaction,
            51 => Self::CommitTransaction,
            52 => Self::AbortTransaction,
            _ => return None,
        })
    }

    /// Converts the marker type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Fixed fields stored after the header, in order.
    #[must_use]
    pub const fn fields(self) -> &'static [MarkerField] {
        match self {
            Self::Header | Self::Footer | Self::Blank => NO_FIELDS,
            Self::CreateDatabase | Self::DropDatabase => DATABASE_FIELDS,
            Self::Prologue
            | Self::CreateCollection
            | Self::DropCollection
            | Self::RenameCollection
            | Self::ChangeCollection
            | Self::CreateIndex
            | Self::DropIndex
            | Self::CreateView
            | Self::DropView
            | Self::ChangeView => COLLECTION_FIELDS,
            Self::Document | Self::Remove => DOCUMENT_FIELDS,
            Self::BeginTransaction | Self::CommitTransaction | Self::AbortTransaction => {
                TRANSACTION_FIELDS
            }
        }
    }

    /// Byte offset of `field`, or `None` if this type does not carry it.
    #[must_use]
    pub fn field_offset(self, field: MarkerField) -> Option<usize> {
        self.fields()
            .iter()
            .position(|f| *f == field)
            .map(|index| MARKER_HEADER_SIZE + index * 8)
    }

    /// Byte offset where the variable payload begins.
    #[must_use]
    pub const fn payload_offset(self) -> usize {
        MARKER_HEADER_SIZE + self.fields().len() * 8
    }

    /// Returns true for document and remove markers.
    #[must_use]
    pub const fn is_document_operation(self) -> bool {
        matches!(self, Self::Document | Self::Remove)
    }

    /// Returns true for markers that change databases, collections, indexes or views.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(
            self,
            Self::CreateDatabase
                | Self::DropDatabase
                | Self::CreateCollection
                | Self::DropCollection
                | Self::RenameCollection
                | Self::ChangeCollection
                | Self::CreateIndex
                | Self::DropIndex
                | Self::CreateView
                | Self::DropView
                | Self::ChangeView
        )
    }

    /// Returns true for markers that carry user data, as opposed to
    /// logfile bookkeeping.
    #[must_use]
    pub const fn is_data(self) -> bool {
        !matches!(self, Self::Header | Self::Footer | Self::Prologue | Self::Blank)
    }

    /// Human readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Footer => "footer",
            Self::Prologue => "prologue",
            Self::Blank => "blank",
            Self::CreateDatabase => "create database",
            Self::DropDatabase => "drop database",
            Self::CreateCollection => "create collection",
            Self::DropCollection => "drop collection",
            Self::RenameCollection => "rename collection",
            Self::ChangeCollection => "change collection",
            Self::CreateIndex => "create index",
            Self::DropIndex => "drop index",
            Self::CreateView => "create view",
            Self::DropView => "drop view",
            Self::ChangeView => "change view",
            Self::Document => "document",
            Self::Remove => "remove",
            Self::BeginTransaction => "begin transaction",
            Self::CommitTransaction => "commit transaction",
            Self::AbortTransaction => "abort transaction",
        }
    }
}

/// A marker waiting to be written.
///
/// The tick is not part of the marker; the slot allocator assigns it when
/// space is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    marker_type: MarkerType,
    database_id: DatabaseId,
    collection_id: CollectionId,
    transaction_id: TransactionId,
    payload: Vec<u8>,
}

impl Marker {
    /// Creates a marker of the given type with zero ids and no payload.
    #[must_use]
    pub fn new(marker_type: MarkerType) -> Self {
        Self {
            marker_type,
            database_id: DatabaseId::default(),
            collection_id: CollectionId::default(),
            transaction_id: TransactionId::default(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    fn with_database(mut self, database_id: DatabaseId) -> Self {
        self.database_id = database_id;
        self
    }

    #[must_use]
    fn with_collection(mut self, collection_id: CollectionId) -> Self {
        self.collection_id = collection_id;
        self
    }

    #[must_use]
    fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    #[must_use]
    fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Header marker opening logfile `id` of `size` bytes.
    #[must_use]
    pub fn header(id: LogfileId, size: u32) -> Self {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&WAL_VERSION.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(&id.as_u64().to_le_bytes());
        Self::new(MarkerType::Header).with_payload(payload)
    }

    /// Footer marker sealing a logfile.
    #[must_use]
    pub fn footer() -> Self {
        Self::new(MarkerType::Footer)
    }

    /// Prologue establishing the context of the following markers.
    #[must_use]
    pub fn prologue(database_id: DatabaseId, collection_id: CollectionId) -> Self {
        Self::new(MarkerType::Prologue)
            .with_database(database_id)
            .with_collection(collection_id)
    }

    /// Blank marker covering exactly `size` bytes, written in place of a
    /// marker that could not be stored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if `size` is not an aligned size of
    /// at least one marker header.
    pub fn blank(size: usize) -> CoreResult<Self> {
        if size < MARKER_HEADER_SIZE || size != aligned_size(size) {
            return Err(CoreError::internal(format!("cannot blank {size} bytes")));
        }
        Ok(Self::new(MarkerType::Blank).with_payload(vec![0u8; size - MARKER_HEADER_SIZE]))
    }

    /// Document insert or replace.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn document(transaction_id: TransactionId, document: &DocumentPayload) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::Document)
            .with_transaction(transaction_id)
            .with_payload(encode_payload(document)?))
    }

    /// Document removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn remove(transaction_id: TransactionId, remove: &RemovePayload) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::Remove)
            .with_transaction(transaction_id)
            .with_payload(encode_payload(remove)?))
    }

    /// Transaction marker of type begin, commit or abort.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] for any other type.
    pub fn transaction(
        marker_type: MarkerType,
        database_id: DatabaseId,
        transaction_id: TransactionId,
    ) -> CoreResult<Self> {
        if !matches!(
            marker_type,
            MarkerType::BeginTransaction
                | MarkerType::CommitTransaction
                | MarkerType::AbortTransaction
        ) {
            return Err(CoreError::invalid_operation(format!(
                "{} is not a transaction marker",
                marker_type.name()
            )));
        }
        Ok(Self::new(marker_type)
            .with_database(database_id)
            .with_transaction(transaction_id))
    }

    /// Database created.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn create_database(
        database_id: DatabaseId,
        definition: &DatabaseDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::CreateDatabase)
            .with_database(database_id)
            .with_payload(encode_payload(definition)?))
    }

    /// Database dropped.
    #[must_use]
    pub fn drop_database(database_id: DatabaseId) -> Self {
        Self::new(MarkerType::DropDatabase).with_database(database_id)
    }

    /// Collection created or changed (`CreateCollection` / `ChangeCollection`).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn collection(
        marker_type: MarkerType,
        database_id: DatabaseId,
        collection_id: CollectionId,
        definition: &CollectionDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(marker_type)
            .with_database(database_id)
            .with_collection(collection_id)
            .with_payload(encode_payload(definition)?))
    }

    /// Collection dropped.
    #[must_use]
    pub fn drop_collection(database_id: DatabaseId, collection_id: CollectionId) -> Self {
        Self::new(MarkerType::DropCollection)
            .with_database(database_id)
            .with_collection(collection_id)
    }

    /// Collection renamed.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn rename_collection(
        database_id: DatabaseId,
        collection_id: CollectionId,
        rename: &RenameDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::RenameCollection)
            .with_database(database_id)
            .with_collection(collection_id)
            .with_payload(encode_payload(rename)?))
    }

    /// Index created.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn create_index(
        database_id: DatabaseId,
        collection_id: CollectionId,
        definition: &IndexDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::CreateIndex)
            .with_database(database_id)
            .with_collection(collection_id)
            .with_payload(encode_payload(definition)?))
    }

    /// Index dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn drop_index(
        database_id: DatabaseId,
        collection_id: CollectionId,
        definition: &DropIndexDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(MarkerType::DropIndex)
            .with_database(database_id)
            .with_collection(collection_id)
            .with_payload(encode_payload(definition)?))
    }

    /// View created or changed (`CreateView` / `ChangeView`).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn view(
        marker_type: MarkerType,
        database_id: DatabaseId,
        view_id: CollectionId,
        definition: &ViewDefinition,
    ) -> CoreResult<Self> {
        Ok(Self::new(marker_type)
            .with_database(database_id)
            .with_collection(view_id)
            .with_payload(encode_payload(definition)?))
    }

    /// View dropped.
    #[must_use]
    pub fn drop_view(database_id: DatabaseId, view_id: CollectionId) -> Self {
        Self::new(MarkerType::DropView)
            .with_database(database_id)
            .with_collection(view_id)
    }

    /// Type of the marker.
    #[must_use]
    pub const fn marker_type(&self) -> MarkerType {
        self.marker_type
    }

    /// Database id (zero if the type carries none).
    #[must_use]
    pub const fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Collection id (zero if the type carries none).
    #[must_use]
    pub const fn collection_id(&self) -> CollectionId {
        self.collection_id
    }

    /// Transaction id (zero if the type carries none).
    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Encoded payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Aligned on-disk size.
    #[must_use]
    pub fn size(&self) -> usize {
        aligned_size(self.marker_type.payload_offset() + self.payload.len())
    }

    /// Writes the marker with `tick` into `buf`, which must be exactly
    /// [`Marker::size`] bytes long.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Internal`] if `buf` has the wrong length.
    pub fn encode_into(&self, tick: Tick, buf: &mut [u8]) -> CoreResult<()> {
        let size = self.size();
        if buf.len() != size {
            return Err(CoreError::internal(format!(
                "marker buffer of {} bytes for a {} byte {} marker",
                buf.len(),
                size,
                self.marker_type.name()
            )));
        }
        let size_word = u32::try_from(size).map_err(|_| CoreError::DocumentTooLarge {
            size: size as u64,
            max: MAX_ENTRY_SIZE,
        })?;

        buf.fill(0);

        // Header
        buf[SIZE_OFFSET..SIZE_OFFSET + 4].copy_from_slice(&size_word.to_le_bytes());
        buf[TYPE_OFFSET] = self.marker_type.as_byte();
        buf[TICK_OFFSET..TICK_OFFSET + 8].copy_from_slice(&tick.as_u64().to_le_bytes());

        // Fixed fields
        for field in self.marker_type.fields() {
            if let Some(offset) = self.marker_type.field_offset(*field) {
                let value = match field {
                    MarkerField::Database => self.database_id.as_u64(),
                    MarkerField::Collection => self.collection_id.as_u64(),
                    MarkerField::Transaction => self.transaction_id.as_u64(),
                };
                buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            }
        }

        // Payload, then the crc over everything with the crc word still zero
        let payload_offset = self.marker_type.payload_offset();
        buf[payload_offset..payload_offset + self.payload.len()].copy_from_slice(&self.payload);

        let crc = crc32fast::hash(buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Encodes the marker into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exceeds the 32-bit size field.
    pub fn encode(&self, tick: Tick) -> CoreResult<Vec<u8>> {
        let mut buf = vec![0u8; self.size()];
        self.encode_into(tick, &mut buf)?;
        Ok(buf)
    }
}
