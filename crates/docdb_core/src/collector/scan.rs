//! Single pass over a sealed logfile that decides which markers move to
//! which collection.

use super::cache::CollectorOperation;
use crate::error::CoreResult;
use crate::types::{CollectionId, DatabaseId, TransactionId};
use crate::wal::{MarkerReader, MarkerType, RemovePayload};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{trace, warn};

type CollectionKey = (DatabaseId, CollectionId);

#[derive(Debug, Default)]
struct CollectionOperations {
    structural: Vec<CollectorOperation>,
    documents: HashMap<String, CollectorOperation>,
    seen: u64,
}

/// Result of scanning one logfile.
#[derive(Debug, Default)]
pub struct ScanResult {
    collections: BTreeMap<CollectionKey, CollectionOperations>,
    dropped_databases: HashSet<DatabaseId>,
    dropped_collections: HashSet<CollectionKey>,
    /// Transactions whose abort marker is in the logfile.
    pub aborted: HashSet<TransactionId>,
}

impl ScanResult {
    /// Reads every marker of `data`.
    ///
    /// Document and remove markers of `failed` transactions are skipped.
    /// Per collection the newest marker of every key survives.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::CorruptMarker`] if a marker is damaged.
    pub fn scan(data: &[u8], source_name: &str, failed: &HashSet<TransactionId>) -> CoreResult<Self> {
        let mut result = Self::default();
        let mut context: Option<CollectionKey> = None;

        for item in MarkerReader::new(data, source_name) {
            let (offset, marker) = item?;
            let marker_type = marker.marker_type();
            match marker_type {
                MarkerType::Header | MarkerType::Footer => context = None,
                MarkerType::Prologue => {
                    context = Some((marker.database_id(), marker.collection_id()));
                }
                MarkerType::Document | MarkerType::Remove => {
                    if failed.contains(&marker.transaction_id()) {
                        trace!(offset, transaction = %marker.transaction_id(), "skipping marker of failed transaction");
                        continue;
                    }
                    let Some(key) = context else {
                        warn!(source = source_name, offset, "document marker without prologue");
                        continue;
                    };
                    let payload: RemovePayload = marker.decode()?;
                    let operation = CollectorOperation {
                        offset,
                        size: marker.size() as u64,
                        tick: marker.tick(),
                        marker_type,
                        key: Some(payload.key.clone()),
                    };
                    let entry = result.collections.entry(key).or_default();
                    entry.seen += 1;
                    match entry.documents.get(&payload.key) {
                        Some(existing) if existing.tick > operation.tick => {}
                        _ => {
                            entry.documents.insert(payload.key, operation);
                        }
                    }
                }
                MarkerType::DropDatabase => {
                    result.dropped_databases.insert(marker.database_id());
                }
                MarkerType::DropCollection => {
                    result
                        .dropped_collections
                        .insert((marker.database_id(), marker.collection_id()));
                }
                MarkerType::AbortTransaction => {
                    result.aborted.insert(marker.transaction_id());
                }
                MarkerType::CreateCollection
                | MarkerType::RenameCollection
                | MarkerType::ChangeCollection
                | MarkerType::CreateIndex
                | MarkerType::DropIndex => {
                    result
                        .collections
                        .entry((marker.database_id(), marker.collection_id()))
                        .or_default()
                        .structural
                        .push(CollectorOperation {
                            offset,
                            size: marker.size() as u64,
                            tick: marker.tick(),
                            marker_type,
                            key: None,
                        });
                }
                _ => {}
            }
        }
        Ok(result)
    }

    /// Returns true if the collection or its database was dropped in the
    /// scanned logfile.
    #[must_use]
    pub fn is_dropped(&self, database: DatabaseId, collection: CollectionId) -> bool {
        self.dropped_databases.contains(&database)
            || self.dropped_collections.contains(&(database, collection))
    }

    /// Collections with operations, in id order.
    pub fn collections(&self) -> impl Iterator<Item = CollectionKey> + '_ {
        self.collections.keys().copied()
    }

    /// Structural operations followed by the surviving document operations
    /// of one collection, both in tick order.
    #[must_use]
    pub fn operations(&self, database: DatabaseId, collection: CollectionId) -> Vec<CollectorOperation> {
        let Some(entry) = self.collections.get(&(database, collection)) else {
            return Vec::new();
        };
        let mut documents: Vec<_> = entry.documents.values().cloned().collect();
        documents.sort_by_key(|op| op.tick);

        let mut operations = entry.structural.clone();
        operations.extend(documents);
        operations
    }

    /// Document and remove markers of non-failed transactions seen for one
    /// collection, superseded ones included.
    #[must_use]
    pub fn seen(&self, database: DatabaseId, collection: CollectionId) -> u64 {
        self.collections
            .get(&(database, collection))
            .map_or(0, |entry| entry.seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogfileId, Tick};
    use crate::wal::{DocumentPayload, Marker};
    use ciborium::Value;
    use proptest::prelude::*;

    struct Log {
        data: Vec<u8>,
        tick: u64,
    }

    impl Log {
        fn new() -> Self {
            let mut log = Self {
                data: Vec::new(),
                tick: 0,
            };
            log.push(&Marker::header(LogfileId::new(1), 1 << 20));
            log
        }

        fn push(&mut self, marker: &Marker) {
            self.tick += 1;
            self.data
                .extend_from_slice(&marker.encode(Tick::new(self.tick)).unwrap());
        }

        fn document(&mut self, trx: u64, key: &str) {
            self.push(
                &Marker::document(
                    TransactionId::new(trx),
                    &DocumentPayload {
                        key: key.to_string(),
                        rev: self.tick,
                        body: Value::Null,
                    },
                )
                .unwrap(),
            );
        }
    }

    const DB: DatabaseId = DatabaseId::new(1);

    #[test]
    fn newest_marker_per_key_survives() {
        let mut log = Log::new();
        log.push(&Marker::prologue(DB, CollectionId::new(5)));
        log.document(1, "a");
        log.document(1, "b");
        log.document(1, "a");
        log.push(&Marker::prologue(DB, CollectionId::new(6)));
        log.document(1, "a");

        let scan = ScanResult::scan(&log.data, "test", &HashSet::new()).unwrap();
        assert_eq!(scan.collections().count(), 2);
        assert_eq!(scan.seen(DB, CollectionId::new(5)), 3);

        let ops = scan.operations(DB, CollectionId::new(5));
        let keys: Vec<_> = ops.iter().map(|o| o.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(ops[1].tick, Tick::new(5));
    }

    #[test]
    fn failed_and_dropped_are_reported() {
        let mut log = Log::new();
        log.push(&Marker::prologue(DB, CollectionId::new(5)));
        log.document(7, "a");
        log.document(8, "b");
        log.push(&Marker::transaction(MarkerType::AbortTransaction, DB, TransactionId::new(7)).unwrap());
        log.push(&Marker::drop_collection(DB, CollectionId::new(9)));

        let failed: HashSet<_> = [TransactionId::new(7)].into();
        let scan = ScanResult::scan(&log.data, "test", &failed).unwrap();
        assert_eq!(scan.seen(DB, CollectionId::new(5)), 1);
        assert!(scan.aborted.contains(&TransactionId::new(7)));
        assert!(scan.is_dropped(DB, CollectionId::new(9)));
        assert!(!scan.is_dropped(DB, CollectionId::new(5)));
    }

    #[test]
    fn footer_resets_context() {
        let mut log = Log::new();
        log.push(&Marker::prologue(DB, CollectionId::new(5)));
        log.push(&Marker::footer());
        log.document(1, "orphan");

        let scan = ScanResult::scan(&log.data, "test", &HashSet::new()).unwrap();
        assert_eq!(scan.collections().count(), 0);
    }

    #[test]
    fn corrupt_marker_is_an_error() {
        let mut log = Log::new();
        log.push(&Marker::prologue(DB, CollectionId::new(5)));
        let start = log.data.len();
        log.document(1, "a");
        log.document(1, "b");
        log.data[start + 30] ^= 0xff;

        assert!(ScanResult::scan(&log.data, "test", &HashSet::new()).is_err());
    }

    proptest! {
        #[test]
        fn last_writer_wins(keys in proptest::collection::vec(0u8..6, 1..40)) {
            let mut log = Log::new();
            log.push(&Marker::prologue(DB, CollectionId::new(5)));
            let mut expected: HashMap<String, u64> = HashMap::new();
            for key in &keys {
                let key = format!("k{key}");
                log.document(1, &key);
                expected.insert(key, log.tick);
            }

            let scan = ScanResult::scan(&log.data, "test", &HashSet::new()).unwrap();
            let ops = scan.operations(DB, CollectionId::new(5));
            prop_assert_eq!(ops.len(), expected.len());
            prop_assert_eq!(scan.seen(DB, CollectionId::new(5)), keys.len() as u64);
            for op in &ops {
                prop_assert_eq!(expected[op.key.as_ref().unwrap()], op.tick.as_u64());
            }
            prop_assert!(ops.windows(2).all(|w| w[0].tick < w[1].tick));
        }
    }
}
