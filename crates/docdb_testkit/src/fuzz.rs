//! Fuzz testing harnesses for docdb.
//!
//! This module provides fuzz targets that can be used with cargo-fuzz
//! or other fuzzing frameworks.

use crate::fixtures::TestEngine;
use ciborium::Value;
use docdb_core::wal::{
    DocumentPayload, Marker, MarkerReader, MarkerType, MarkerView, RemovePayload,
};
use docdb_core::{CollectionId, DatabaseId, DocumentOperation, LogfileId, Tick, TransactionId};

/// Fuzz target for marker parsing.
///
/// Tests that arbitrary byte sequences are either a valid marker or
/// rejected with a check result (no panics).
pub fn fuzz_marker_parse(data: &[u8]) {
    if let Ok(marker) = MarkerView::parse(data) {
        assert!(marker.size() <= data.len());
        let _ = marker.decode::<DocumentPayload>();
        let _ = marker.decode::<RemovePayload>();
    }
}

/// Fuzz target for reading a whole logfile.
///
/// The reader must stop or fail on damage, never panic, and every marker
/// it yields must lie inside the input.
pub fn fuzz_marker_reader(data: &[u8]) {
    let mut reader = MarkerReader::new(data, "fuzz").ignore_errors(true);
    for item in reader.by_ref() {
        let (offset, marker) = item.expect("ignore_errors never yields an error");
        assert!(offset as usize + marker.size() <= data.len());
    }
    assert!(reader.end_offset() as usize <= data.len());

    for item in MarkerReader::new(data, "fuzz") {
        if item.is_err() {
            break;
        }
    }
}

/// A small valid log: header, prologue and a committed transaction.
pub fn sample_log() -> Vec<u8> {
    let database = DatabaseId::new(1);
    let collection = CollectionId::new(2);
    let transaction = TransactionId::new(3);
    let markers = [
        Marker::header(LogfileId::new(1), 4096),
        Marker::prologue(database, collection),
        Marker::transaction(MarkerType::BeginTransaction, database, transaction)
            .expect("encode begin"),
        Marker::document(
            transaction,
            &DocumentPayload {
                key: "a".to_string(),
                rev: 1,
                body: Value::Text("fuzz".to_string()),
            },
        )
        .expect("encode document"),
        Marker::remove(
            transaction,
            &RemovePayload {
                key: "b".to_string(),
                rev: 2,
            },
        )
        .expect("encode remove"),
        Marker::transaction(MarkerType::CommitTransaction, database, transaction)
            .expect("encode commit"),
    ];

    let mut log = Vec::new();
    for (i, marker) in markers.iter().enumerate() {
        log.extend(marker.encode(Tick::new(10 + i as u64)).expect("encode marker"));
    }
    log
}

/// Fuzz target for damaged logs.
///
/// `data` is read as pairs of (position, xor mask) applied to
/// [`sample_log`]. Every marker before the first damaged byte must still
/// be read back.
pub fn fuzz_damaged_log(data: &[u8]) {
    let mut log = sample_log();
    let mut first_damage = log.len();
    for pair in data.chunks_exact(2) {
        let position = pair[0] as usize * log.len() / 256;
        if pair[1] != 0 {
            log[position] ^= pair[1];
            first_damage = first_damage.min(position);
        }
    }

    let intact: Vec<_> = MarkerReader::new(&sample_log(), "sample")
        .filter_map(Result::ok)
        .map(|(offset, marker)| offset as usize + marker.size())
        .take_while(|end| *end <= first_damage)
        .collect();

    let read = MarkerReader::new(&log, "fuzz")
        .ignore_errors(true)
        .filter_map(Result::ok)
        .count();
    assert!(read >= intact.len(), "lost markers before the damage");
}

/// Parse document operations from fuzzer input.
///
/// Each operation takes two bytes: the operation type and a key index.
pub fn parse_operations(data: &[u8]) -> Vec<DocumentOperation> {
    data.chunks_exact(2)
        .map(|pair| {
            let key = format!("key-{}", pair[1] % 8);
            let body = Value::Integer(i64::from(pair[1]).into());
            match pair[0] % 4 {
                0 => DocumentOperation::Insert { key, body },
                1 => DocumentOperation::Replace { key, body },
                2 => DocumentOperation::Upsert { key, body },
                _ => DocumentOperation::Remove { key },
            }
        })
        .collect()
}

/// Fuzz target for engine operations.
///
/// Tests that arbitrary operation sequences don't cause panics, and that
/// the engine recovers after a crash.
pub fn fuzz_engine_operations(data: &[u8]) {
    let mut engine = TestEngine::new();
    for op in parse_operations(data) {
        let key = op.key().to_string();
        let result = match op {
            DocumentOperation::Insert { body, .. } => {
                engine.insert(engine.database, engine.collection, &key, body)
            }
            DocumentOperation::Replace { body, .. } => {
                engine.replace(engine.database, engine.collection, &key, body)
            }
            DocumentOperation::Upsert { body, .. } => engine
                .replace(engine.database, engine.collection, &key, body.clone())
                .or_else(|_| engine.insert(engine.database, engine.collection, &key, body)),
            DocumentOperation::Remove { .. } => {
                engine.remove(engine.database, engine.collection, &key)
            }
        };
        let _ = result;
    }
    engine.crash_and_recover().expect("recovery after fuzzed operations");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_sample_log_is_valid() {
        let log = sample_log();
        let markers: Vec<_> = MarkerReader::new(&log, "sample")
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(markers.len(), 6);
        assert_eq!(markers[3].1.marker_type(), MarkerType::Document);
    }

    #[test]
    fn test_fuzz_marker_parse_empty() {
        fuzz_marker_parse(&[]);
        fuzz_marker_reader(&[]);
    }

    #[test]
    fn test_parse_operations() {
        let ops = parse_operations(&[0, 1, 1, 2, 3, 9, 7]);
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[2], DocumentOperation::Remove { key } if key == "key-1"));
    }

    #[test]
    fn fuzz_marker_parse_random_iterations() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let len = rng.gen_range(0..256);
            fuzz_marker_parse(&random_data(&mut rng, len));
        }
    }

    #[test]
    fn fuzz_marker_reader_random_iterations() {
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..500 {
            let len = rng.gen_range(0..1024);
            fuzz_marker_reader(&random_data(&mut rng, len));
        }
    }

    #[test]
    fn fuzz_damaged_log_random_iterations() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let len = rng.gen_range(0..8) * 2;
            fuzz_damaged_log(&random_data(&mut rng, len));
        }
    }

    #[test]
    fn fuzz_engine_operations_random_iterations() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..3 {
            fuzz_engine_operations(&random_data(&mut rng, 64));
        }
    }
}
