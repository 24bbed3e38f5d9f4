//! Engine benchmarks: document writes, reads and recovery.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docdb_bench::{bench_config, document_body, generate_keys};
use docdb_core::{
    CollectionDefinition, CollectionId, DatabaseId, DocumentOperation, StorageEngine,
    TransactionHints,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> (StorageEngine, DatabaseId, CollectionId) {
    let engine = StorageEngine::open(dir.path(), bench_config()).unwrap();
    let db = engine.create_database("bench").unwrap();
    let collection = engine
        .create_collection(
            db,
            &CollectionDefinition {
                name: "docs".to_string(),
                wait_for_sync: false,
                journal_size: 0,
            },
        )
        .unwrap();
    (engine, db, collection)
}

/// Benchmark single-operation inserts.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [64, 1024].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let (engine, db, collection) = open_engine(&dir);
            let body = document_body(size);
            let counter = AtomicUsize::new(0);

            b.iter(|| {
                let key = format!("key-{}", counter.fetch_add(1, Ordering::Relaxed));
                black_box(engine.insert(db, collection, &key, body.clone()).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark transactions of 100 upserts.
fn bench_transaction_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_batch");
    group.sample_size(20);
    group.throughput(Throughput::Elements(100));

    let dir = TempDir::new().unwrap();
    let (engine, db, collection) = open_engine(&dir);
    let keys = generate_keys(100);
    let body = document_body(256);

    group.bench_function("100x256", |b| {
        b.iter(|| {
            let mut trx = engine
                .begin_transaction(db, &[collection], TransactionHints::default())
                .unwrap();
            for key in &keys {
                trx.add_operation(
                    collection,
                    DocumentOperation::Upsert {
                        key: key.clone(),
                        body: body.clone(),
                    },
                )
                .unwrap();
            }
            black_box(trx.commit().unwrap());
        });
    });

    group.finish();
}

/// Benchmark document reads from the log.
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");

    let dir = TempDir::new().unwrap();
    let (engine, db, collection) = open_engine(&dir);
    let keys = generate_keys(1000);
    for key in &keys {
        engine.insert(db, collection, key, document_body(256)).unwrap();
    }

    let mut idx = 0;
    group.bench_function("1000_documents", |b| {
        b.iter(|| {
            let key = &keys[(idx * 7) % keys.len()];
            idx += 1;
            black_box(engine.document(db, collection, key).unwrap());
        });
    });

    group.finish();
}

/// Benchmark crash recovery of a log with 10k documents.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);

    let dir = TempDir::new().unwrap();
    let (engine, db, collection) = open_engine(&dir);
    for key in generate_keys(10_000) {
        engine.insert(db, collection, &key, document_body(128)).unwrap();
    }
    engine.kill();

    group.bench_function("10k_documents", |b| {
        b.iter(|| {
            let engine = StorageEngine::init(dir.path(), bench_config()).unwrap();
            engine.run_recovery().unwrap();
            black_box(engine.state());
            // Dropped before run(): the log stays unsealed for the next iteration
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_transaction_batch,
    bench_read,
    bench_recovery,
);

criterion_main!(benches);
