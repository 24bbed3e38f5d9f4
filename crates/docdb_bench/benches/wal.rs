//! Write-ahead log benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docdb_bench::{bench_config, document_body};
use docdb_core::wal::{DocumentPayload, Marker, MarkerReader};
use docdb_core::{CollectionDefinition, StorageEngine, Tick, TransactionId};
use tempfile::TempDir;

fn document_marker(size: usize) -> Marker {
    Marker::document(
        TransactionId::new(1),
        &DocumentPayload {
            key: "bench".to_string(),
            rev: 1,
            body: document_body(size),
        },
    )
    .unwrap()
}

/// Benchmark marker encoding.
fn bench_marker_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("marker_encode");

    for size in [64, 256, 1024, 4096].iter() {
        let marker = document_marker(*size);
        group.throughput(Throughput::Bytes(marker.size() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &marker, |b, marker| {
            b.iter(|| black_box(marker.encode(black_box(Tick::new(42))).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark scanning a log of 1000 markers.
fn bench_marker_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("marker_scan");

    for size in [64, 1024].iter() {
        let marker = document_marker(*size);
        let mut log = Vec::new();
        for tick in 1..=1000 {
            log.extend(marker.encode(Tick::new(tick)).unwrap());
        }
        group.throughput(Throughput::Bytes(log.len() as u64));
        group.bench_with_input(BenchmarkId::new("1000_markers", size), &log, |b, log| {
            b.iter(|| {
                let count = MarkerReader::new(black_box(log), "bench")
                    .filter_map(Result::ok)
                    .count();
                black_box(count);
            });
        });
    }

    group.finish();
}

/// Benchmark writing markers through the slot allocator.
fn bench_allocate_and_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_and_write");

    let temp_dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(temp_dir.path(), bench_config()).unwrap();
    let db = engine.create_database("bench").unwrap();
    let collection = engine
        .create_collection(
            db,
            &CollectionDefinition {
                name: "wal".to_string(),
                wait_for_sync: false,
                journal_size: 0,
            },
        )
        .unwrap();

    for size in [64, 1024].iter() {
        let marker = document_marker(*size);
        group.throughput(Throughput::Bytes(marker.size() as u64));
        group.bench_with_input(BenchmarkId::new("no_sync", size), &marker, |b, marker| {
            b.iter(|| {
                let written = engine
                    .allocate_and_write(db, collection, marker, false, false, false)
                    .unwrap();
                black_box(written);
            });
        });
    }

    group.sample_size(20);
    let marker = document_marker(256);
    group.bench_function("wait_for_sync_256", |b| {
        b.iter(|| {
            let written = engine
                .allocate_and_write(db, collection, &marker, true, true, true)
                .unwrap();
            black_box(written);
        });
    });

    group.finish();
    engine.shutdown().unwrap();
}

criterion_group!(
    benches,
    bench_marker_encode,
    bench_marker_scan,
    bench_allocate_and_write,
);

criterion_main!(benches);
