//! Stress tests for docdb.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::fixtures::{scenarios, TestEngine};
use ciborium::Value;
use docdb_core::{CollectionDefinition, CollectionId, DocumentOperation, TransactionHints};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform, per thread for concurrent tests.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of the text field of each document in bytes.
    pub document_size: usize,
    /// Number of operations per multi-operation transaction.
    pub batch_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            document_size: 256,
            batch_size: 100,
        }
    }
}

fn sized_body(i: usize, size: usize) -> Value {
    Value::Map(vec![
        (Value::Text("index".to_string()), Value::Integer((i as u64).into())),
        (Value::Text("data".to_string()), Value::Text("x".repeat(size))),
    ])
}

/// Run a sequential write stress test.
pub fn stress_sequential_writes(engine: &TestEngine, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0;
    let mut failed = 0;

    for i in 0..config.operations {
        match engine.insert(
            engine.database,
            engine.collection,
            &scenarios::numbered_key(i),
            sized_body(i, config.document_size),
        ) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent writers, one collection per thread.
///
/// Returns the result and the collections that were written.
pub fn stress_concurrent_writes(
    engine: &TestEngine,
    config: &StressConfig,
) -> (StressTestResult, Vec<CollectionId>) {
    let collections: Vec<CollectionId> = (0..config.threads)
        .map(|t| {
            engine
                .create_collection(
                    engine.database,
                    &CollectionDefinition {
                        name: format!("writer_{t}"),
                        wait_for_sync: false,
                        journal_size: 0,
                    },
                )
                .expect("Failed to create collection")
        })
        .collect();

    let start = Instant::now();
    let counts: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = collections
            .iter()
            .map(|collection| {
                scope.spawn(move || {
                    let mut successful = 0;
                    let mut failed = 0;
                    for i in 0..config.operations {
                        match engine.insert(
                            engine.database,
                            *collection,
                            &scenarios::numbered_key(i),
                            sized_body(i, config.document_size),
                        ) {
                            Ok(_) => successful += 1,
                            Err(_) => failed += 1,
                        }
                    }
                    (successful, failed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("writer thread panicked"))
            .collect()
    });

    let successful = counts.iter().map(|(s, _)| s).sum();
    let failed = counts.iter().map(|(_, f)| f).sum();
    (
        StressTestResult::new(successful, failed, start.elapsed()),
        collections,
    )
}

/// Run transactions that are all aborted after writing a batch.
pub fn stress_transaction_aborts(engine: &TestEngine, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0;
    let mut failed = 0;

    for round in 0..config.operations / config.batch_size.max(1) {
        let result = (|| {
            let mut trx = engine.begin_transaction(
                engine.database,
                &[engine.collection],
                TransactionHints::default(),
            )?;
            for i in 0..config.batch_size {
                trx.add_operation(
                    engine.collection,
                    DocumentOperation::Upsert {
                        key: format!("aborted-{round}-{i}"),
                        body: sized_body(i, config.document_size),
                    },
                )?;
            }
            trx.abort()
        })();
        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run large multi-operation transactions.
pub fn stress_large_transactions(engine: &TestEngine, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0;
    let mut failed = 0;

    for round in 0..config.operations / config.batch_size.max(1) {
        let result = (|| {
            let mut trx = engine.begin_transaction(
                engine.database,
                &[engine.collection],
                TransactionHints::default(),
            )?;
            for i in 0..config.batch_size {
                trx.add_operation(
                    engine.collection,
                    DocumentOperation::Upsert {
                        key: scenarios::numbered_key(round * config.batch_size + i),
                        body: sized_body(i, config.document_size),
                    },
                )?;
            }
            trx.commit().map(|_| ())
        })();
        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> StressConfig {
        StressConfig {
            operations: 200,
            threads: 4,
            document_size: 64,
            batch_size: 20,
        }
    }

    #[test]
    fn test_sequential_writes() {
        let engine = TestEngine::new();
        let result = stress_sequential_writes(&engine, &small_config());
        assert_eq!(result.successful_ops, 200);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_concurrent_writes_survive_crash() {
        let mut engine = TestEngine::new();
        let (result, collections) = stress_concurrent_writes(&engine, &small_config());
        assert_eq!(result.failed_ops, 0);

        engine.crash_and_recover().unwrap();
        for collection in collections {
            for i in [0, 99, 199] {
                let doc = engine
                    .document(engine.database, collection, &scenarios::numbered_key(i))
                    .unwrap();
                assert!(doc.is_some(), "{collection} lost document {i}");
            }
        }
    }

    #[test]
    fn test_transaction_aborts() {
        let mut engine = TestEngine::new();
        let result = stress_transaction_aborts(&engine, &small_config());
        assert_eq!(result.successful_ops, 10);

        engine.crash_and_recover().unwrap();
        assert!(engine.get("aborted-0-0").is_none());
        assert!(engine.get("aborted-9-19").is_none());
    }

    #[test]
    fn test_large_transactions() {
        let mut engine = TestEngine::new();
        let result = stress_large_transactions(&engine, &small_config());
        assert_eq!(result.successful_ops, 10);

        engine.restart().unwrap();
        assert!(engine.get(&scenarios::numbered_key(199)).is_some());
    }
}
