//! Benchmark utilities.

use ciborium::Value;
use docdb_core::{Config, MIN_JOURNAL_SIZE};
use rand::Rng;
use std::time::Duration;

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a document body whose encoding is roughly `size` bytes.
pub fn document_body(size: usize) -> Value {
    Value::Map(vec![
        (Value::Text("kind".to_string()), Value::Text("bench".to_string())),
        (Value::Text("data".to_string()), Value::Bytes(random_data(size))),
    ])
}

/// Generate `count` keys.
pub fn generate_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("key-{i:08}")).collect()
}

/// Engine configuration for benchmarks: 32 MB logfiles and a fast
/// synchronizer.
pub fn bench_config() -> Config {
    Config::default()
        .journal_size(MIN_JOURNAL_SIZE * 4)
        .sync_interval(Duration::from_millis(5))
        .collector_interval(Duration::from_millis(100))
}
