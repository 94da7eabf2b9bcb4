use crate::bucket::{Bucket, BucketConfig};
use crate::hint::HintConfig;
use crate::record::{Payload, RecordFlag};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Every key lands on the same hash.
pub fn constant_hash(_: &[u8]) -> u64 {
    42
}

/// Small chunks, and a hint worker that never fires during a test.
pub fn config() -> BucketConfig {
    BucketConfig {
        data_file_max: 4096,
        hint: HintConfig {
            buffer_max_items: 1024,
            dump_delay: Duration::ZERO,
            dump_interval: Duration::from_secs(3600),
            merge_interval: Duration::from_secs(3600),
        },
        ..BucketConfig::default()
    }
}

pub fn colliding_config() -> BucketConfig {
    BucketConfig {
        key_hasher: constant_hash,
        ..config()
    }
}

pub fn open_bucket(dir: &Path, config: BucketConfig) -> Bucket {
    Bucket::open(dir, config).unwrap()
}

pub fn payload(version: i32, value: &str) -> Payload {
    Payload::new(version, RecordFlag::Plain, 1_700_000_000, value.as_bytes().to_vec())
}

pub fn put(bucket: &Bucket, key: &str, version: i32, value: &str) {
    bucket.getset(key.as_bytes(), payload(version, value)).unwrap();
}

/// `(value, version)` of a key, tombstones included.
pub fn read(bucket: &Bucket, key: &str) -> Option<(String, i32)> {
    bucket
        .get(key.as_bytes(), false)
        .unwrap()
        .map(|p| (String::from_utf8(p.value).unwrap(), p.meta.version))
}

pub fn version_of(bucket: &Bucket, key: &str) -> Option<i32> {
    bucket
        .get(key.as_bytes(), true)
        .unwrap()
        .map(|p| p.meta.version)
}

/// Total bytes across all data chunks.
pub fn data_bytes(bucket: &Bucket) -> u64 {
    bucket
        .chunk_sizes()
        .unwrap()
        .iter()
        .map(|&(_, size)| u64::from(size))
        .sum()
}
