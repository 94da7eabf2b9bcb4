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

pub fn constant_hash(_: &[u8]) -> u64 {
    7
}

/// 4 KiB chunks; the hint worker stays idle.
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

pub fn open_bucket(dir: &Path, config: BucketConfig) -> Bucket {
    Bucket::open(dir, config).unwrap()
}

pub fn put(bucket: &Bucket, key: &str, value: &str) {
    bucket
        .getset(
            key.as_bytes(),
            Payload::new(0, RecordFlag::Plain, 1_700_000_000, value.as_bytes().to_vec()),
        )
        .unwrap();
}

pub fn read(bucket: &Bucket, key: &str) -> Option<(String, i32)> {
    bucket
        .get(key.as_bytes(), false)
        .unwrap()
        .map(|p| (String::from_utf8(p.value).unwrap(), p.meta.version))
}

pub fn data_bytes(bucket: &Bucket) -> u64 {
    bucket
        .chunk_sizes()
        .unwrap()
        .iter()
        .map(|&(_, size)| u64::from(size))
        .sum()
}

pub fn key(i: usize) -> String {
    format!("key-{i:03}")
}

pub fn value(i: usize, round: usize) -> String {
    format!("{round}:{}", "v".repeat(96 + i % 5))
}

/// 100 keys at version 1; keys 0..50 rewritten to version 2; keys 50..60
/// deleted (version -2).
pub fn churn(bucket: &Bucket) {
    for i in 0..100 {
        put(bucket, &key(i), &value(i, 1));
    }
    for i in 0..50 {
        put(bucket, &key(i), &value(i, 2));
    }
    for i in 50..60 {
        bucket.delete(key(i).as_bytes()).unwrap();
    }
}

pub fn assert_churned(bucket: &Bucket) {
    for i in 0..50 {
        assert_eq!(read(bucket, &key(i)), Some((value(i, 2), 2)), "{}", key(i));
    }
    for i in 50..60 {
        let (_, version) = read(bucket, &key(i)).unwrap_or_default();
        assert!(version <= 0, "{} should be deleted, got {version}", key(i));
    }
    for i in 60..100 {
        assert_eq!(read(bucket, &key(i)), Some((value(i, 1), 1)), "{}", key(i));
    }
}
