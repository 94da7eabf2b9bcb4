//! Micro-benchmarks for hstore core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- getset    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use hstore::{Store, StoreConfig};
use std::time::Duration;
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default value payload for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Larger value payload (1 KiB).
const VALUE_1K: &[u8; 1024] = &[0xCD; 1024];

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// 1 MiB chunks so sustained writes seal chunks and GC has work.
fn small_chunk_config() -> StoreConfig {
    StoreConfig {
        data_file_max: 1024 * 1024,
        max_value_len: 64 * 1024,
        hint_dump_delay: Duration::ZERO,
        thread_pool_size: 1,
        ..StoreConfig::default()
    }
}

fn open_small_chunks(dir: &std::path::Path) -> Store {
    Store::open(dir, small_chunk_config()).expect("open")
}

/// Pre-populate a store with `count` sequential keys and close it, so hint
/// segments and a hash-tree snapshot exist on disk.
fn prepopulate(dir: &std::path::Path, count: u64, value: &[u8]) {
    let store = open_small_chunks(dir);
    for i in 0..count {
        store.set(&make_key(i), value).unwrap();
    }
    store.close().unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// Benchmark group for versioned writes.
///
/// # Sub-benchmarks
///
/// ## `new_key/128B` and `new_key/1K`
///
/// **Scenario:** Writes a fresh key per iteration.
///
/// **What it measures:** Version lookup of an absent key, the data-log
/// append, and the hash-tree and hint-buffer updates.
///
/// ## `overwrite`
///
/// **Scenario:** Rewrites 1,000 keys round-robin with changing values.
///
/// **What it measures:** The full read-modify-write path: the stored
/// record is read back to verify its key before the next version is
/// appended.
///
/// ## `duplicate`
///
/// **Scenario:** Re-sends the same value for a key that already has
/// version ≥ 2.
///
/// **What it measures:** The duplicate-content short-circuit, which skips
/// the append entirely.
fn bench_getset(c: &mut Criterion) {
    let mut group = c.benchmark_group("getset");

    for &(label, value) in &[("128B", VALUE_128B.as_slice()), ("1K", VALUE_1K.as_slice())] {
        group.bench_function(BenchmarkId::new("new_key", label), |b| {
            let dir = TempDir::new().unwrap();
            let store = open_small_chunks(dir.path());
            let mut seq = 0u64;

            b.iter(|| {
                let key = make_key(seq);
                store.set(black_box(&key), black_box(value)).unwrap();
                seq += 1;
            });

            store.close().unwrap();
        });
    }

    group.bench_function("overwrite", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_small_chunks(dir.path());
        let n = 1_000u64;
        for i in 0..n {
            store.set(&make_key(i), VALUE_128B).unwrap();
        }
        let mut seq = 0u64;

        b.iter(|| {
            let key = make_key(seq % n);
            let value = seq.to_le_bytes();
            store.set(black_box(&key), black_box(&value)).unwrap();
            seq += 1;
        });

        store.close().unwrap();
    });

    group.bench_function("duplicate", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_small_chunks(dir.path());
        store.set(b"dup", b"first").unwrap();
        store.set(b"dup", VALUE_128B).unwrap();

        b.iter(|| {
            store.set(black_box(b"dup"), black_box(VALUE_128B)).unwrap();
        });

        store.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// Benchmark group for reads.
///
/// # Sub-benchmarks
///
/// ## `hit` and `miss`
///
/// **Scenario:** 10,000 keys written and the store reopened, so the hash
/// tree comes from a snapshot. Reads cycle through existing keys, or ask
/// for keys above that range.
///
/// **What it measures:** Hash-tree lookup plus one positional read of the
/// data log for a hit; a miss stops at the hash tree.
///
/// ## `meta_only`
///
/// **Scenario:** As `hit`, without returning the value.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    let dir = TempDir::new().unwrap();
    let n = 10_000u64;
    prepopulate(dir.path(), n, VALUE_128B);
    let store = open_small_chunks(dir.path());

    group.bench_function("hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(i % n);
            let _ = black_box(store.get(black_box(&key)).unwrap());
            i += 1;
        });
    });

    group.bench_function("miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(n + i);
            let _ = black_box(store.get(black_box(&key)).unwrap());
            i += 1;
        });
    });

    group.bench_function("meta_only", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(i % n);
            let _ = black_box(store.get_meta(black_box(&key)).unwrap());
            i += 1;
        });
    });

    store.close().unwrap();
    group.finish();
}

// ================================================================================================
// Counter benchmark
// ================================================================================================

fn bench_incr(c: &mut Criterion) {
    let mut group = c.benchmark_group("incr");

    group.bench_function("single_counter", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_small_chunks(dir.path());
        b.iter(|| {
            black_box(store.incr(black_box(b"counter"), 1).unwrap());
        });
        store.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// GC benchmark
// ================================================================================================

/// Benchmark group for compaction.
///
/// # Sub-benchmarks
///
/// ## `overwritten/5000`
///
/// **Scenario:** 5,000 keys written twice with 1 KiB values over 1 MiB
/// chunks, then GC over every sealed chunk. Each iteration starts from a
/// freshly built store, excluded from the measurement.
///
/// **What it measures:** The full GC pass: hint flush and merge, the
/// sequential scan with liveness checks, the rewrite and the index swap.
/// Sample size is reduced to 10 because each iteration is slow.
fn bench_gc(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc");
    group.sample_size(10);

    let count = 5_000u64;
    group.throughput(Throughput::Bytes(count * 2 * VALUE_1K.len() as u64));
    group.bench_function(BenchmarkId::new("overwritten", count), |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store = open_small_chunks(dir.path());
                for round in 0..2u8 {
                    let mut value = *VALUE_1K;
                    value[0] = round;
                    for i in 0..count {
                        store.set(&make_key(i), &value).unwrap();
                    }
                }
                (dir, store)
            },
            |(_dir, store)| {
                black_box(store.gc(0, u32::MAX).unwrap());
                store.close().unwrap();
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ================================================================================================
// Recovery benchmark
// ================================================================================================

/// Benchmark group for open latency.
///
/// # Sub-benchmarks
///
/// ## `open_existing/1000` and `open_existing/10000`
///
/// **Scenario:** A store is prepopulated with N keys and closed. Each
/// iteration opens it again.
///
/// **What it measures:** Snapshot load and the hint-coverage check of the
/// chunks it describes.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);

    for &count in &[1_000u64, 10_000] {
        group.bench_function(BenchmarkId::new("open_existing", count), |b| {
            let dir = TempDir::new().unwrap();
            prepopulate(dir.path(), count, VALUE_128B);

            b.iter(|| {
                let store = open_small_chunks(dir.path());
                black_box(&store);
                store.close().unwrap();
            });
        });
    }

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(
    benches,
    bench_getset,
    bench_get,
    bench_incr,
    bench_gc,
    bench_recovery,
);

criterion_main!(benches);
