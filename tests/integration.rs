//! Integration tests for the public `Store` API.
//!
//! These tests exercise the full stack (data log → hash tree → hint
//! segments → GC) through the public `hstore` surface only. No internal
//! modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, Drop-based cleanup
//! - **Versioned writes**: next-version writes, explicit versions, stale
//!   writes, deletes, counters
//! - **Persistence**: data and tombstones survive close → reopen
//! - **Compaction**: synchronous and scheduled GC keep every live key
//! - **Config validation**: every `StoreConfig` constraint violation
//! - **Error handling**: closed-store operations, bad keys
//! - **Concurrency**: parallel writers and readers on one store

use hstore::{
    BucketError, GcError, Payload, RecordFlag, Store, StoreConfig, StoreError, fnv1a_64,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Small chunks so a few hundred writes span several of them.
fn small_chunk_config() -> StoreConfig {
    StoreConfig {
        data_file_max: 4096,
        max_value_len: 1024,
        hint_dump_delay: Duration::ZERO,
        hint_dump_interval: Duration::from_secs(3600),
        hint_merge_interval: Duration::from_secs(3600),
        ..StoreConfig::default()
    }
}

fn value_of(store: &Store, key: &str) -> Option<(String, i32)> {
    store.get(key.as_bytes()).unwrap().and_then(|p| {
        p.meta
            .is_live()
            .then(|| (String::from_utf8(p.value).unwrap(), p.meta.version))
    })
}

fn payload(version: i32, value: &str) -> Payload {
    Payload::new(version, RecordFlag::Plain, 0, value.as_bytes().to_vec())
}

// ================================================================================================
// Lifecycle
// ================================================================================================

#[test]
fn open_close_empty() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    store.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    store.close().unwrap();
    store.close().unwrap();
}

/// # Scenario
/// Dropping the handle without calling `close()` must still persist data.
///
/// # Expected behavior
/// The `Drop` impl closes the bucket; the reopened store serves the key.
#[test]
fn drop_without_close() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    store.set(b"key", b"value").unwrap();
    drop(store);

    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    assert_eq!(value_of(&store, "key"), Some(("value".into(), 1)));
    store.close().unwrap();
}

// ================================================================================================
// Versioned writes
// ================================================================================================

/// # Scenario
/// `set(k, "a")`, `set(k, "b")`, then `delete(k)`.
///
/// # Expected behavior
/// The second write reads back as `"b"` with version 2; the delete leaves a
/// tombstone with version -3.
#[test]
fn overwrite_then_delete() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();

    store.set(b"k", b"a").unwrap();
    store.set(b"k", b"b").unwrap();
    assert_eq!(value_of(&store, "k"), Some(("b".into(), 2)));

    store.delete(b"k").unwrap();
    let tomb = store.get(b"k").unwrap().unwrap();
    assert!(tomb.is_deleted());
    assert_eq!(tomb.meta.version, -3);
    assert_eq!(store.get_meta(b"k").unwrap().unwrap().version, -3);
    store.close().unwrap();
}

#[test]
fn get_missing_key() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(store.get(b"nope").unwrap().is_none());
    assert!(store.get_meta(b"nope").unwrap().is_none());
    store.close().unwrap();
}

/// # Scenario
/// An explicit version 5, then a stale explicit version 3.
///
/// # Expected behavior
/// The stale write is silently dropped and version 5 stays.
#[test]
fn stale_explicit_version_is_dropped() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();

    store.getset(b"k", payload(5, "five")).unwrap();
    store.getset(b"k", payload(3, "three")).unwrap();
    assert_eq!(value_of(&store, "k"), Some(("five".into(), 5)));

    store.getset(b"k", payload(0, "six")).unwrap();
    assert_eq!(value_of(&store, "k"), Some(("six".into(), 6)));
    store.close().unwrap();
}

#[test]
fn counters() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();

    assert_eq!(store.incr(b"hits", 3).unwrap(), 3);
    assert_eq!(store.incr(b"hits", -1).unwrap(), 2);
    assert_eq!(value_of(&store, "hits"), Some(("2".into(), 2)));

    store.set(b"plain", b"text").unwrap();
    assert!(matches!(
        store.incr(b"plain", 1),
        Err(StoreError::Bucket(BucketError::InvalidArgument(_)))
    ));
    assert_eq!(value_of(&store, "plain"), Some(("text".into(), 1)));
    store.close().unwrap();
}

/// # Scenario
/// A key is written, then the hash-tree directory of its hash is listed.
///
/// # Expected behavior
/// The root listing counts one key; the full-hash path names its version.
#[test]
fn list_dir_finds_a_key_by_hash() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    store.set(b"listed", b"v").unwrap();

    let root = store.list_dir("").unwrap();
    assert_eq!(root.len(), 1);
    assert!(root[0].contains("/ 1 "));

    let hash = format!("{:016x}", fnv1a_64(b"listed"));
    let leaf = store.list_dir(&hash).unwrap();
    assert_eq!(leaf.len(), 1);
    assert!(leaf[0].starts_with(&format!("{hash} 1 ")));

    let via_get = store.get(format!("@{hash}").as_bytes()).unwrap().unwrap();
    assert_eq!(String::from_utf8(via_get.value).unwrap(), leaf[0]);
    store.close().unwrap();
}

// ================================================================================================
// Persistence
// ================================================================================================

#[test]
fn persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path(), small_chunk_config()).unwrap();
        for i in 0..200 {
            store
                .set(format!("key-{i:03}").as_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        store.delete(b"key-010").unwrap();
        store.close().unwrap();
    }

    let store = Store::open(dir.path(), small_chunk_config()).unwrap();
    assert!(store.chunk_sizes().unwrap().len() > 1);
    for i in (0..200).filter(|&i| i != 10) {
        assert_eq!(
            value_of(&store, &format!("key-{i:03}")),
            Some((format!("value-{i}"), 1))
        );
    }
    assert_eq!(store.get_meta(b"key-010").unwrap().unwrap().version, -2);
    store.close().unwrap();
}

// ================================================================================================
// Compaction
// ================================================================================================

/// # Scenario
/// Every key is written three times across many chunks, then GC runs over
/// the whole log.
///
/// # Expected behavior
/// The data shrinks, every key keeps its last value and version, and the
/// run lands in the history.
#[test]
fn gc_reclaims_overwrites() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), small_chunk_config()).unwrap();
    for round in 1..=3 {
        for i in 0..60 {
            store
                .set(format!("key-{i:02}").as_bytes(), format!("r{round}-{}", "x".repeat(40)).as_bytes())
                .unwrap();
        }
    }
    let before: u64 = store.chunk_sizes().unwrap().iter().map(|&(_, s)| u64::from(s)).sum();

    let run = store.gc(0, u32::MAX).unwrap();
    assert!(run.error.is_none());
    assert!(run.bytes_released() > 0);

    let after: u64 = store.chunk_sizes().unwrap().iter().map(|&(_, s)| u64::from(s)).sum();
    assert!(after < before);
    for i in 0..60 {
        assert_eq!(
            value_of(&store, &format!("key-{i:02}")),
            Some((format!("r3-{}", "x".repeat(40)), 3))
        );
    }
    assert_eq!(store.gc_history().len(), 1);
    store.close().unwrap();
}

/// # Scenario
/// A GC run is queued on the background pool and the store is closed.
///
/// # Expected behavior
/// `close` waits for the run; after reopening, the history holds it and
/// the data is intact.
#[test]
fn scheduled_gc_finishes_before_close() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path(), small_chunk_config()).unwrap();
        for round in 1..=2 {
            for i in 0..80 {
                store
                    .set(format!("key-{i:02}").as_bytes(), format!("r{round}-{}", "y".repeat(30)).as_bytes())
                    .unwrap();
            }
        }
        store.schedule_gc(0, u32::MAX).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(dir.path(), small_chunk_config()).unwrap();
    let history = store.gc_history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].running);
    assert!(history[0].error.is_none());
    for i in 0..80 {
        assert_eq!(
            value_of(&store, &format!("key-{i:02}")),
            Some((format!("r2-{}", "y".repeat(30)), 2))
        );
    }
    store.close().unwrap();
}

#[test]
fn gc_rejects_inverted_range() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    assert!(matches!(
        store.gc(5, 1),
        Err(StoreError::Bucket(BucketError::Gc(GcError::InvalidRange { .. })))
    ));
    store.close().unwrap();
}

// ================================================================================================
// Config validation
// ================================================================================================

fn assert_invalid(config: StoreConfig) {
    let dir = TempDir::new().unwrap();
    let err = Store::open(dir.path(), config).unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig(_)), "{err}");
}

#[test]
fn config_data_file_too_small() {
    assert_invalid(StoreConfig {
        data_file_max: 512,
        max_value_len: 100,
        ..StoreConfig::default()
    });
}

#[test]
fn config_value_larger_than_chunk() {
    assert_invalid(StoreConfig {
        data_file_max: 4096,
        max_value_len: 4096,
        ..StoreConfig::default()
    });
}

#[test]
fn config_zero_key_len() {
    assert_invalid(StoreConfig {
        max_key_len: 0,
        ..StoreConfig::default()
    });
}

#[test]
fn config_zero_hint_buffer() {
    assert_invalid(StoreConfig {
        hint_buffer_max_items: 0,
        ..StoreConfig::default()
    });
}

#[test]
fn config_zero_dump_interval() {
    assert_invalid(StoreConfig {
        hint_dump_interval: Duration::ZERO,
        ..StoreConfig::default()
    });
}

#[test]
fn config_zero_threads() {
    assert_invalid(StoreConfig {
        thread_pool_size: 0,
        ..StoreConfig::default()
    });
}

// ================================================================================================
// Error handling
// ================================================================================================

#[test]
fn operations_after_close() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
    store.close().unwrap();

    assert!(matches!(store.get(b"k"), Err(StoreError::Closed)));
    assert!(matches!(store.set(b"k", b"v"), Err(StoreError::Closed)));
    assert!(matches!(store.delete(b"k"), Err(StoreError::Closed)));
    assert!(matches!(store.incr(b"k", 1), Err(StoreError::Closed)));
    assert!(matches!(store.gc(0, 1), Err(StoreError::Closed)));
    assert!(matches!(store.schedule_gc(0, 1), Err(StoreError::Closed)));
}

/// # Scenario
/// Empty, oversized and directory-path keys are written.
///
/// # Expected behavior
/// Each write fails with `InvalidArgument` and nothing is stored.
#[test]
fn bad_keys_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), StoreConfig::default()).unwrap();

    for key in [Vec::new(), vec![b'k'; 251], b"@abc".to_vec()] {
        assert!(matches!(
            store.set(&key, b"v"),
            Err(StoreError::Bucket(BucketError::InvalidArgument(_)))
        ));
    }
    assert!(store.list_dir("").unwrap().is_empty());
    store.close().unwrap();
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Four writers own disjoint key ranges while two readers poll them.
///
/// # Expected behavior
/// No operation fails; afterwards every key holds its writer's last value.
#[test]
fn concurrent_writes_and_reads() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path(), small_chunk_config()).unwrap());

    let mut handles = Vec::new();
    for t in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for round in 0..5 {
                for i in 0..25 {
                    store
                        .set(format!("t{t}-{i:02}").as_bytes(), format!("{round}").as_bytes())
                        .unwrap();
                }
            }
        }));
    }
    for _ in 0..2 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                for t in 0..4 {
                    if let Some(p) = store.get(format!("t{t}-00").as_bytes()).unwrap() {
                        assert!(p.meta.version >= 1);
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..25 {
            assert_eq!(value_of(&store, &format!("t{t}-{i:02}")), Some(("4".into(), 5)));
        }
    }
    store.close().unwrap();
}
