use crate::collision::CollisionTable;
use crate::hint::{HintConfig, HintManager};
use crate::key::KeyDescriptor;
use crate::position::Position;
use crate::record::VersionedMeta;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A config whose worker never fires during a test.
pub fn quiet_config(buffer_max_items: usize) -> HintConfig {
    HintConfig {
        buffer_max_items,
        dump_delay: Duration::ZERO,
        dump_interval: Duration::from_secs(3600),
        merge_interval: Duration::from_secs(3600),
    }
}

pub fn open_manager(dir: &Path, buffer_max_items: usize) -> (Arc<HintManager>, Arc<CollisionTable>) {
    let collisions = Arc::new(CollisionTable::open(dir));
    let hints = HintManager::open(dir, quiet_config(buffer_max_items), Arc::clone(&collisions)).unwrap();
    (hints, collisions)
}

pub fn meta(version: i32) -> VersionedMeta {
    VersionedMeta {
        version,
        value_hash: version.unsigned_abs() * 11,
    }
}

/// Records a hint for a 32-byte record.
pub fn put(hints: &HintManager, key: &str, hash: u64, version: i32, pos: Position) {
    let ki = KeyDescriptor::with_hash(key.as_bytes(), hash);
    hints.set(&ki, meta(version), pos, 32).unwrap();
}
