use crate::record::{Payload, Record, RecordFlag};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn record(key: &str, version: i32, value: &str) -> Record {
    Record {
        key: key.as_bytes().to_vec(),
        payload: Payload::new(version, RecordFlag::Plain, 1_700_000_000, value.as_bytes().to_vec()),
    }
}
