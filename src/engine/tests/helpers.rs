use crate::engine::{Engine, EngineConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Standard config: segment budget large enough that tests never rotate
/// unless they ask for it.
pub fn default_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        read_only: false,
        sync_on_put: false,
        max_file_size: 64 * 1024,
        max_value_size: 4096,
    }
}

/// Tiny segment budget that forces rotation after a handful of records.
///
/// With 8-byte values each record occupies 28 bytes on disk, so a
/// 128-byte budget seals a segment after exactly four records.
pub fn small_segment_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        read_only: false,
        sync_on_put: false,
        max_file_size: 128,
        max_value_size: 64,
    }
}

/// Read-only variant of [`default_config`].
pub fn read_only_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        read_only: true,
        sync_on_put: false,
        max_file_size: 64 * 1024,
        max_value_size: 4096,
    }
}

/// Helper: open an engine and load `num_keys` records with 8-byte values.
pub fn engine_with_records(path: &Path, config: EngineConfig, num_keys: i32) -> Engine {
    let engine = Engine::open(path, config).expect("open");
    for key in 0..num_keys {
        engine.put(key, value_for(key)).expect("put");
    }
    engine
}

/// Deterministic 8-byte value derived from the key.
pub fn value_for(key: i32) -> Vec<u8> {
    (key as i64).to_le_bytes().to_vec()
}

/// Collect the segment ids present in a store directory, ascending.
pub fn segment_ids_on_disk(path: &Path) -> Vec<u32> {
    let mut ids: Vec<u32> = std::fs::read_dir(path)
        .expect("read_dir")
        .map(|entry| entry.expect("dir entry").file_name())
        .filter_map(|name| crate::segment::parse_segment_id(&name.to_string_lossy()))
        .collect();
    ids.sort_unstable();
    ids
}
