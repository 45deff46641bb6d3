//! Extra integration tests targeting uncovered code paths in `engine::mod`.
//!
//! These tests exercise:
//! - no-explicit-close durability (write-ahead log recovery on reopen)
//! - the manual flush → minor-compact → tombstone-compact cycle
//! - `delete_range` freeze trigger
//! - additional `EngineConfig` field combinations

use sophia_engine::engine::{Engine, EngineConfig};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn base_config() -> EngineConfig {
    EngineConfig {
        write_buffer_size: 4096,
        compaction_strategy: sophia_engine::compaction::CompactionStrategyType::Stcs,
        bucket_low: 0.5,
        bucket_high: 1.5,
        min_sstable_size: 50,
        min_threshold: 4,
        max_threshold: 32,
        tombstone_ratio_threshold: 0.3,
        tombstone_compaction_interval: 0,
        tombstone_bloom_fallback: true,
        tombstone_range_drop: true,
        thread_pool_size: 2,
    }
}

/// Tiny buffer to force frequent flushes.
fn tiny_config() -> EngineConfig {
    EngineConfig {
        write_buffer_size: 1024,
        min_threshold: 2,
        max_threshold: 4,
        tombstone_ratio_threshold: 0.1,
        thread_pool_size: 2,
        ..base_config()
    }
}

// ================================================================================================
// Drop-based cleanup (no explicit close)
// ================================================================================================

/// Open a database, write data, then drop without calling `close()`.
/// Reopen and verify data is durable — each write is already WAL-backed.
#[test]
fn drop_without_close_is_safe() {
    let tmp = TempDir::new().unwrap();

    {
        let db = Engine::open(tmp.path(), base_config()).unwrap();
        db.put(b"key1".to_vec(), b"val1".to_vec()).unwrap();
        db.put(b"key2".to_vec(), b"val2".to_vec()).unwrap();
    }

    {
        let db = Engine::open(tmp.path(), base_config()).unwrap();
        assert_eq!(db.get(b"key1".to_vec()).unwrap(), Some(b"val1".to_vec()));
        assert_eq!(db.get(b"key2".to_vec()).unwrap(), Some(b"val2".to_vec()));
        db.close().unwrap();
    }
}

// ================================================================================================
// Manual flush / compact cycle
// ================================================================================================

/// Write enough data to freeze several memtables, flush them all to
/// SSTables, then run minor and tombstone compaction over the result.
#[test]
fn flush_and_compact_cycle() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open(tmp.path(), tiny_config()).unwrap();

    for i in 0..200u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        db.put(key.into_bytes(), val.into_bytes()).unwrap();
    }

    for i in 0..100u32 {
        let key = format!("k{i:04}");
        db.delete(key.into_bytes()).unwrap();
    }

    for i in 200..300u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        db.put(key.into_bytes(), val.into_bytes()).unwrap();
    }

    db.flush_all_frozen().unwrap();
    db.minor_compact().unwrap();
    db.tombstone_compact().unwrap();

    for i in 100..300u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        assert_eq!(
            db.get(key.into_bytes()).unwrap(),
            Some(val.into_bytes()),
            "key k{i:04} should exist"
        );
    }

    db.close().unwrap();
}

// ================================================================================================
// delete_range triggering freeze
// ================================================================================================

/// Use a tiny write buffer plus a large range delete to trigger the
/// freeze path through `delete_range`, then flush and verify.
#[test]
fn delete_range_triggers_flush() {
    let tmp = TempDir::new().unwrap();
    let db = Engine::open(tmp.path(), tiny_config()).unwrap();

    for i in 0..50u32 {
        let key = format!("r{i:04}");
        let val = format!("v{i:04}");
        db.put(key.into_bytes(), val.into_bytes()).unwrap();
    }

    db.delete_range(b"r0000".to_vec(), b"r0050".to_vec())
        .unwrap();
    db.flush_all_frozen().unwrap();

    for i in 0..50u32 {
        let key = format!("r{i:04}");
        assert_eq!(
            db.get(key.into_bytes()).unwrap(),
            None,
            "r{i:04} should be deleted"
        );
    }

    db.close().unwrap();
}

// ================================================================================================
// Additional EngineConfig field combinations
// ================================================================================================

/// `tombstone_compaction_interval` of a full week is accepted as a plain
/// `usize` — the engine does not bound it.
#[test]
fn config_tombstone_interval_one_week() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        tombstone_compaction_interval: 604_800,
        ..base_config()
    };
    let db = Engine::open(tmp.path(), config).unwrap();
    db.close().unwrap();
}

/// `tombstone_ratio_threshold` at exactly `1.0` is a valid ratio.
#[test]
fn config_tombstone_ratio_at_one() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        tombstone_ratio_threshold: 1.0,
        ..base_config()
    };
    let db = Engine::open(tmp.path(), config).unwrap();
    db.close().unwrap();
}

/// A larger `thread_pool_size` is accepted (the field is advisory — the
/// engine itself does not spawn the pool).
#[test]
fn config_thread_pool_large() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        thread_pool_size: 32,
        ..base_config()
    };
    let db = Engine::open(tmp.path(), config).unwrap();
    db.close().unwrap();
}

/// `write_buffer_size` of exactly 1024 bytes is accepted and still
/// forces frequent freezes under sustained writes.
#[test]
fn config_write_buffer_small() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        write_buffer_size: 1024,
        ..base_config()
    };
    let db = Engine::open(tmp.path(), config).unwrap();
    db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    assert_eq!(db.get(b"a".to_vec()).unwrap(), Some(b"1".to_vec()));
    db.close().unwrap();
}
