//! End-to-end scenarios exercising the environment/database/node layers
//! together: single-key CRUD, transaction snapshot isolation, the
//! branch/compact pipeline, recovery without a graceful shutdown, an MVCC
//! write/write conflict, and backup.
//!
//! ## See also
//! - [`integration`], [`integration_coverage`], [`integration_hardening`] —
//!   the underlying `engine::Engine` surface each node wraps

use sophia_engine::compaction::CompactionStrategyType;
use sophia_engine::engine::EngineConfig;
use sophia_engine::environment::{Environment, SophiaConfig, SophiaError};
use sophia_engine::mvcc::MvccError;
use sophia_engine::node::Node;
use sophia_engine::schema::{KeyPart, KeyPartType, Schema};
use tempfile::TempDir;

fn string_schema() -> Schema {
    Schema::new(vec![KeyPart::new("k", KeyPartType::String)]).unwrap()
}

// ================================================================================================
// Scenario 1 — basic put/get/delete, single key part
// ================================================================================================

#[test]
fn basic_put_get_delete_single_key_part() {
    let tmp = TempDir::new().unwrap();
    let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
    let db = env.create_database("kv", string_schema()).unwrap();

    db.set_auto_commit(env.mvcc(), env.sequence(), b"alice".to_vec(), b"1".to_vec(), None)
        .unwrap();
    db.set_auto_commit(env.mvcc(), env.sequence(), b"bob".to_vec(), b"2".to_vec(), None)
        .unwrap();
    assert_eq!(db.get_committed(b"alice").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get_committed(b"bob").unwrap(), Some(b"2".to_vec()));

    db.delete_auto_commit(env.mvcc(), env.sequence(), b"alice".to_vec(), None)
        .unwrap();
    assert_eq!(db.get_committed(b"alice").unwrap(), None);
    assert_eq!(db.get_committed(b"bob").unwrap(), Some(b"2".to_vec()));

    env.shutdown();
}

// ================================================================================================
// Scenario 2 — transaction snapshot isolation
// ================================================================================================

/// An explicit transaction's own pending writes are visible to its own
/// reads immediately, but invisible to a committed read from outside the
/// transaction until it actually commits. There is no vlsn-bounded
/// historical read of already-committed versions here — `get_committed`
/// and a plain node scan both always return the latest committed value for
/// a key, never an older one pinned to some earlier sequence number.
#[test]
fn transaction_snapshot_isolation_own_writes_visible_before_commit() {
    let tmp = TempDir::new().unwrap();
    let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
    let db = env.create_database("kv", string_schema()).unwrap();

    db.set_auto_commit(env.mvcc(), env.sequence(), b"k".to_vec(), b"old".to_vec(), None)
        .unwrap();

    let txn = env.begin_transaction();
    db.set(env.mvcc(), &txn, b"k".to_vec(), b"new".to_vec()).unwrap();

    // The transaction sees its own pending write...
    assert_eq!(db.get(env.mvcc(), &txn, b"k").unwrap(), Some(b"new".to_vec()));
    // ...but a committed read still sees the prior value until commit.
    assert_eq!(db.get_committed(b"k").unwrap(), Some(b"old".to_vec()));

    env.commit_transaction(&txn).unwrap();
    assert_eq!(db.get_committed(b"k").unwrap(), Some(b"new".to_vec()));

    env.shutdown();
}

// ================================================================================================
// Scenario 3 — branch + compact pipeline
// ================================================================================================

/// Writes enough records through a tiny write buffer to accumulate several
/// branches, drains every frozen memtable to a branch, then runs major
/// compaction until the branch chain collapses to a single branch, and
/// verifies the merged data is still readable in order.
#[test]
fn branch_and_compact_pipeline_collapses_to_one_branch() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        write_buffer_size: 16 * 1024,
        compaction_strategy: CompactionStrategyType::Stcs,
        bucket_low: 0.5,
        bucket_high: 1.5,
        min_sstable_size: 1024,
        min_threshold: 2,
        max_threshold: 8,
        tombstone_ratio_threshold: 0.3,
        tombstone_compaction_interval: 0,
        tombstone_bloom_fallback: true,
        tombstone_range_drop: true,
        thread_pool_size: 1,
    };
    let node = Node::open(tmp.path(), 1, None, config).unwrap();

    let record_value = vec![0x42u8; 256];
    let total = 4_000u32;
    for i in 0..total {
        let key = format!("k{i:06}").into_bytes();
        node.put(key, record_value.clone()).unwrap();
    }

    // Drain every frozen memtable to its own branch.
    while node.branch().unwrap() {}

    // Merge everything down to one branch.
    while node.compact_major().unwrap() {}

    let stats = node.stats(16 * 1024, 0, 0, total as u64).unwrap();
    assert!(stats.branch_count <= 1, "expected at most one branch after major compaction, got {}", stats.branch_count);

    let scanned = node.scan(b"k000000", b"k999999").unwrap();
    assert_eq!(scanned.len(), total as usize);
    let keys: Vec<_> = scanned.iter().map(|(k, _)| k.clone()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "scan must already return keys in order");
    for (_, v) in &scanned {
        assert_eq!(v, &record_value);
    }
}

// ================================================================================================
// Scenario 4 — recovery without a graceful shutdown
// ================================================================================================

/// Simulates a crash: writes are left in place without calling
/// `Environment::shutdown`, which would otherwise join the background
/// worker pool in an orderly way. Reopening at the same root must still
/// recover every committed write, since each one is WAL-durable the moment
/// `set_auto_commit` returns.
#[test]
fn recovery_without_graceful_shutdown_preserves_committed_writes() {
    let tmp = TempDir::new().unwrap();

    {
        let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
        let db = env.create_database("kv", string_schema()).unwrap();
        for i in 0..200u32 {
            let key = format!("k{i:04}").into_bytes();
            let value = format!("v{i:04}").into_bytes();
            db.set_auto_commit(env.mvcc(), env.sequence(), key, value, None)
                .unwrap();
        }
        // Deliberately no `env.shutdown()` here.
    }

    let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
    let db = env.database("kv").unwrap();
    for i in 0..200u32 {
        let key = format!("k{i:04}").into_bytes();
        let expected = format!("v{i:04}").into_bytes();
        assert_eq!(db.get_committed(&key).unwrap(), Some(expected));
    }
    env.shutdown();
}

// ================================================================================================
// Scenario 5 — MVCC write/write conflict
// ================================================================================================

/// Two transactions both write the same key while both are still open. The
/// second writer links onto the chain behind the first; when the second
/// transaction tries to commit, `prepare` finds the first transaction's
/// still-live entry ahead of it and fails with `Lock`. The first
/// transaction, unaffected, goes on to commit normally.
#[test]
fn second_writer_fails_prepare_with_lock_while_first_is_still_open() {
    let tmp = TempDir::new().unwrap();
    let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
    let db = env.create_database("kv", string_schema()).unwrap();

    let t1 = env.begin_transaction();
    db.set(env.mvcc(), &t1, b"k".to_vec(), b"from-t1".to_vec()).unwrap();

    let t2 = env.begin_transaction();
    db.set(env.mvcc(), &t2, b"k".to_vec(), b"from-t2".to_vec()).unwrap();

    let err = env.commit_transaction(&t2).unwrap_err();
    assert!(matches!(err, SophiaError::Mvcc(MvccError::Lock)));

    env.commit_transaction(&t1).unwrap();
    assert_eq!(db.get_committed(b"k").unwrap(), Some(b"from-t1".to_vec()));

    env.shutdown();
}

// ================================================================================================
// Scenario 6 — backup
// ================================================================================================

/// Running a backup copies every node's branch files and the database's
/// scheme file into a fresh, sequence-numbered backup directory, without
/// disturbing the live repository.
#[test]
fn backup_copies_branch_files_and_scheme_for_every_database() {
    let tmp = TempDir::new().unwrap();
    let mut config = SophiaConfig::default();
    config.engine.write_buffer_size = 4096;
    let env = Environment::open(tmp.path(), config).unwrap();
    let db = env.create_database("kv", string_schema()).unwrap();

    for i in 0..1_000u32 {
        let key = format!("k{i:05}").into_bytes();
        let value = format!("v{i:05}").into_bytes();
        db.set_auto_commit(env.mvcc(), env.sequence(), key, value, None)
            .unwrap();
    }
    for node in db.nodes() {
        while node.branch().unwrap() {}
    }

    let backup_dir = env.backup().unwrap();
    assert!(backup_dir.join("kv").join("scheme").exists());

    let mut copied_any_branch = false;
    for entry in std::fs::read_dir(backup_dir.join("kv")).unwrap() {
        let entry = entry.unwrap();
        if entry.path().extension().is_some_and(|ext| ext == "sst") {
            copied_any_branch = true;
        }
    }
    assert!(copied_any_branch, "backup should have copied at least one branch file");

    // A second backup gets its own, higher sequence number and directory.
    let second_backup_dir = env.backup().unwrap();
    assert_ne!(backup_dir, second_backup_dir);

    // The live database is unaffected by taking a backup.
    assert_eq!(db.get_committed(b"k00000").unwrap(), Some(b"v00000".to_vec()));

    env.shutdown();
}

// ================================================================================================
// Helper sanity: the node-level recovery used above round-trips a single
// node directly (no environment), matching the no-explicit-close pattern
// used throughout the engine-level suites.
// ================================================================================================

#[test]
fn node_survives_reopen_without_explicit_close() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        write_buffer_size: 4096,
        compaction_strategy: CompactionStrategyType::Stcs,
        bucket_low: 0.5,
        bucket_high: 1.5,
        min_sstable_size: 1024,
        min_threshold: 4,
        max_threshold: 32,
        tombstone_ratio_threshold: 0.3,
        tombstone_compaction_interval: 0,
        tombstone_bloom_fallback: true,
        tombstone_range_drop: true,
        thread_pool_size: 1,
    };

    {
        let node = Node::open(tmp.path(), 1, None, config.clone()).unwrap();
        node.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    }

    let node = Node::open(tmp.path(), 1, None, config).unwrap();
    assert_eq!(node.get(b"a".to_vec()).unwrap(), Some(b"1".to_vec()));
}
