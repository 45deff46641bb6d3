//! Nodes: the per-range storage unit a database splits its key space into.
//!
//! A node owns one directory and one LSM store — its `i0`/`i1` memtables and
//! its branch chain of sealed SSTables — implemented directly on top of the
//! existing [`Engine`](crate::engine::Engine): the active/frozen memtable
//! pair becomes `i0`/`i1`, the branch chain is the engine's SSTable list, and
//! its manifest already tracks exactly the branch metadata a node needs. The
//! planner decides *which* node to act on across a database; a node only
//! knows how to act on itself once chosen.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{Engine, EngineConfig, EngineError, EngineStats};
use crate::scheduler::NodeStats;

/// Errors raised while operating on a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// One node: an `nsn`-identified shard of a database's key range, backed by
/// its own [`Engine`] rooted at `<database>/<nsn>/`.
pub struct Node {
    nsn: u64,
    parent_nsn: Option<u64>,
    dir: PathBuf,
    engine: Engine,
    /// Set while a branch/compact operation owns this node exclusively;
    /// the planner skips locked nodes when building its queues.
    locked: AtomicBool,
    /// Set once this node has been chosen to split or merge into a
    /// successor; new writes should be routed elsewhere once this is true.
    rotating: AtomicBool,
    /// Highest backup sequence number that has already captured this
    /// node's current branch chain; used to decide what a backup still
    /// needs to copy.
    backup_bsn: AtomicU64,
}

impl Node {
    /// Opens (creating if needed) the node directory at `dir` and its
    /// backing engine.
    pub fn open(
        dir: impl AsRef<Path>,
        nsn: u64,
        parent_nsn: Option<u64>,
        config: EngineConfig,
    ) -> Result<Self, NodeError> {
        let dir = dir.as_ref().to_path_buf();
        info!(nsn, path = ?dir, "node: opening");
        let engine = Engine::open(&dir, config)?;
        Ok(Self {
            nsn,
            parent_nsn,
            dir,
            engine,
            locked: AtomicBool::new(false),
            rotating: AtomicBool::new(false),
            backup_bsn: AtomicU64::new(0),
        })
    }

    pub fn nsn(&self) -> u64 {
        self.nsn
    }

    pub fn parent_nsn(&self) -> Option<u64> {
        self.parent_nsn
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Attempts to take the exclusive lock used while branching/compacting.
    /// Returns `false` if another operation already holds it.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::Acquire)
    }

    pub fn mark_rotating(&self) {
        self.rotating.store(true, Ordering::Release);
    }

    pub fn backup_bsn(&self) -> u64 {
        self.backup_bsn.load(Ordering::Acquire)
    }

    pub fn set_backup_bsn(&self, bsn: u64) {
        self.backup_bsn.store(bsn, Ordering::Release);
    }

    pub fn get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, NodeError> {
        Ok(self.engine.get(key)?)
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<bool, NodeError> {
        Ok(self.engine.put(key, value)?)
    }

    pub fn delete(&self, key: Vec<u8>) -> Result<bool, NodeError> {
        Ok(self.engine.delete(key)?)
    }

    pub fn delete_range(&self, start: Vec<u8>, end: Vec<u8>) -> Result<bool, NodeError> {
        Ok(self.engine.delete_range(start, end)?)
    }

    /// Collects this node's committed entries over `[start, end)`, in key
    /// order.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, NodeError> {
        Ok(self.engine.scan(start, end)?.collect())
    }

    /// Flushes the oldest frozen memtable to a new branch, if one exists.
    pub fn branch(&self) -> Result<bool, NodeError> {
        debug!(nsn = self.nsn, "node: flushing oldest frozen memtable to branch");
        Ok(self.engine.flush_oldest_frozen()?)
    }

    /// Runs one round of minor (size-tiered) compaction, if a bucket
    /// qualifies.
    pub fn compact_minor(&self) -> Result<bool, NodeError> {
        Ok(self.engine.minor_compact()?)
    }

    /// Runs one round of tombstone-driven garbage collection, if a branch
    /// qualifies.
    pub fn compact_gc(&self) -> Result<bool, NodeError> {
        Ok(self.engine.tombstone_compact()?)
    }

    /// Runs a full major compaction across every branch.
    pub fn compact_major(&self) -> Result<bool, NodeError> {
        Ok(self.engine.major_compact()?)
    }

    fn engine_stats(&self) -> Result<EngineStats, NodeError> {
        Ok(self.engine.stats()?)
    }

    /// Summarizes this node for the planner's priority queues.
    ///
    /// The engine does not expose the active memtable's byte size directly,
    /// so `in_memory_size` is approximated from its frozen-memtable count
    /// times the configured write-buffer size — an undercount while the
    /// active memtable is still filling, which only delays (never skips)
    /// the node becoming eligible for branching.
    pub fn stats(&self, write_buffer_size: usize, age_secs: u64, dup_keys: u64, total_keys: u64) -> Result<NodeStats, NodeError> {
        let stats = self.engine_stats()?;
        Ok(NodeStats {
            in_memory_size: stats.frozen_count * write_buffer_size,
            branch_count: stats.sstables_count,
            age_secs,
            dup_keys,
            total_keys,
            backup_bsn: self.backup_bsn(),
        })
    }

    /// Lists the live branch files for this node, for a backup job to copy.
    ///
    /// The engine does not expose individual branch paths directly, so this
    /// walks its `sstables/` subdirectory — the same layout `Engine::open`
    /// creates and reads from — rather than the node's top-level directory.
    pub fn branch_files(&self) -> Result<Vec<PathBuf>, NodeError> {
        let sstable_dir = self.dir.join(crate::engine::SSTABLE_DIR);
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&sstable_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "sst") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactionStrategyType;

    fn test_config() -> EngineConfig {
        EngineConfig {
            write_buffer_size: 4096,
            compaction_strategy: CompactionStrategyType::Stcs,
            bucket_low: 0.5,
            bucket_high: 1.5,
            min_sstable_size: 1024,
            min_threshold: 4,
            max_threshold: 32,
            tombstone_ratio_threshold: 0.2,
            tombstone_compaction_interval: 0,
            tombstone_bloom_fallback: true,
            tombstone_range_drop: true,
            thread_pool_size: 1,
        }
    }

    #[test]
    fn put_get_round_trips_through_node() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::open(tmp.path(), 1, None, test_config()).unwrap();
        node.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(node.get(b"k".to_vec()).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::open(tmp.path(), 1, None, test_config()).unwrap();
        assert!(node.try_lock());
        assert!(!node.try_lock());
        node.unlock();
        assert!(node.try_lock());
    }

    #[test]
    fn scan_returns_entries_in_range() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::open(tmp.path(), 1, None, test_config()).unwrap();
        node.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        node.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        node.put(b"c".to_vec(), b"3".to_vec()).unwrap();

        let scanned = node.scan(b"a", b"c").unwrap();
        assert_eq!(scanned, vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn stats_reflect_engine_state() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::open(tmp.path(), 7, Some(3), test_config()).unwrap();
        node.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let stats = node.stats(4096, 0, 0, 1).unwrap();
        assert_eq!(stats.branch_count, 0);
        assert_eq!(stats.backup_bsn, 0);
    }
}
