//! Databases: a named, schema'd key space split across one or more nodes.
//!
//! A [`Database`] keeps a `BTreeMap` of nodes keyed by each node's minimum
//! key, giving O(log n) range routing from an encoded key to the node that
//! owns it. It owns the [`ConcurrentIndex`](crate::mvcc::ConcurrentIndex)
//! transactions stage their pending writes against, and exposes the
//! single-statement (auto-commit) and explicit-transaction write paths the
//! environment's public API is built on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::info;

use crate::engine::EngineConfig;
use crate::mvcc::{ConcurrentIndex, MvccError, MvccManager, PrepareCallback, Snapshot, Transaction, UpdateFolder};
use crate::node::{Node, NodeError};
use crate::schema::{KeyPartValue, Schema, SchemaError};
use crate::scheduler::{NodeStats, Planner};
use crate::sequence::Sequence;

/// Errors raised while operating on a database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database is {0:?}, not accepting this operation")]
    WrongStatus(DatabaseStatus),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("mvcc error: {0}")]
    Mvcc(#[from] MvccError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("no node owns this key range")]
    NoOwningNode,
}

/// A database's lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    Offline,
    Recover,
    Online,
    Shutdown,
    Destroyed,
    Malfunction,
}

/// A named, schema'd key space. Internally a routing table over one or more
/// [`Node`]s, each responsible for a contiguous slice of the key range.
pub struct Database {
    dsn: u64,
    name: String,
    dir: PathBuf,
    schema: Schema,
    status: Mutex<DatabaseStatus>,
    nodes: RwLock<BTreeMap<Vec<u8>, Arc<Node>>>,
    index: ConcurrentIndex,
    planner: Arc<Planner>,
}

impl Database {
    /// Opens a database directory, recovering any existing nodes found on
    /// disk (spec's node directory scan happens one layer up, in the
    /// `recovery` module; by the time a `Database` is constructed the
    /// surviving node directories are already known).
    pub fn new(dsn: u64, name: impl Into<String>, dir: impl AsRef<Path>, schema: Schema) -> Self {
        Self {
            dsn,
            name: name.into(),
            dir: dir.as_ref().to_path_buf(),
            schema,
            status: Mutex::new(DatabaseStatus::Offline),
            nodes: RwLock::new(BTreeMap::new()),
            index: ConcurrentIndex::new(),
            planner: Arc::new(Planner::new()),
        }
    }

    pub fn dsn(&self) -> u64 {
        self.dsn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn index(&self) -> &ConcurrentIndex {
        &self.index
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    pub fn status(&self) -> DatabaseStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_status(&self, status: DatabaseStatus) {
        info!(dsn = self.dsn, ?status, "database: status transition");
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn ensure_online(&self) -> Result<(), DatabaseError> {
        let status = self.status();
        if status != DatabaseStatus::Online {
            return Err(DatabaseError::WrongStatus(status));
        }
        Ok(())
    }

    /// Adds a node to the routing table, keyed by its minimum live key. A
    /// freshly-created node with no data yet is keyed by the empty string,
    /// making it the catch-all for the whole key range until it splits.
    pub fn insert_node(&self, min_key: Vec<u8>, node: Arc<Node>) {
        self.nodes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(min_key, node);
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Creates a brand-new node directory and registers it as the catch-all
    /// owner of the whole key range. Used when opening a database with no
    /// existing nodes on disk.
    pub fn create_initial_node(
        &self,
        sequence: &Sequence,
        engine_config: EngineConfig,
    ) -> Result<Arc<Node>, DatabaseError> {
        let nsn = sequence.next_nsn();
        let node_dir = self.dir.join("nodes").join(format!("{nsn}.db"));
        let node = Arc::new(Node::open(node_dir, nsn, None, engine_config)?);
        self.insert_node(Vec::new(), node.clone());
        Ok(node)
    }

    /// Routes an encoded key to the node whose range contains it: the node
    /// keyed by the largest min-key not greater than `key`.
    fn node_for_key(&self, key: &[u8]) -> Result<Arc<Node>, DatabaseError> {
        let nodes = self.nodes.read().unwrap_or_else(|p| p.into_inner());
        nodes
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, node)| node.clone())
            .ok_or(DatabaseError::NoOwningNode)
    }

    /// Point lookup under an explicit transaction's snapshot: checks the
    /// transaction's own pending writes first, then falls through to the
    /// owning node's committed state.
    pub fn get(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.ensure_online()?;
        if let Some(value) = mvcc.get(txn, &self.index, key) {
            return Ok(Some(value));
        }
        let node = self.node_for_key(key)?;
        Ok(node.get(key.to_vec())?)
    }

    /// Point lookup outside any transaction: reads the owning node's
    /// committed state directly.
    pub fn get_committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.ensure_online()?;
        let node = self.node_for_key(key)?;
        Ok(node.get(key.to_vec())?)
    }

    /// Begins a long-lived, read-only snapshot pinned to the sequence
    /// object's current lsn, for consistent cursor iteration.
    ///
    /// Reads through a `Snapshot` see the same committed, node-level state
    /// as [`Self::get_committed`] — there is no vlsn-bounded historical
    /// read of an already-superseded version; a snapshot's `vlsn` only
    /// pins a lower bound for garbage collection.
    pub fn snapshot(&self, sequence: &Sequence) -> Snapshot {
        Snapshot::new(sequence.current_lsn())
    }

    /// Range scan over `[start, end)`, merged across every node in key
    /// order (nodes partition the key range disjointly, so concatenating
    /// each node's scan in routing order already yields a globally sorted
    /// stream).
    pub fn cursor(
        &self,
        start: &[u8],
        end: &[u8],
        _snapshot: &Snapshot,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        self.ensure_online()?;
        let nodes = self.nodes.read().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        for node in nodes.values() {
            out.extend(node.scan(start, end)?);
        }
        Ok(out)
    }

    /// Prefix scan: every entry whose key starts with `prefix`.
    ///
    /// Computed as a range scan up to `prefix`'s lexicographic successor,
    /// which is exact for any prefix that isn't an unbroken run of `0xff`
    /// bytes; such a prefix has no finite successor, so the scan instead
    /// runs to a fixed, generously long `0xff` sentinel upper bound.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        snapshot: &Snapshot,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let end = prefix_upper_bound(prefix);
        self.cursor(prefix, &end, snapshot)
    }

    /// Stages a put under an explicit transaction.
    pub fn set(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        mvcc.set(txn, self.dsn, &self.index, &key, value)?;
        Ok(())
    }

    /// Stages an `UPDATE`: folds `delta` against the key's current base
    /// value (this transaction's own pending write if any, else the node
    /// store's committed value, else `None`) using `folder`, and stages the
    /// folded result as an ordinary put.
    pub fn update(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        key: Vec<u8>,
        delta: &[u8],
        folder: &dyn UpdateFolder,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        let base = self.get(mvcc, txn, &key)?;
        let folded = folder.fold(base.as_deref(), delta);
        self.set(mvcc, txn, key, folded)
    }

    /// Stages a delete under an explicit transaction.
    pub fn delete(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        key: Vec<u8>,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        mvcc.delete(txn, self.dsn, &self.index, &key)?;
        Ok(())
    }

    /// Single-statement write path: begins an implicit transaction, fails
    /// fast with `Lock` if another transaction already has a pending write
    /// for this key, then prepares and commits it immediately.
    pub fn set_auto_commit(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        key: Vec<u8>,
        value: Vec<u8>,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        let txn = mvcc.begin(sequence);
        mvcc.check_statement_lock(&txn, &self.index, &key)?;
        mvcc.set(&txn, self.dsn, &self.index, &key, value)?;
        self.prepare_and_commit(mvcc, sequence, &txn, callback)
    }

    /// Single-statement `UPDATE`, mirroring [`Self::set_auto_commit`]: folds
    /// `delta` against the key's current committed value and writes the
    /// result in one implicit transaction.
    pub fn update_auto_commit(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        key: Vec<u8>,
        delta: &[u8],
        folder: &dyn UpdateFolder,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        let base = self.get_committed(&key)?;
        let folded = folder.fold(base.as_deref(), delta);
        self.set_auto_commit(mvcc, sequence, key, folded, callback)
    }

    /// Single-statement delete path, mirroring [`Self::set_auto_commit`].
    pub fn delete_auto_commit(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        key: Vec<u8>,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        self.ensure_online()?;
        let txn = mvcc.begin(sequence);
        mvcc.check_statement_lock(&txn, &self.index, &key)?;
        mvcc.delete(&txn, self.dsn, &self.index, &key)?;
        self.prepare_and_commit(mvcc, sequence, &txn, callback)
    }

    fn prepare_and_commit(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        txn: &Transaction,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        let mut indices = std::collections::HashMap::new();
        indices.insert(self.dsn, &self.index);

        if let Err(e) = mvcc.prepare(txn, &indices, callback) {
            mvcc.rollback(txn, &indices);
            return Err(e.into());
        }

        let lsn_base = sequence.next_lsn_batch(1);
        let timestamp = sequence.next_rsn();
        let committed = mvcc.commit(txn, &indices, lsn_base, timestamp)?;
        self.apply_committed(committed.get(&self.dsn).cloned().unwrap_or_default())
    }

    /// Applies a batch of committed point entries — produced by
    /// [`MvccManager::commit`] — to each entry's owning node.
    pub fn apply_committed(
        &self,
        entries: Vec<crate::engine::PointEntry>,
    ) -> Result<(), DatabaseError> {
        for entry in entries {
            let node = self.node_for_key(&entry.key)?;
            match entry.value {
                Some(value) => {
                    node.put(entry.key, value)?;
                }
                None => {
                    node.delete(entry.key)?;
                }
            }
        }
        Ok(())
    }

    /// Collects per-node statistics for the planner's priority queues,
    /// using each node's current engine state and no age/dup tracking yet
    /// (a node just flushed or freshly opened reports zero age and dup
    /// count, which simply defers its eligibility rather than misreporting
    /// it as urgent).
    pub fn refresh_planner(&self, write_buffer_size: usize) -> Result<(), DatabaseError> {
        for node in self.nodes() {
            let stats: NodeStats = node.stats(write_buffer_size, 0, 0, 0)?;
            self.planner.update(node.nsn(), stats);
        }
        Ok(())
    }

    /// Encodes a scatter list of key-part values against this database's
    /// declared schema, rejecting a wrong part count or a value of the
    /// wrong type for its position.
    pub fn encode_key(&self, parts: &[KeyPartValue]) -> Result<Vec<u8>, DatabaseError> {
        Ok(self.schema.encode_key(parts)?)
    }

    /// Typed point lookup under an explicit transaction, per [`Self::get`].
    pub fn get_by_parts(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        parts: &[KeyPartValue],
    ) -> Result<Option<Vec<u8>>, DatabaseError> {
        let key = self.encode_key(parts)?;
        self.get(mvcc, txn, &key)
    }

    /// Typed point lookup outside any transaction, per [`Self::get_committed`].
    pub fn get_committed_by_parts(&self, parts: &[KeyPartValue]) -> Result<Option<Vec<u8>>, DatabaseError> {
        let key = self.encode_key(parts)?;
        self.get_committed(&key)
    }

    /// Typed, explicit-transaction put, per [`Self::set`].
    pub fn set_by_parts(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        parts: &[KeyPartValue],
        value: Vec<u8>,
    ) -> Result<(), DatabaseError> {
        let key = self.encode_key(parts)?;
        self.set(mvcc, txn, key, value)
    }

    /// Typed, explicit-transaction delete, per [`Self::delete`].
    pub fn delete_by_parts(
        &self,
        mvcc: &MvccManager,
        txn: &Transaction,
        parts: &[KeyPartValue],
    ) -> Result<(), DatabaseError> {
        let key = self.encode_key(parts)?;
        self.delete(mvcc, txn, key)
    }

    /// Typed single-statement write, per [`Self::set_auto_commit`].
    pub fn set_auto_commit_by_parts(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        parts: &[KeyPartValue],
        value: Vec<u8>,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        let key = self.encode_key(parts)?;
        self.set_auto_commit(mvcc, sequence, key, value, callback)
    }

    /// Typed single-statement delete, per [`Self::delete_auto_commit`].
    pub fn delete_auto_commit_by_parts(
        &self,
        mvcc: &MvccManager,
        sequence: &Sequence,
        parts: &[KeyPartValue],
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), DatabaseError> {
        let key = self.encode_key(parts)?;
        self.delete_auto_commit(mvcc, sequence, key, callback)
    }
}

/// The lexicographic successor of `prefix`: increments the last byte not
/// already `0xff`, truncating everything after it. Returns a long `0xff`
/// run when `prefix` is itself an unbroken run of `0xff` bytes (or empty),
/// since no finite byte string is its successor.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xff {
            end.pop();
            continue;
        }
        *end.last_mut().unwrap() += 1;
        return end;
    }
    vec![0xff; prefix.len().max(1) + 64]
}
