//! The MVCC transaction manager.
//!
//! A process-wide [`MvccManager`] assigns transaction ids and tracks every
//! live [`Transaction`]. Each database owns a [`ConcurrentIndex`]: a map
//! from key bytes to a chain of **sxv** (versioned value) entries, one per
//! transaction with a pending write on that key, ordered by transaction id.
//! Conflict detection, commit, rollback, and an on-demand deadlock check are
//! implemented here; translating a committed version into the node store's
//! [`PointEntry`](crate::engine::PointEntry) representation is the boundary
//! between this module and `database`/`node`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::engine::PointEntry;
use crate::sequence::Sequence;

/// Errors raised by the MVCC transaction manager.
#[derive(Debug, Error)]
pub enum MvccError {
    /// Another live transaction holds a pending version of the same key.
    #[error("key is locked by another in-flight transaction")]
    Lock,

    /// The transaction must roll back — an earlier entry in its log was
    /// aborted, or a last-write-wins callback rejected it at `prepare`.
    #[error("transaction must roll back")]
    RollbackRequired,

    /// The operation is not valid for the transaction's current state.
    #[error("invalid transaction state transition: {0:?} -> {1}")]
    InvalidState(TransactionState, &'static str),

    /// A deadlock was detected by an on-demand check.
    #[error("deadlock detected starting from transaction {0}")]
    Deadlock(u64),

    /// The transaction id was not found in the active transaction table.
    #[error("unknown transaction {0}")]
    UnknownTransaction(u64),
}

/// The transaction state machine described in the storage engine's MVCC
/// design: `Ready -> Prepare -> Commit` on the happy path, with `Lock` and
/// `Rollback` as the conflict/abort exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Ready,
    Prepare,
    Commit,
    Rollback,
    Lock,
}

/// A write or delete proposed by a transaction, awaiting commit.
#[derive(Debug, Clone)]
pub enum SxvRecord {
    Put(Vec<u8>),
    Delete,
}

/// One entry in a key's version chain: the pending write of a single
/// transaction, plus the bookkeeping needed for conflict detection.
#[derive(Debug, Clone)]
struct SxvEntry {
    tsn: u64,
    local_order: u64,
    record: SxvRecord,
    /// Set when an earlier entry in this key's chain aborted; propagates to
    /// every later entry per the chain invariant.
    aborted: bool,
}

/// The per-database map from key bytes to the chain of versions currently
/// pending commit. The concurrent index's tree is guarded by the caller's
/// `database.lock`; internally it uses its own mutex so it can also be used
/// standalone (e.g. in tests).
#[derive(Debug, Default)]
pub struct ConcurrentIndex {
    chains: Mutex<HashMap<Vec<u8>, VecDeque<SxvEntry>>>,
}

impl ConcurrentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `set(tx, key, record)`: locate the chain head by key; if none,
    /// create the chain with this version. If the chain tail already
    /// belongs to this transaction, replace it in place. Otherwise link
    /// onto the tail as a waiter, returning the tsn of the occupant now
    /// ahead of it in the chain.
    fn set(&self, tsn: u64, local_order: u64, key: &[u8], record: SxvRecord) -> Option<u64> {
        let mut chains = self.lock();
        let chain = chains.entry(key.to_vec()).or_default();

        if let Some(tail) = chain.back_mut() {
            if tail.tsn == tsn {
                tail.record = record;
                return None;
            }
        }

        let owner = chain.back().map(|tail| tail.tsn);
        if let Some(owner) = owner {
            trace!(tsn, owner, key = ?key, "mvcc: linking onto chain tail as waiter");
        }
        chain.push_back(SxvEntry {
            tsn,
            local_order,
            record,
            aborted: false,
        });
        owner
    }

    /// `get(tx, key)`: if this transaction already has a pending entry for
    /// `key`, return it (honoring a pending `Delete` as a miss). Returns
    /// `None` when the transaction should fall through to the node store.
    fn get_own(&self, tsn: u64, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let chains = self.lock();
        let entry = chains.get(key)?.iter().find(|e| e.tsn == tsn)?;
        match &entry.record {
            SxvRecord::Put(value) => Some(Some(value.clone())),
            SxvRecord::Delete => Some(None),
        }
    }

    /// True if another live transaction (not `tsn`) already has a pending,
    /// non-aborted entry for `key` — the fast fail-with-`Lock` check used
    /// by the single-statement write path.
    fn has_foreign_pending(&self, tsn: u64, key: &[u8]) -> bool {
        let chains = self.lock();
        match chains.get(key) {
            Some(chain) => chain.iter().any(|e| e.tsn != tsn && !e.aborted),
            None => false,
        }
    }

    /// `prepare` check for one key: is there a still-present, non-aborted
    /// entry ahead of `tsn`'s own entry?
    fn has_earlier_waiter(&self, tsn: u64, key: &[u8]) -> bool {
        let chains = self.lock();
        let Some(chain) = chains.get(key) else {
            return false;
        };
        for entry in chain {
            if entry.tsn == tsn {
                return false;
            }
            if !entry.aborted {
                return true;
            }
        }
        false
    }

    /// Removes `tsn`'s entry from `key`'s chain (used by both commit and
    /// rollback) and marks every later entry in the chain as aborted, per
    /// the invariant that an aborted/removed element poisons its waiters.
    fn remove_and_cascade(&self, tsn: u64, key: &[u8]) -> Option<SxvRecord> {
        let mut chains = self.lock();
        let Some(chain) = chains.get_mut(key) else {
            return None;
        };

        let pos = chain.iter().position(|e| e.tsn == tsn)?;
        let entry = chain.remove(pos)?;
        for later in chain.iter_mut().skip(pos) {
            later.aborted = true;
        }
        if chain.is_empty() {
            chains.remove(key);
        }
        Some(entry.record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, VecDeque<SxvEntry>>> {
        match self.chains.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A pending write recorded in a transaction's log before handoff to the
/// node store on commit.
#[derive(Debug, Clone)]
struct TxnLogEntry {
    key: Vec<u8>,
    record: SxvRecord,
}

/// A single logical transaction. Holds the per-database log of pending
/// writes; nothing is visible to the node store until `commit`.
#[derive(Debug)]
pub struct Transaction {
    tsn: u64,
    vlsn: u64,
    state: Mutex<TransactionState>,
    /// Writes grouped by database id (`dsn`), in program order.
    log: Mutex<HashMap<u64, Vec<TxnLogEntry>>>,
    next_local_order: Mutex<u64>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.tsn
    }

    /// The visibility lsn snapshotted when this transaction began; reads
    /// performed through this transaction never see a record whose lsn
    /// exceeds it.
    pub fn vlsn(&self) -> u64 {
        self.vlsn
    }

    pub fn state(&self) -> TransactionState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TransactionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_order(&self) -> u64 {
        let mut guard = match self.next_local_order.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *guard += 1;
        *guard
    }
}

/// Optional caller-supplied conflict check run during `prepare`, used to
/// implement last-write-wins validation against already-committed state.
/// Returning `Ok(false)` forces the transaction to roll back.
pub trait PrepareCallback {
    fn check(&self, dsn: u64, key: &[u8], record: &SxvRecord) -> Result<bool, MvccError>;
}

/// Folds an `UPDATE` (delta) record against a key's current base value.
///
/// `prev` is the base value visible to the writer (`None` if the key is
/// absent or was last written as a delete); `delta` is the caller's new
/// partial write. The returned bytes become the record's full value.
/// Resolved eagerly at write time against the writer's own visible base,
/// rather than preserved as a lazy chain for a later reader or compaction
/// to fold — this store keeps one version per key in its committed state,
/// so there is no later point at which a chain of unfolded updates could
/// still exist to fold.
pub trait UpdateFolder {
    fn fold(&self, prev: Option<&[u8]>, delta: &[u8]) -> Vec<u8>;
}

/// The process-wide transaction table plus the wait-for graph used by the
/// on-demand deadlock check.
#[derive(Debug, Default)]
pub struct MvccManager {
    transactions: Mutex<HashMap<u64, Arc<Transaction>>>,
    /// `waits_for[a]` is the set of transactions `a` is waiting behind.
    waits_for: Mutex<HashMap<u64, HashSet<u64>>>,
}

impl MvccManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a new transaction, snapshotting `vlsn` from the sequence
    /// object's current `lsn`.
    pub fn begin(&self, sequence: &Sequence) -> Arc<Transaction> {
        let tsn = sequence.next_tsn();
        let vlsn = sequence.current_lsn();
        let txn = Arc::new(Transaction {
            tsn,
            vlsn,
            state: Mutex::new(TransactionState::Ready),
            log: Mutex::new(HashMap::new()),
            next_local_order: Mutex::new(0),
        });
        self.transactions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tsn, txn.clone());
        debug!(tsn, vlsn, "mvcc: transaction started");
        txn
    }

    /// `set(tx, db, record)` — records a pending put in the transaction's
    /// log and links it onto the database's concurrent index.
    pub fn set(
        &self,
        txn: &Transaction,
        dsn: u64,
        index: &ConcurrentIndex,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), MvccError> {
        self.write_inner(txn, dsn, index, key, SxvRecord::Put(value))
    }

    /// `delete(tx, db, key)` — records a pending point delete.
    pub fn delete(
        &self,
        txn: &Transaction,
        dsn: u64,
        index: &ConcurrentIndex,
        key: &[u8],
    ) -> Result<(), MvccError> {
        self.write_inner(txn, dsn, index, key, SxvRecord::Delete)
    }

    fn write_inner(
        &self,
        txn: &Transaction,
        dsn: u64,
        index: &ConcurrentIndex,
        key: &[u8],
        record: SxvRecord,
    ) -> Result<(), MvccError> {
        if *txn.lock_state() != TransactionState::Ready {
            return Err(MvccError::InvalidState(txn.state(), "set"));
        }
        let order = txn.next_order();
        if let Some(owner) = index.set(txn.tsn, order, key, record.clone()) {
            self.record_wait(txn.tsn, owner);
        }
        txn.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(dsn)
            .or_default()
            .push(TxnLogEntry {
                key: key.to_vec(),
                record,
            });
        Ok(())
    }

    /// `get(tx, db, key)` — returns this transaction's own pending write
    /// for `key` if any, honoring a pending delete as a miss. `None` means
    /// the caller should fall through to the node store read pipeline with
    /// `vlsn = tx.vlsn()`.
    pub fn get(&self, txn: &Transaction, index: &ConcurrentIndex, key: &[u8]) -> Option<Vec<u8>> {
        index.get_own(txn.tsn, key).flatten()
    }

    /// Fast-fail conflict check used by the single-statement write path
    /// (`database.set`/`delete` outside an explicit transaction): if
    /// another live transaction already has a pending version of `key`,
    /// fail immediately with `Lock` rather than queueing.
    pub fn check_statement_lock(
        &self,
        txn: &Transaction,
        index: &ConcurrentIndex,
        key: &[u8],
    ) -> Result<(), MvccError> {
        if index.has_foreign_pending(txn.tsn, key) {
            return Err(MvccError::Lock);
        }
        Ok(())
    }

    /// `prepare(tx, callback)`: for every logged entry, fail if an earlier,
    /// non-aborted waiter is still ahead of this transaction's entry in the
    /// chain; otherwise optionally invoke `callback` for a last-write-wins
    /// check. A transaction that fails prepare must call `rollback`.
    pub fn prepare(
        &self,
        txn: &Transaction,
        indices: &HashMap<u64, &ConcurrentIndex>,
        callback: Option<&dyn PrepareCallback>,
    ) -> Result<(), MvccError> {
        {
            let mut state = txn.lock_state();
            if *state != TransactionState::Ready {
                return Err(MvccError::InvalidState(*state, "prepare"));
            }
            *state = TransactionState::Prepare;
        }

        let log = txn.log.lock().unwrap_or_else(|p| p.into_inner());
        for (dsn, entries) in log.iter() {
            let Some(index) = indices.get(dsn) else {
                continue;
            };
            for entry in entries {
                if index.has_earlier_waiter(txn.tsn, &entry.key) {
                    *txn.lock_state() = TransactionState::Lock;
                    return Err(MvccError::Lock);
                }
                if let Some(cb) = callback {
                    let ok = cb.check(*dsn, &entry.key, &entry.record)?;
                    if !ok {
                        *txn.lock_state() = TransactionState::Rollback;
                        return Err(MvccError::RollbackRequired);
                    }
                }
            }
        }
        Ok(())
    }

    /// `commit(tx)`: for every logged entry, remove this transaction's
    /// version from its chain (promoting the next waiter, if any, to
    /// chain head) and translate it into a [`PointEntry`] for handoff to
    /// the owning node's in-memory index.
    ///
    /// Returns the committed entries grouped by database id, in the order
    /// they were written.
    pub fn commit(
        &self,
        txn: &Transaction,
        indices: &HashMap<u64, &ConcurrentIndex>,
        lsn_base: u64,
        timestamp: u64,
    ) -> Result<HashMap<u64, Vec<PointEntry>>, MvccError> {
        {
            let mut state = txn.lock_state();
            if *state != TransactionState::Prepare {
                return Err(MvccError::InvalidState(*state, "commit"));
            }
            *state = TransactionState::Commit;
        }

        let log = txn.log.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: HashMap<u64, Vec<PointEntry>> = HashMap::new();
        let mut row = 0u64;
        for (dsn, entries) in log.iter() {
            let Some(index) = indices.get(dsn) else {
                continue;
            };
            let mut committed = Vec::with_capacity(entries.len());
            for entry in entries {
                let lsn = lsn_base + row;
                row += 1;
                if let Some(record) = index.remove_and_cascade(txn.tsn, &entry.key) {
                    committed.push(match record {
                        SxvRecord::Put(value) => {
                            PointEntry::new(entry.key.clone(), value, lsn, timestamp)
                        }
                        SxvRecord::Delete => PointEntry::new_delete(entry.key.clone(), lsn, timestamp),
                    });
                }
            }
            out.insert(*dsn, committed);
        }

        self.forget(txn.tsn);
        debug!(tsn = txn.tsn, "mvcc: transaction committed");
        Ok(out)
    }

    /// `rollback(tx)`: unlink every logged entry from its chain, cascading
    /// `ABORT` onto anything queued behind it.
    pub fn rollback(&self, txn: &Transaction, indices: &HashMap<u64, &ConcurrentIndex>) {
        *txn.lock_state() = TransactionState::Rollback;
        let log = txn.log.lock().unwrap_or_else(|p| p.into_inner());
        for (dsn, entries) in log.iter() {
            let Some(index) = indices.get(dsn) else {
                continue;
            };
            for entry in entries {
                index.remove_and_cascade(txn.tsn, &entry.key);
            }
        }
        self.forget(txn.tsn);
        debug!(tsn = txn.tsn, "mvcc: transaction rolled back");
    }

    fn forget(&self, tsn: u64) {
        self.transactions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&tsn);
        self.waits_for
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&tsn);
    }

    /// Records that `waiter` is blocked behind `owner` — called whenever a
    /// write links onto an occupied chain tail, feeding the wait-for graph
    /// used by [`Self::check_deadlock`].
    pub fn record_wait(&self, waiter: u64, owner: u64) {
        self.waits_for
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(waiter)
            .or_default()
            .insert(owner);
    }

    /// On-demand, advisory deadlock check: walks the wait-for graph from
    /// `tsn`; if `tsn` itself is reachable again, a cycle (and therefore a
    /// deadlock) exists.
    pub fn check_deadlock(&self, tsn: u64) -> Result<(), MvccError> {
        let graph = self.waits_for.lock().unwrap_or_else(|p| p.into_inner());
        let mut visited = HashSet::new();
        let mut stack = vec![tsn];

        while let Some(current) = stack.pop() {
            let Some(neighbors) = graph.get(&current) else {
                continue;
            };
            for &next in neighbors {
                if next == tsn {
                    warn!(tsn, "mvcc: deadlock detected");
                    return Err(MvccError::Deadlock(tsn));
                }
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        Ok(())
    }
}

/// A long-lived, read-only transaction pinned to a fixed `vlsn`, used for
/// consistent iteration across one or more databases. Its id pins the
/// lower bound of garbage collection until it is dropped.
pub struct Snapshot {
    vlsn: u64,
}

impl Snapshot {
    pub fn new(vlsn: u64) -> Self {
        Self { vlsn }
    }

    pub fn vlsn(&self) -> u64 {
        self.vlsn
    }
}
