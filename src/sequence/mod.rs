//! The environment-wide sequence object.
//!
//! A single [`Sequence`] owns every monotonic counter the engine hands out:
//! database ids (`dsn`), node ids (`nsn`), backup ids (`bsn`), log sequence
//! numbers (`lsn`), log file ids (`lfsn`), transaction ids (`tsn`), and
//! request ids (`rsn`). All seven counters are advanced under one lock so
//! that a reader can take a coherent snapshot of all of them at once.

use std::sync::Mutex;

/// A point-in-time, internally consistent view of all seven counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSnapshot {
    pub dsn: u64,
    pub nsn: u64,
    pub bsn: u64,
    pub lsn: u64,
    pub lfsn: u64,
    pub tsn: u64,
    pub rsn: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dsn: u64,
    nsn: u64,
    bsn: u64,
    lsn: u64,
    lfsn: u64,
    tsn: u64,
    rsn: u64,
}

/// The process-wide (per environment) source of every id and sequence
/// number in the engine.
///
/// All mutation goes through a single [`Mutex`] so that advancing one
/// counter can never interleave with another thread's snapshot of all
/// seven — callers that need `(lsn, tsn)` together, for instance, always
/// see values that existed simultaneously.
#[derive(Debug, Default)]
pub struct Sequence {
    inner: Mutex<Counters>,
}

impl Sequence {
    /// Creates a sequence object with all counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a sequence object to the state recorded in `snapshot`,
    /// used during recovery once the last durable values are known.
    pub fn restore(snapshot: SequenceSnapshot) -> Self {
        let counters = Counters {
            dsn: snapshot.dsn,
            nsn: snapshot.nsn,
            bsn: snapshot.bsn,
            lsn: snapshot.lsn,
            lfsn: snapshot.lfsn,
            tsn: snapshot.tsn,
            rsn: snapshot.rsn,
        };
        Self {
            inner: Mutex::new(counters),
        }
    }

    /// Allocates the next database id.
    pub fn next_dsn(&self) -> u64 {
        let mut c = self.lock();
        c.dsn += 1;
        c.dsn
    }

    /// Allocates the next node id.
    pub fn next_nsn(&self) -> u64 {
        let mut c = self.lock();
        c.nsn += 1;
        c.nsn
    }

    /// Allocates the next backup id.
    pub fn next_bsn(&self) -> u64 {
        let mut c = self.lock();
        c.bsn += 1;
        c.bsn
    }

    /// Allocates the next log file id.
    pub fn next_lfsn(&self) -> u64 {
        let mut c = self.lock();
        c.lfsn += 1;
        c.lfsn
    }

    /// Allocates the next transaction id.
    pub fn next_tsn(&self) -> u64 {
        let mut c = self.lock();
        c.tsn += 1;
        c.tsn
    }

    /// Allocates the next request id.
    pub fn next_rsn(&self) -> u64 {
        let mut c = self.lock();
        c.rsn += 1;
        c.rsn
    }

    /// Returns the current `lsn` without advancing it — used by
    /// `begin_transaction` to snapshot `vlsn`.
    pub fn current_lsn(&self) -> u64 {
        self.lock().lsn
    }

    /// Reserves `count` consecutive lsn values for a batch of `count` rows
    /// and returns the first one. `lsn` advances once per committed batch
    /// and once per row within the batch, so a batch of `n` rows reserves
    /// `n` values in one call.
    pub fn next_lsn_batch(&self, count: u64) -> u64 {
        let mut c = self.lock();
        let first = c.lsn + 1;
        c.lsn += count.max(1);
        first
    }

    /// Reserves a single `lsn` value, equivalent to `next_lsn_batch(1)`.
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn_batch(1)
    }

    /// Advances `lsn` to at least `value`, used when replaying a log whose
    /// recorded lsns must not be re-issued.
    pub fn observe_lsn(&self, value: u64) {
        let mut c = self.lock();
        c.lsn = c.lsn.max(value);
    }

    /// Advances `nsn` to at least `value`, used during recovery when node
    /// ids are discovered on disk.
    pub fn observe_nsn(&self, value: u64) {
        let mut c = self.lock();
        c.nsn = c.nsn.max(value);
    }

    /// Advances `lfsn` to at least `value`, used during recovery when log
    /// file ids are discovered on disk.
    pub fn observe_lfsn(&self, value: u64) {
        let mut c = self.lock();
        c.lfsn = c.lfsn.max(value);
    }

    /// Advances `bsn` to at least `value`, used during recovery when
    /// backup directories are discovered on disk.
    pub fn observe_bsn(&self, value: u64) {
        let mut c = self.lock();
        c.bsn = c.bsn.max(value);
    }

    /// Takes a coherent, value-copying snapshot of all seven counters.
    pub fn snapshot(&self) -> SequenceSnapshot {
        let c = self.lock();
        SequenceSnapshot {
            dsn: c.dsn,
            nsn: c.nsn,
            bsn: c.bsn,
            lsn: c.lsn,
            lfsn: c.lfsn,
            tsn: c.tsn,
            rsn: c.rsn,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
