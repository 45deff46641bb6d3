//! # Sophia
//!
//! An embeddable, transactional key-value storage engine with MVCC
//! snapshot isolation, built on a **Log-Structured Merge Tree (LSM-tree)**
//! architecture. An [`Environment`](environment::Environment) opens a
//! repository of one or more schema'd [`Database`](database::Database)s,
//! each split across one or more [`Node`](node::Node)s for independent
//! background compaction.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Environment                           │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │                        Database                        │    │
//! │  │   ┌─────────┐   ┌─────────┐   ┌─────────┐              │    │
//! │  │   │  Node   │   │  Node   │   │  Node   │   ...        │    │
//! │  │   │ (Engine)│   │ (Engine)│   │ (Engine)│              │    │
//! │  │   └─────────┘   └─────────┘   └─────────┘              │    │
//! │  │           concurrent index (MVCC sxv chains)            │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │   Sequence (dsn/nsn/bsn/lsn/lfsn/tsn/rsn)                     │
//! │   Scheduler (planner + worker pool: branch/compact/backup)    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each node's store is, internally, one instance of the same
//! log-structured [`engine::Engine`]: active/frozen memtables backed by a
//! write-ahead log, flushed into immutable, bloom-filtered SSTables, merged
//! by pluggable compaction strategies, with a manifest tracking it all.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`environment`] | Repository lifecycle: open, recover, create/drop databases, shutdown |
//! | [`database`] | Schema'd key space routed across nodes; single-statement and transactional writes |
//! | [`node`] | One schema-range shard, backed by one [`engine::Engine`] |
//! | [`schema`] | Typed, multi-part key schemas encoded to order-preserving bytes |
//! | [`mvcc`] | Per-key version chains, transaction state machine, deadlock detection |
//! | [`sequence`] | The seven monotonic counters (dsn/nsn/bsn/lsn/lfsn/tsn/rsn) |
//! | [`scheduler`] | Background planner, zone policy, and worker pool |
//! | [`backup`] | Point-in-time backup state machine |
//! | [`recovery`] | Repository/database/log recovery on open |
//! | [`engine`] | Core storage engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | In-memory write buffer with multi-version entries and range tombstones |
//! | [`wal`] | Generic, CRC-protected write-ahead log for crash recovery |
//! | [`sstable`] | Immutable, sorted, on-disk tables with bloom filters and block indices |
//! | [`manifest`] | Persistent metadata manager (WAL + snapshot model) |
//! | [`compaction`] | Size-tiered, tombstone, and major compaction strategies |
//! | [`encoding`] | Zero-dependency, deterministic binary encoding for on-disk metadata |
//!
//! ## Key Features
//!
//! - **MVCC snapshot isolation** — every transaction reads a consistent
//!   `vlsn` snapshot; conflicting writers fail fast rather than blocking.
//! - **Write-ahead logging** — every mutation is persisted to a WAL before
//!   being acknowledged, guaranteeing durability and crash recovery.
//! - **Point and range tombstones** — efficient delete semantics for both
//!   individual keys and key ranges.
//! - **Bloom filter lookups** — each SSTable carries a bloom filter for
//!   fast negative point-lookup responses.
//! - **Block-level CRC32 integrity** — every on-disk block (WAL records,
//!   SSTable data blocks, headers, footers) is checksummed.
//! - **Pluggable compaction** — three strategies (minor, tombstone, major)
//!   with configurable thresholds, driven automatically by a background
//!   scheduler.
//! - **Point-in-time backup** — a crash-safe, atomic snapshot of every
//!   database's nodes and log tail.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sophia_engine::environment::{Environment, SophiaConfig};
//! use sophia_engine::schema::{KeyPart, KeyPartType, Schema};
//!
//! let env = Environment::open("/tmp/my_repo", SophiaConfig::default()).unwrap();
//!
//! let schema = Schema::new(vec![KeyPart::new("key", KeyPartType::String)]).unwrap();
//! let db = env.create_database("orders", schema).unwrap();
//!
//! // Single-statement (auto-commit) write and read.
//! db.set_auto_commit(env.mvcc(), env.sequence(), b"hello".to_vec(), b"world".to_vec(), None)
//!     .unwrap();
//! assert_eq!(db.get_committed(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Explicit transaction spanning multiple writes.
//! let txn = env.begin_transaction();
//! db.set(env.mvcc(), &txn, b"a".to_vec(), b"1".to_vec()).unwrap();
//! db.set(env.mvcc(), &txn, b"b".to_vec(), b"2".to_vec()).unwrap();
//! env.commit_transaction(&txn).unwrap();
//!
//! env.shutdown();
//! ```

#![allow(dead_code)]

pub mod backup;
pub mod compaction;
pub mod database;
pub mod encoding;
pub mod engine;
pub mod environment;
pub mod manifest;
pub mod memtable;
pub mod mvcc;
pub mod node;
pub mod recovery;
pub mod schema;
pub mod scheduler;
pub mod sequence;
pub mod sstable;
pub mod wal;
