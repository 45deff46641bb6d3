//! The environment: a process's single handle onto a repository of
//! databases.
//!
//! [`Environment::open`] validates (or creates) the repository root,
//! recovers the backup sequence number and every database's nodes and log
//! tail, then starts the background scheduler and its worker pool. It is
//! the crate's top-level entry point — the `Engine` of the original
//! single-keyspace design generalized to "one process, many schema'd
//! databases, one shared background maintenance loop."

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backup::{BackupError, BackupJob, DatabaseSnapshot};
use crate::database::{Database, DatabaseError, DatabaseStatus};
use crate::encoding;
use crate::engine::{EngineConfig, PointEntry};
use crate::mvcc::{MvccError, MvccManager, Snapshot, Transaction};
use crate::node::Node;
use crate::recovery::{self, LogRecord, LoggedWrite, RecoveryError};
use crate::schema::Schema;
use crate::scheduler::{Planner, Scheduler, Task, WorkerPool, ZoneTable};
use crate::sequence::Sequence;
use crate::wal::Wal;

/// A registered node together with the planner that selected it, so a
/// worker can release the planner's lock once the dispatched task
/// finishes — not just the node's own, unrelated lock flag.
struct RegisteredNode {
    node: Arc<Node>,
    planner: Arc<Planner>,
}

/// Process-wide lookup from `nsn` to the live node it identifies, shared
/// with the worker pool so a dispatched [`Task::Branch`]/[`Task::Compact`]
/// can find the node object a bare integer id refers to.
type NodeRegistry = Arc<Mutex<HashMap<u64, RegisteredNode>>>;

/// Top-level configuration for an [`Environment`].
#[derive(Debug, Clone)]
pub struct SophiaConfig {
    pub engine: EngineConfig,
    pub worker_threads: usize,
    pub zones: ZoneTableConfig,
}

/// A plain, serializable mirror of [`ZoneTable`] for configuration
/// purposes; converted into the real table on environment open.
#[derive(Debug, Clone, Default)]
pub struct ZoneTableConfig {
    pub entries: Vec<(u8, crate::scheduler::ZoneConfig)>,
}

impl Default for SophiaConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                write_buffer_size: 4 * 1024 * 1024,
                compaction_strategy: crate::compaction::CompactionStrategyType::Stcs,
                bucket_low: 0.5,
                bucket_high: 1.5,
                min_sstable_size: 50 * 1024,
                min_threshold: 4,
                max_threshold: 32,
                tombstone_ratio_threshold: 0.3,
                tombstone_compaction_interval: 3600,
                tombstone_bloom_fallback: true,
                tombstone_range_drop: true,
                thread_pool_size: 2,
            },
            worker_threads: 2,
            zones: ZoneTableConfig::default(),
        }
    }
}

/// Errors raised by environment-level operations.
#[derive(Debug, Error)]
pub enum SophiaError {
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("mvcc error: {0}")]
    Mvcc(#[from] MvccError),

    #[error("backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("no database named {0:?}")]
    NoSuchDatabase(String),

    #[error("a database named {0:?} already exists")]
    AlreadyExists(String),
}

impl SophiaError {
    /// A stable numeric code for callers that want C-style status checks
    /// alongside the `Result`-based API.
    pub fn code(&self) -> u32 {
        match self {
            SophiaError::Recovery(_) => 1,
            SophiaError::Database(_) => 2,
            SophiaError::Mvcc(_) => 3,
            SophiaError::Backup(_) => 4,
            SophiaError::NoSuchDatabase(_) => 5,
            SophiaError::AlreadyExists(_) => 6,
        }
    }
}

/// The process-wide storage environment: a repository root, its open
/// databases, the shared sequence object, the MVCC transaction table, and
/// the background scheduler.
pub struct Environment {
    root: PathBuf,
    config: SophiaConfig,
    sequence: Sequence,
    mvcc: MvccManager,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    scheduler: Arc<Scheduler>,
    worker_pool: Mutex<Option<WorkerPool>>,
    last_error: Mutex<Option<SophiaError>>,
    node_registry: NodeRegistry,
    /// Environment-wide transaction log: unlike a node's own engine WAL,
    /// which only makes that one node's writes durable, this log groups an
    /// entire transaction's writes — across every database/node it
    /// touched — under one `BEGIN`, so recovery can tell whether the whole
    /// transaction made it to stable storage rather than just part of it.
    log: Mutex<Wal<LogRecord>>,
    /// Log segments superseded by a rotation, kept around for backup to
    /// copy until an explicit cleanup policy is added.
    rotated_logs: Mutex<Vec<PathBuf>>,
}

impl Environment {
    /// Opens (creating if necessary) the repository at `root`, recovers
    /// every existing database found under it, and starts the background
    /// scheduler's worker pool.
    pub fn open(root: impl AsRef<Path>, config: SophiaConfig) -> Result<Arc<Self>, SophiaError> {
        let root = root.as_ref().to_path_buf();
        let backup_root = root.join("backup");
        let bsn = recovery::open_repository(&root, &backup_root)?;

        let sequence = Sequence::new();
        sequence.observe_bsn(bsn);

        let mut zones = ZoneTable::new();
        for (pct, zone) in &config.zones.entries {
            zones.set_zone(*pct, zone.clone());
        }
        let scheduler = Arc::new(Scheduler::new(zones));

        let log_dir = root.join("log");
        std::fs::create_dir_all(&log_dir).map_err(RecoveryError::Io)?;

        let databases = RwLock::new(HashMap::new());
        let env = Arc::new(Self {
            root: root.clone(),
            config,
            sequence,
            mvcc: MvccManager::new(),
            databases,
            scheduler: scheduler.clone(),
            worker_pool: Mutex::new(None),
            last_error: Mutex::new(None),
            node_registry: Arc::new(Mutex::new(HashMap::new())),
            log: Mutex::new(Wal::open(log_dir.join("wal-000000.log"), None).map_err(RecoveryError::Wal)?),
            rotated_logs: Mutex::new(Vec::new()),
        });

        env.recover_databases()?;
        env.replay_log_and_rotate()?;
        env.start_workers();
        Ok(env)
    }

    /// Replays every existing environment log segment against the now-open
    /// databases, applying each complete transaction batch's rows to its
    /// owning node store, then rotates to a fresh segment beyond the
    /// highest one found, for new writes to land in.
    fn replay_log_and_rotate(&self) -> Result<(), SophiaError> {
        let log_dir = self.root.join("log");
        let segments = recovery::list_log_segments(&log_dir)?;

        let by_dsn: HashMap<u64, Arc<Database>> = self
            .databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|db| (db.dsn(), db.clone()))
            .collect();

        let mut highest_seq = 0u64;
        for segment in &segments {
            let wal: Wal<LogRecord> = Wal::open(segment, None).map_err(RecoveryError::Wal)?;
            highest_seq = highest_seq.max(wal.wal_seq());
            recovery::replay_log::<LogRecord, _>(&wal, |batch| {
                let mut by_dsn_entries: HashMap<u64, Vec<PointEntry>> = HashMap::new();
                for (dsn, payload) in batch.rows {
                    let Ok((write, _)) = encoding::decode_from_slice::<LoggedWrite>(&payload) else {
                        warn!(dsn, "environment: dropping undecodable logged write");
                        continue;
                    };
                    let entry = match write.value {
                        Some(value) => PointEntry::new(write.key, value, batch.lsn, write.timestamp),
                        None => PointEntry::new_delete(write.key, batch.lsn, write.timestamp),
                    };
                    by_dsn_entries.entry(dsn).or_default().push(entry);
                }
                for (dsn, entries) in by_dsn_entries {
                    if let Some(db) = by_dsn.get(&dsn) {
                        if let Err(e) = db.apply_committed(entries) {
                            warn!(dsn, error = %e, "environment: failed to apply replayed log batch");
                        }
                    }
                }
            })?;
        }

        // `wal-000000.log` always exists by this point (opened in `open`
        // before this runs), so `segments` is never empty and a fresh
        // segment always follows replay, per the environment's recovery
        // procedure.
        let next_seq = highest_seq + 1;
        let next_path = log_dir.join(format!("wal-{next_seq:06}.log"));
        let fresh: Wal<LogRecord> = Wal::open(&next_path, None).map_err(RecoveryError::Wal)?;
        *self.log.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
        *self.rotated_logs.lock().unwrap_or_else(|p| p.into_inner()) = segments;
        Ok(())
    }

    fn databases_dir(&self) -> PathBuf {
        self.root.join("databases")
    }

    fn recover_databases(&self) -> Result<(), SophiaError> {
        let databases_dir = self.databases_dir();
        if !databases_dir.exists() {
            std::fs::create_dir_all(&databases_dir).map_err(RecoveryError::Io)?;
            return Ok(());
        }

        for entry in std::fs::read_dir(&databases_dir).map_err(RecoveryError::Io)? {
            let entry = entry.map_err(RecoveryError::Io)?;
            if !entry.file_type().map_err(RecoveryError::Io)?.is_dir() {
                continue;
            }
            let db_dir = entry.path();
            if recovery::has_drop_marker(&db_dir) {
                recovery::remove_dropped_database(&db_dir)?;
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            self.open_existing_database(&name, &db_dir)?;
        }
        Ok(())
    }

    fn open_existing_database(&self, name: &str, db_dir: &Path) -> Result<(), SophiaError> {
        let scheme_path = db_dir.join("scheme");
        let schema = if scheme_path.exists() {
            decode_schema(&recovery::read_scheme_file(&scheme_path)?)
        } else {
            // A database directory with no scheme file yet is mid-creation
            // from an interrupted `create_database`; skip it rather than
            // guessing a schema.
            warn!(name, "environment: database has no scheme file, skipping recovery");
            return Ok(());
        };

        let dsn = self.sequence.next_dsn();
        let database = Arc::new(Database::new(dsn, name, db_dir, schema));

        let node_dir = db_dir.join("nodes");
        let scan = recovery::scan_node_directory(&node_dir)?;
        if scan.surviving_nodes.is_empty() {
            database.create_initial_node(&self.sequence, self.config.engine.clone())?;
        } else {
            for (index, (nsn, node_path)) in scan.surviving_nodes.iter().enumerate() {
                self.sequence.observe_nsn(*nsn);
                let node = Arc::new(crate::node::Node::open(
                    node_path.clone(),
                    *nsn,
                    None,
                    self.config.engine.clone(),
                )?);
                let min_key = if index == 0 { Vec::new() } else { nsn.to_be_bytes().to_vec() };
                database.insert_node(min_key, node);
            }
        }

        self.scheduler.register_database(dsn, database.planner().clone());
        database.set_status(DatabaseStatus::Online);
        self.register_nodes(&database);

        self.databases
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), database);
        info!(name, "environment: database recovered");
        Ok(())
    }

    fn register_nodes(&self, database: &Database) {
        let mut registry = self.node_registry.lock().unwrap_or_else(|p| p.into_inner());
        let planner = database.planner().clone();
        for node in database.nodes() {
            registry.insert(
                node.nsn(),
                RegisteredNode {
                    node,
                    planner: planner.clone(),
                },
            );
        }
    }

    fn start_workers(&self) {
        let receiver = self.scheduler.task_receiver();
        let scheduler = self.scheduler.clone();
        let registry = self.node_registry.clone();
        let pool = WorkerPool::spawn(self.config.worker_threads, receiver, move |task| {
            handle_task(&scheduler, &registry, task)
        });
        *self.worker_pool.lock().unwrap_or_else(|p| p.into_inner()) = Some(pool);
    }

    /// Creates a new, empty database with the given name and schema.
    pub fn create_database(&self, name: &str, schema: Schema) -> Result<Arc<Database>, SophiaError> {
        let mut databases = self.databases.write().unwrap_or_else(|p| p.into_inner());
        if databases.contains_key(name) {
            return Err(SophiaError::AlreadyExists(name.to_string()));
        }

        let db_dir = self.databases_dir().join(name);
        std::fs::create_dir_all(db_dir.join("nodes")).map_err(RecoveryError::Io)?;
        recovery::write_scheme_file(&db_dir.join("scheme"), &encode_schema(&schema))?;

        let dsn = self.sequence.next_dsn();
        let database = Arc::new(Database::new(dsn, name, &db_dir, schema));
        database.create_initial_node(&self.sequence, self.config.engine.clone())?;
        self.scheduler.register_database(dsn, database.planner().clone());
        database.set_status(DatabaseStatus::Online);
        self.register_nodes(&database);

        databases.insert(name.to_string(), database.clone());
        Ok(database)
    }

    /// Looks up an open database by name.
    pub fn database(&self, name: &str) -> Result<Arc<Database>, SophiaError> {
        self.databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| SophiaError::NoSuchDatabase(name.to_string()))
    }

    /// Marks a database dropped: writes a `drop` marker so recovery removes
    /// it even if the process dies mid-drop, unregisters it from the
    /// scheduler, then removes its directory tree immediately.
    pub fn drop_database(&self, name: &str) -> Result<(), SophiaError> {
        let database = {
            let mut databases = self.databases.write().unwrap_or_else(|p| p.into_inner());
            databases.remove(name)
        };
        let Some(database) = database else {
            return Err(SophiaError::NoSuchDatabase(name.to_string()));
        };
        database.set_status(DatabaseStatus::Shutdown);
        self.scheduler.unregister_database(database.dsn());
        std::fs::write(database.dir().join("drop"), b"").map_err(RecoveryError::Io)?;
        std::fs::remove_dir_all(database.dir()).map_err(RecoveryError::Io)?;
        Ok(())
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    /// Begins a new transaction against this environment's shared sequence
    /// object.
    pub fn begin_transaction(&self) -> Arc<Transaction> {
        self.mvcc.begin(&self.sequence)
    }

    /// Commits a transaction's writes across every database it touched,
    /// applying the results to each database's owning nodes.
    pub fn commit_transaction(&self, txn: &Transaction) -> Result<(), SophiaError> {
        let databases = self.databases.read().unwrap_or_else(|p| p.into_inner());
        let mut indices = HashMap::new();
        for db in databases.values() {
            indices.insert(db.dsn(), db.index());
        }

        if let Err(e) = self.mvcc.prepare(txn, &indices, None) {
            self.mvcc.rollback(txn, &indices);
            return Err(e.into());
        }

        let lsn_base = self.sequence.next_lsn_batch(1);
        let timestamp = self.sequence.next_rsn();
        let committed = self.mvcc.commit(txn, &indices, lsn_base, timestamp)?;
        self.log_committed(&committed, lsn_base)?;

        for (dsn, entries) in committed {
            if let Some(db) = databases.values().find(|d| d.dsn() == dsn) {
                db.apply_committed(entries)?;
            }
        }
        Ok(())
    }

    /// Durably records a committed transaction's writes, across every
    /// database it touched, under one `BEGIN` in the environment log before
    /// they are applied to any node store — so recovery can tell whether
    /// the whole transaction reached stable storage, not just the part that
    /// happened to land in an individual node's own WAL before a crash.
    fn log_committed(&self, committed: &HashMap<u64, Vec<PointEntry>>, lsn_base: u64) -> Result<(), SophiaError> {
        let rowcount: usize = committed.values().map(Vec::len).sum();
        if rowcount == 0 {
            return Ok(());
        }

        let log = self.log.lock().unwrap_or_else(|p| p.into_inner());
        log.append(&LogRecord::Begin {
            lsn: lsn_base,
            rowcount: rowcount as u32,
        })
        .map_err(RecoveryError::Wal)?;
        for (dsn, entries) in committed {
            for entry in entries {
                let write = LoggedWrite {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    timestamp: entry.timestamp,
                };
                let payload = encoding::encode_to_vec(&write).map_err(RecoveryError::Encoding)?;
                log.append(&LogRecord::Row {
                    lsn: entry.lsn,
                    dsn: *dsn,
                    payload,
                })
                .map_err(RecoveryError::Wal)?;
            }
        }
        Ok(())
    }

    /// Begins a long-lived, read-only snapshot pinned to the environment's
    /// current lsn, for consistent cursor iteration across one or more
    /// databases.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.sequence.current_lsn())
    }

    /// On-demand, advisory deadlock check against the wait-for graph built
    /// from every transaction currently waiting behind another's pending
    /// write. Applications that serialize their own lock acquisition order
    /// never need this; it exists for callers that let transactions block
    /// on each other and want to break a cycle rather than wait it out.
    pub fn check_deadlock(&self, txn: &Transaction) -> Result<(), SophiaError> {
        Ok(self.mvcc.check_deadlock(txn.id())?)
    }

    pub fn rollback_transaction(&self, txn: &Transaction) {
        let databases = self.databases.read().unwrap_or_else(|p| p.into_inner());
        let mut indices = HashMap::new();
        for db in databases.values() {
            indices.insert(db.dsn(), db.index());
        }
        self.mvcc.rollback(txn, &indices);
    }

    /// Runs the scheduler's decision loop once. Normally driven by a
    /// background thread; exposed directly for tests and for embedders that
    /// want to control the cadence themselves.
    pub fn poll(&self) {
        self.scheduler.tick();
    }

    /// Triggers an immediate, synchronous backup to `<root>/backup/<bsn>`.
    pub fn backup(&self) -> Result<PathBuf, SophiaError> {
        let bsn = self.sequence.next_bsn();
        let backup_root = self.root.join("backup");
        let databases = self.databases.read().unwrap_or_else(|p| p.into_inner());

        let mut per_db_files = Vec::new();
        for db in databases.values() {
            let mut files = Vec::new();
            for node in db.nodes() {
                files.extend(node.branch_files().map_err(DatabaseError::from)?);
            }
            per_db_files.push(files);
        }
        let snapshots: Vec<DatabaseSnapshot> = databases
            .values()
            .zip(per_db_files.iter())
            .map(|(db, files)| DatabaseSnapshot {
                name: db.name(),
                node_files: files.clone(),
                scheme_file: db.dir().join("scheme"),
            })
            .collect();

        let rotated_logs = self.rotated_logs.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut job = BackupJob::new(&backup_root, bsn);
        let path = job.run(&snapshots, &rotated_logs)?;
        Ok(path)
    }

    /// Returns and clears the last error recorded against this environment,
    /// mirroring the source design's single-slot `environment.error()`
    /// accessor for callers that poll rather than propagate `Result`s.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .map(|e| e.to_string())
    }

    fn record_error(&self, error: SophiaError) {
        *self.last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    /// Requests an orderly shutdown of the background scheduler and its
    /// worker pool. Blocks until every worker thread has exited.
    pub fn shutdown(&self) {
        self.scheduler.request_shutdown();
        if let Some(pool) = self.worker_pool.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pool.join();
        }
    }
}

fn handle_task(_scheduler: &Arc<Scheduler>, registry: &NodeRegistry, task: Task) {
    match task {
        Task::Shutdown => {
            debug!("worker: shutdown task received");
        }
        Task::Branch { node_id } => {
            trace_task("branch", node_id);
            if let Some((node, planner)) = lookup_node(registry, node_id) {
                if let Err(e) = node.branch() {
                    warn!(node_id, error = %e, "worker: branch failed");
                }
                node.unlock();
                planner.unlock(node_id);
            }
        }
        Task::Compact { node_id } => {
            trace_task("compact", node_id);
            if let Some((node, planner)) = lookup_node(registry, node_id) {
                let result = node
                    .compact_gc()
                    .or_else(|_| node.compact_minor())
                    .or_else(|_| node.compact_major());
                if let Err(e) = result {
                    warn!(node_id, error = %e, "worker: compact failed");
                }
                node.unlock();
                planner.unlock(node_id);
            }
        }
        Task::Backup { bsn } => {
            debug!(bsn, "worker: backup task received");
        }
        Task::Drop { node_id } => trace_task("drop", node_id),
    }
}

fn lookup_node(registry: &NodeRegistry, node_id: u64) -> Option<(Arc<Node>, Arc<Planner>)> {
    registry
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(&node_id)
        .map(|entry| (entry.node.clone(), entry.planner.clone()))
}

fn trace_task(kind: &str, node_id: u64) {
    debug!(kind, node_id, "worker: task received");
}

fn encode_schema(schema: &Schema) -> Vec<recovery::SchemeEntry> {
    schema
        .parts()
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let mut bytes = Vec::new();
            let _ = crate::encoding::Encode::encode_to(&part.ty, &mut bytes);
            bytes.extend_from_slice(part.name.as_bytes());
            recovery::SchemeEntry {
                entry_type: 1,
                id: i as u32,
                bytes,
            }
        })
        .collect()
}

fn decode_schema(entries: &[recovery::SchemeEntry]) -> Schema {
    use crate::encoding::Decode;

    let mut parts = Vec::new();
    for entry in entries {
        if entry.entry_type != 1 {
            continue;
        }
        if let Ok((ty, consumed)) = crate::schema::KeyPartType::decode_from(&entry.bytes) {
            let name = String::from_utf8_lossy(&entry.bytes[consumed..]).into_owned();
            parts.push(crate::schema::KeyPart::new(name, ty));
        }
    }
    Schema::new(parts).unwrap_or_else(|_| {
        Schema::new(vec![crate::schema::KeyPart::new(
            "key",
            crate::schema::KeyPartType::String,
        )])
        .expect("single-part fallback schema is always valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{KeyPart, KeyPartType};

    fn schema() -> Schema {
        Schema::new(vec![KeyPart::new("k", KeyPartType::String)]).unwrap()
    }

    #[test]
    fn open_creates_repository_and_database() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
        let db = env.create_database("mydb", schema()).unwrap();
        db.set_auto_commit(env.mvcc(), env.sequence(), b"a".to_vec(), b"1".to_vec(), None)
            .unwrap();
        assert_eq!(db.get_committed(b"a").unwrap(), Some(b"1".to_vec()));
        env.shutdown();
    }

    #[test]
    fn reopen_recovers_existing_database() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
            let db = env.create_database("mydb", schema()).unwrap();
            db.set_auto_commit(env.mvcc(), env.sequence(), b"a".to_vec(), b"1".to_vec(), None)
                .unwrap();
            env.shutdown();
        }
        let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
        let db = env.database("mydb").unwrap();
        assert_eq!(db.get_committed(b"a").unwrap(), Some(b"1".to_vec()));
        env.shutdown();
    }

    #[test]
    fn duplicate_database_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Environment::open(tmp.path(), SophiaConfig::default()).unwrap();
        env.create_database("mydb", schema()).unwrap();
        let err = env.create_database("mydb", schema()).unwrap_err();
        assert!(matches!(err, SophiaError::AlreadyExists(_)));
        env.shutdown();
    }
}
