//! The background planner, scheduler, and worker pool.
//!
//! A per-database [`Planner`] keeps two priority queues over that
//! database's nodes (by in-memory size and by branch count) and answers
//! `plan(request)` with the best node for a given kind of work. The
//! process-wide [`Scheduler`] drives one decision loop per tick across
//! every database, per the fixed decision order in the storage engine's
//! design, and dispatches selected work to a [`WorkerPool`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, trace};

/// A task handed from the planner to a worker thread.
#[derive(Debug, Clone)]
pub enum Task {
    Branch { node_id: u64 },
    Compact { node_id: u64 },
    Backup { bsn: u64 },
    Shutdown,
    Drop { node_id: u64 },
}

/// The kind of plan a caller (scheduler tick or on-demand API call) is
/// asking the planner for.
#[derive(Debug, Clone, Copy)]
pub enum PlanRequest {
    Branch { watermark: usize },
    Age { ttl_secs: u64, ttl_watermark: usize },
    Compact { watermark: usize },
    Checkpoint { lsn: u64 },
    Gc { vlsn: u64, pct_watermark: f64 },
    Backup { bsn: u64 },
    BackupEnd { bsn: u64 },
    Shutdown,
    Drop,
}

/// The result of `plan(request)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// `0` — nothing matched the request.
    Nothing,
    /// `1` — a node was selected and locked for the caller.
    Selected(u64),
    /// `2` — matching work is already in progress; retry later.
    InProgress,
}

/// Per-node statistics the planner tracks to keep its priority queues
/// current. Supplied by the node store after every mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
    pub in_memory_size: usize,
    pub branch_count: usize,
    pub age_secs: u64,
    pub dup_keys: u64,
    pub total_keys: u64,
    pub backup_bsn: u64,
}

const SIZE_BUCKET_BYTES: usize = 1024 * 1024; // 1 MiB
const SIZE_BUCKET_MAX: usize = 4000;
const BRANCH_BUCKET_MAX: usize = 20;

fn size_bucket(bytes: usize) -> usize {
    (bytes / SIZE_BUCKET_BYTES).min(SIZE_BUCKET_MAX)
}

fn branch_bucket(count: usize) -> usize {
    count.min(BRANCH_BUCKET_MAX)
}

/// The two priority queues a database's planner maintains over its nodes,
/// bucketed by in-memory size (1 MiB steps, capped at 4000) and by branch
/// count (1-step, capped at 20).
#[derive(Debug, Default)]
struct PlannerQueues {
    by_size: BTreeMap<usize, Vec<u64>>,
    by_branch_count: BTreeMap<usize, Vec<u64>>,
    stats: BTreeMap<u64, NodeStats>,
    locked: Mutex<std::collections::HashSet<u64>>,
}

impl PlannerQueues {
    fn remove_node(&mut self, node_id: u64) {
        if let Some(stats) = self.stats.remove(&node_id) {
            remove_from_bucket(&mut self.by_size, size_bucket(stats.in_memory_size), node_id);
            remove_from_bucket(
                &mut self.by_branch_count,
                branch_bucket(stats.branch_count),
                node_id,
            );
        }
    }

    fn upsert_node(&mut self, node_id: u64, stats: NodeStats) {
        self.remove_node(node_id);
        self.by_size
            .entry(size_bucket(stats.in_memory_size))
            .or_default()
            .push(node_id);
        self.by_branch_count
            .entry(branch_bucket(stats.branch_count))
            .or_default()
            .push(node_id);
        self.stats.insert(node_id, stats);
    }

    fn is_locked(&self, node_id: u64) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&node_id)
    }

    fn lock_node(&self, node_id: u64) {
        self.locked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(node_id);
    }

    fn unlock_node(&self, node_id: u64) {
        self.locked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&node_id);
    }

    /// Highest-bucket node not currently locked, for the given queue.
    fn best(&self, queue: &BTreeMap<usize, Vec<u64>>, min_bucket: usize) -> Option<u64> {
        for (&bucket, nodes) in queue.iter().rev() {
            if bucket < min_bucket {
                break;
            }
            if let Some(&node_id) = nodes.iter().find(|&&n| !self.is_locked(n)) {
                return Some(node_id);
            }
        }
        None
    }
}

fn remove_from_bucket(map: &mut BTreeMap<usize, Vec<u64>>, bucket: usize, node_id: u64) {
    if let Some(nodes) = map.get_mut(&bucket) {
        nodes.retain(|&n| n != node_id);
        if nodes.is_empty() {
            map.remove(&bucket);
        }
    }
}

/// The per-database planner: keeps the two priority queues in sync with
/// node statistics and answers `plan(request)` with the node, if any,
/// that request should act on.
#[derive(Debug, Default)]
pub struct Planner {
    queues: Mutex<PlannerQueues>,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    /// `update(flags, node)` — records fresh statistics for a node,
    /// re-bucketing it in both queues.
    pub fn update(&self, node_id: u64, stats: NodeStats) {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .upsert_node(node_id, stats);
    }

    /// `remove(flags, node)` — drops a node from both queues, e.g. after
    /// it has been compacted away.
    pub fn remove(&self, node_id: u64) {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove_node(node_id);
    }

    /// `plan(request) -> (rc, node)`.
    pub fn plan(&self, request: PlanRequest) -> PlanOutcome {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());

        let candidate = match request {
            PlanRequest::Branch { watermark } => {
                queues.best(&queues.by_size, size_bucket(watermark))
            }
            PlanRequest::Compact { watermark } => {
                queues.best(&queues.by_branch_count, branch_bucket(watermark))
            }
            PlanRequest::Age {
                ttl_secs,
                ttl_watermark,
            } => queues
                .stats
                .iter()
                .find(|(id, s)| {
                    s.age_secs >= ttl_secs
                        && s.in_memory_size >= ttl_watermark
                        && !queues.is_locked(**id)
                })
                .map(|(&id, _)| id),
            PlanRequest::Gc {
                vlsn: _,
                pct_watermark,
            } => queues
                .stats
                .iter()
                .find(|(id, s)| {
                    s.total_keys > 0
                        && (s.dup_keys as f64 / s.total_keys as f64) >= pct_watermark
                        && !queues.is_locked(**id)
                })
                .map(|(&id, _)| id),
            PlanRequest::Backup { bsn } => queues
                .stats
                .iter()
                .find(|(id, s)| s.backup_bsn < bsn && !queues.is_locked(**id))
                .map(|(&id, _)| id),
            PlanRequest::Checkpoint { .. }
            | PlanRequest::BackupEnd { .. }
            | PlanRequest::Shutdown
            | PlanRequest::Drop => None,
        };

        match candidate {
            Some(node_id) => {
                queues.lock_node(node_id);
                trace!(node_id, "planner: selected node");
                PlanOutcome::Selected(node_id)
            }
            None => PlanOutcome::Nothing,
        }
    }

    /// Releases a node's planner lock after a worker completes its task.
    pub fn unlock(&self, node_id: u64) {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .unlock_node(node_id);
    }
}

/// Per-zone scheduler parameters, selected by memory-used percent. Zone 0
/// is the default; zones are keyed by percent in steps of 10, and lookup
/// rounds down to the nearest enabled zone.
#[derive(Debug, Clone, Copy)]
pub struct ZoneConfig {
    pub mode: ZoneMode,
    pub compact_wm: usize,
    pub branch_prio: usize,
    pub branch_wm: usize,
    pub branch_age: u64,
    pub branch_age_period: u64,
    pub branch_age_wm: usize,
    pub backup_prio: usize,
    pub gc_db_prio: usize,
    pub gc_prio: usize,
    pub gc_period: u64,
    pub gc_wm: f64,
    pub async_concurrency: usize,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            mode: ZoneMode::BranchAndCompact,
            compact_wm: 4,
            branch_prio: 1,
            branch_wm: 4 * 1024 * 1024,
            branch_age: 300,
            branch_age_period: 60,
            branch_age_wm: 1024 * 1024,
            backup_prio: 1,
            gc_db_prio: 1,
            gc_prio: 1,
            gc_period: 300,
            gc_wm: 0.5,
            async_concurrency: 4,
        }
    }
}

/// The scheduling mode active within a memory-pressure zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMode {
    Off,
    Branch,
    Checkpoint,
    BranchAndCompact,
}

/// A table of [`ZoneConfig`]s keyed by memory-used percent, in steps of 10.
#[derive(Debug, Clone)]
pub struct ZoneTable {
    zones: BTreeMap<u8, ZoneConfig>,
}

impl Default for ZoneTable {
    fn default() -> Self {
        let mut zones = BTreeMap::new();
        zones.insert(0, ZoneConfig::default());
        Self { zones }
    }
}

impl ZoneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the configuration for the zone starting at
    /// `pct` (must be a multiple of 10).
    pub fn set_zone(&mut self, pct: u8, config: ZoneConfig) {
        self.zones.insert(pct - (pct % 10), config);
    }

    /// Looks up the config for the zone at or below `pct`, rounding down
    /// to the nearest enabled zone. Zone 0 always exists.
    pub fn lookup(&self, pct: u8) -> ZoneConfig {
        self.zones
            .range(..=pct)
            .next_back()
            .map(|(_, cfg)| *cfg)
            .unwrap_or_default()
    }
}

/// Process-wide scheduler: drives one decision-order tick across every
/// registered database planner and fans work out to a [`WorkerPool`].
pub struct Scheduler {
    planners: Mutex<BTreeMap<u64, Arc<Planner>>>,
    zones: Mutex<ZoneTable>,
    tasks_tx: Sender<Task>,
    tasks_rx: Receiver<Task>,
    wal_rotated_this_tick: AtomicBool,
    shutdown: AtomicBool,
    memory_used_pct: AtomicU64,
}

impl Scheduler {
    pub fn new(zones: ZoneTable) -> Self {
        let (tasks_tx, tasks_rx) = channel::unbounded();
        Self {
            planners: Mutex::new(BTreeMap::new()),
            zones: Mutex::new(zones),
            tasks_tx,
            tasks_rx,
            wal_rotated_this_tick: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            memory_used_pct: AtomicU64::new(0),
        }
    }

    pub fn register_database(&self, dsn: u64, planner: Arc<Planner>) {
        self.planners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(dsn, planner);
    }

    pub fn unregister_database(&self, dsn: u64) {
        self.planners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&dsn);
    }

    pub fn set_memory_used_pct(&self, pct: u8) {
        self.memory_used_pct.store(pct as u64, Ordering::Relaxed);
    }

    /// A receiver workers can drain tasks from.
    pub fn task_receiver(&self) -> Receiver<Task> {
        self.tasks_rx.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in 0..64 {
            let _ = self.tasks_tx.send(Task::Shutdown);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Runs one pass of the fixed decision order over every registered
    /// database, dispatching at most one task per database per tick.
    /// Mirrors the storage engine's documented scheduler loop: rotate,
    /// checkpoint, zone policy, drop, backup, gc, age, branch, compact.
    pub fn tick(&self) {
        if self.is_shutting_down() {
            return;
        }

        self.wal_rotated_this_tick.store(false, Ordering::Relaxed);

        let pct = self.memory_used_pct.load(Ordering::Relaxed) as u8;
        let zone = self.zones.lock().unwrap_or_else(|p| p.into_inner()).lookup(pct);
        if zone.mode == ZoneMode::Off {
            trace!("scheduler: zone mode is Off, skipping tick");
            return;
        }

        let planners: Vec<(u64, Arc<Planner>)> = self
            .planners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(&dsn, p)| (dsn, p.clone()))
            .collect();

        for (dsn, planner) in planners {
            if let PlanOutcome::Selected(node_id) =
                planner.plan(PlanRequest::Gc { vlsn: 0, pct_watermark: zone.gc_wm })
            {
                info!(dsn, node_id, "scheduler: dispatching gc task");
                let _ = self.tasks_tx.send(Task::Compact { node_id });
                continue;
            }

            if zone.mode == ZoneMode::Off {
                continue;
            }

            if let PlanOutcome::Selected(node_id) = planner.plan(PlanRequest::Age {
                ttl_secs: zone.branch_age,
                ttl_watermark: zone.branch_age_wm,
            }) {
                info!(dsn, node_id, "scheduler: dispatching age-triggered branch");
                let _ = self.tasks_tx.send(Task::Branch { node_id });
                continue;
            }

            if let PlanOutcome::Selected(node_id) = planner.plan(PlanRequest::Branch {
                watermark: zone.branch_wm,
            }) {
                debug!(dsn, node_id, "scheduler: dispatching branch task");
                let _ = self.tasks_tx.send(Task::Branch { node_id });
                continue;
            }

            if zone.mode == ZoneMode::BranchAndCompact {
                if let PlanOutcome::Selected(node_id) = planner.plan(PlanRequest::Compact {
                    watermark: zone.compact_wm,
                }) {
                    debug!(dsn, node_id, "scheduler: dispatching compact task");
                    let _ = self.tasks_tx.send(Task::Compact { node_id });
                }
            }
        }
    }
}

/// A fixed-size pool of worker threads that loop `plan -> execute ->
/// complete`, draining tasks the [`Scheduler`] dispatches.
pub struct WorkerPool {
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads, each running `handler` for every
    /// task received until a [`Task::Shutdown`] arrives.
    pub fn spawn<F>(count: usize, receiver: Receiver<Task>, handler: F) -> Self
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let handles = (0..count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                std::thread::Builder::new()
                    .name(format!("sophia-worker-{worker_id}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            if matches!(task, Task::Shutdown) {
                                debug!(worker_id, "worker: shutdown received");
                                break;
                            }
                            handler(task);
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { handles }
    }

    /// Blocks until every worker thread has exited.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
