//! Repository and log recovery.
//!
//! On startup the engine validates the repository root, classifies every
//! node file it finds on disk (live, transient-incomplete, or
//! transient-sealed), reads each database's scheme file, and replays the
//! environment's log pool to reconstruct any state not yet durable in the
//! node stores. A torn tail — a batch header with fewer rows than promised,
//! or a record cut off mid-write by a crash — is expected and is stopped at
//! silently rather than surfaced as a corruption error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalData, WalError};

/// Errors raised while recovering the repository or a single database.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("I/O error during recovery: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL error during recovery: {0}")]
    Wal(#[from] WalError),

    #[error("scheme file is corrupt: {0}")]
    CorruptScheme(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Node directory scan (spec.md §4.14 point 3)
// ------------------------------------------------------------------------------------------------

/// The suffix a node file was found with during a directory scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeFileKind {
    /// `<id>.db` — a live, sealed node.
    Live,
    /// `<parent>.<id>.db.incomplete` — a transient, never-sealed write.
    Incomplete,
    /// `<parent>.<id>.db.seal` — a transient, sealed-but-not-yet-renamed
    /// successor awaiting its parent's removal.
    Seal,
}

#[derive(Debug, Default, Clone)]
struct TrackEntry {
    live: Option<PathBuf>,
    incomplete: Option<PathBuf>,
    seal: Option<PathBuf>,
}

/// The outcome of scanning and reconciling one database's node directory:
/// the final, surviving set of `<id>.db` paths to open as nodes, paired
/// with the `nsn` each path's name encodes so callers can reopen a node
/// under its original identity instead of minting a new one.
#[derive(Debug, Default)]
pub struct NodeDirectoryScan {
    pub surviving_nodes: Vec<(u64, PathBuf)>,
}

/// A node entry is a directory (each node owns a full nested engine
/// directory tree) so transient-state cleanup must remove a tree, not a
/// single file.
fn remove_path(path: &Path) -> Result<(), RecoveryError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn classify_file_name(name: &str) -> Option<(u64, NodeFileKind)> {
    if let Some(id_str) = name.strip_suffix(".db") {
        if let Ok(id) = id_str.parse::<u64>() {
            return Some((id, NodeFileKind::Live));
        }
        return None;
    }
    if let Some(rest) = name.strip_suffix(".db.incomplete") {
        let id = rest.rsplit('.').next()?.parse::<u64>().ok()?;
        return Some((id, NodeFileKind::Incomplete));
    }
    if let Some(rest) = name.strip_suffix(".db.seal") {
        let id = rest.rsplit('.').next()?.parse::<u64>().ok()?;
        return Some((id, NodeFileKind::Seal));
    }
    None
}

/// Scans a database's node directory, classifies every file by suffix, and
/// reconciles the transient states left by a crash:
///
/// - Any `.incomplete` file is deleted — it was never sealed.
/// - Any `.seal` file whose parent node still has a live `.db` file is
///   deleted — the parent was never removed, so the successor never
///   completed.
/// - Any `.seal` file whose parent has no live `.db` is renamed to `.db` —
///   the successor completed but the final rename was interrupted.
pub fn scan_node_directory(dir: &Path) -> Result<NodeDirectoryScan, RecoveryError> {
    let mut track: HashMap<u64, TrackEntry> = HashMap::new();

    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(NodeDirectoryScan::default());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some((id, kind)) = classify_file_name(name) else {
            continue;
        };
        let slot = track.entry(id).or_default();
        match kind {
            NodeFileKind::Live => slot.live = Some(entry.path()),
            NodeFileKind::Incomplete => slot.incomplete = Some(entry.path()),
            NodeFileKind::Seal => slot.seal = Some(entry.path()),
        }
    }

    let mut surviving = Vec::new();
    for (id, entry) in track {
        if let Some(incomplete) = &entry.incomplete {
            warn!(id, path = ?incomplete, "recovery: deleting incomplete node file");
            remove_path(incomplete)?;
        }

        match (entry.live, entry.seal) {
            (Some(live), Some(seal)) => {
                warn!(id, path = ?seal, "recovery: parent still live, deleting stale seal");
                remove_path(&seal)?;
                surviving.push((id, live));
            }
            (Some(live), None) => surviving.push((id, live)),
            (None, Some(seal)) => {
                let final_path = seal.with_extension("");
                let final_path = final_path.with_extension("db");
                info!(id, from = ?seal, to = ?final_path, "recovery: completing interrupted rename");
                fs::rename(&seal, &final_path)?;
                surviving.push((id, final_path));
            }
            (None, None) => {}
        }
    }

    Ok(NodeDirectoryScan {
        surviving_nodes: surviving,
    })
}

// ------------------------------------------------------------------------------------------------
// Scheme file (spec.md §4.14 point 4)
// ------------------------------------------------------------------------------------------------

/// One `(type, id, bytes)` tuple in a database's scheme file: name, format,
/// storage, key schema, node size, page size, checksum, sync, compression,
/// and compression-of-keys all travel as individually-tagged tuples so
/// future settings can be appended without invalidating old scheme files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeEntry {
    pub entry_type: u32,
    pub id: u32,
    pub bytes: Vec<u8>,
}

impl Encode for SchemeEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.entry_type.encode_to(buf)?;
        self.id.encode_to(buf)?;
        self.bytes.encode_to(buf)
    }
}

impl Decode for SchemeEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (entry_type, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (id, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (bytes, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            SchemeEntry {
                entry_type,
                id,
                bytes,
            },
            offset,
        ))
    }
}

const SCHEME_MAGIC: u32 = 0x5350_4843; // "SPHC"

/// Writes a framed, CRC-sealed scheme file: `[magic][crc32][count][entry*]`.
pub fn write_scheme_file(path: &Path, entries: &[SchemeEntry]) -> Result<(), RecoveryError> {
    let mut body = Vec::new();
    encoding::encode_vec(entries, &mut body)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(body.len() + 12);
    SCHEME_MAGIC.encode_to(&mut out)?;
    crc.encode_to(&mut out)?;
    out.extend_from_slice(&body);

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &out)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads and validates a scheme file written by [`write_scheme_file`].
pub fn read_scheme_file(path: &Path) -> Result<Vec<SchemeEntry>, RecoveryError> {
    let bytes = fs::read(path)?;
    let (magic, mut offset) = u32::decode_from(&bytes)
        .map_err(|e| RecoveryError::CorruptScheme(format!("header: {e}")))?;
    if magic != SCHEME_MAGIC {
        return Err(RecoveryError::CorruptScheme("bad magic".into()));
    }
    let (stored_crc, n) = u32::decode_from(&bytes[offset..])
        .map_err(|e| RecoveryError::CorruptScheme(format!("crc: {e}")))?;
    offset += n;

    let body = &bytes[offset..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_crc {
        return Err(RecoveryError::CorruptScheme("crc mismatch".into()));
    }

    let (entries, _) = encoding::decode_vec::<SchemeEntry>(body)?;
    Ok(entries)
}

// ------------------------------------------------------------------------------------------------
// Log replay (spec.md §4.14 point 5)
// ------------------------------------------------------------------------------------------------

/// One record in the environment's log pool: either a single committed row
/// routed to database `dsn`, or a batch header announcing `rowcount`
/// following rows that must be applied together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Row { lsn: u64, dsn: u64, payload: Vec<u8> },
    Begin { lsn: u64, rowcount: u32 },
}

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            LogRecord::Row { lsn, dsn, payload } => {
                0u32.encode_to(buf)?;
                lsn.encode_to(buf)?;
                dsn.encode_to(buf)?;
                payload.encode_to(buf)
            }
            LogRecord::Begin { lsn, rowcount } => {
                1u32.encode_to(buf)?;
                lsn.encode_to(buf)?;
                rowcount.encode_to(buf)
            }
        }
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        match tag {
            0 => {
                let (lsn, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (dsn, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (payload, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Ok((LogRecord::Row { lsn, dsn, payload }, offset))
            }
            1 => {
                let (lsn, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (rowcount, n) = u32::decode_from(&buf[offset..])?;
                offset += n;
                Ok((LogRecord::Begin { lsn, rowcount }, offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "LogRecord",
            }),
        }
    }
}

/// A fully-replayed batch: the lsn taken from its `BEGIN` header, the
/// rowcount it promised, and the rows that actually followed it.
#[derive(Debug, Clone)]
pub struct ReplayedBatch {
    pub lsn: u64,
    pub expected: u32,
    pub rows: Vec<(u64, Vec<u8>)>, // (dsn, payload)
}

impl ReplayedBatch {
    /// A batch is complete only if every row promised by its `BEGIN`
    /// actually arrived before the file ended or the next `BEGIN` started.
    pub fn is_complete(&self) -> bool {
        self.rows.len() == self.expected as usize
    }
}

/// Streams every record in `wal`, grouping rows under their `BEGIN` header
/// into [`ReplayedBatch`]es and invoking `on_batch` for each one that
/// completed — i.e. every row its `BEGIN` promised actually arrived.
///
/// A partial batch — a `BEGIN` promising `rowcount` rows that never all
/// arrive before the next `BEGIN` or the file's end, or any record that
/// fails to decode — is expected after a crash (the log may have been torn
/// mid-write) and is dropped silently rather than surfaced as an error or
/// applied half-written.
pub fn replay_log<T, F>(wal: &Wal<LogRecord>, mut on_batch: F) -> Result<(), RecoveryError>
where
    T: WalData,
    F: FnMut(ReplayedBatch),
{
    let iter = wal.replay_iter()?;
    let mut pending: Option<ReplayedBatch> = None;

    for item in iter {
        let record = match item {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "recovery: log tail is torn, stopping replay of this file");
                break;
            }
        };

        match record {
            LogRecord::Begin { lsn, rowcount } => {
                if let Some(batch) = pending.take() {
                    if batch.is_complete() {
                        on_batch(batch);
                    } else {
                        debug!(lsn = batch.lsn, rows = batch.rows.len(), expected = batch.expected, "recovery: dropping unterminated batch");
                    }
                }
                pending = Some(ReplayedBatch {
                    lsn,
                    expected: rowcount,
                    rows: Vec::with_capacity(rowcount as usize),
                });
            }
            LogRecord::Row { dsn, payload, .. } => match &mut pending {
                Some(batch) => {
                    batch.rows.push((dsn, payload));
                }
                None => {
                    warn!("recovery: row record with no preceding BEGIN, skipping");
                }
            },
        }
    }

    if let Some(batch) = pending {
        if batch.is_complete() {
            on_batch(batch);
        } else {
            debug!(lsn = batch.lsn, rows = batch.rows.len(), expected = batch.expected, "recovery: dropping unterminated trailing batch");
        }
    }

    Ok(())
}

/// One logged write: the key/value pair a transaction committed, carried as
/// a [`LogRecord::Row`] payload so replay can reconstruct a
/// [`crate::engine::PointEntry`] without depending on the mvcc module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedWrite {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: u64,
}

impl Encode for LoggedWrite {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        self.timestamp.encode_to(buf)
    }
}

impl Decode for LoggedWrite {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Option::<Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((LoggedWrite { key, value, timestamp }, offset))
    }
}

/// Lists the environment log's segment files under `log_dir`, sorted by
/// sequence number ascending (the `wal-%06d.log` naming sorts lexically in
/// sequence order). Creates `log_dir` if it doesn't exist yet.
pub fn list_log_segments(log_dir: &Path) -> Result<Vec<PathBuf>, RecoveryError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with("wal-") && name.ends_with(".log") {
            segments.push(entry.path());
        }
    }
    segments.sort();
    Ok(segments)
}

// ------------------------------------------------------------------------------------------------
// Repository-level recovery (spec.md §4.14 point 1)
// ------------------------------------------------------------------------------------------------

/// Validates (creating if missing) the repository root and recovers the
/// last backup sequence number by scanning `backup_root`.
pub fn open_repository(root: &Path, backup_root: &Path) -> Result<u64, RecoveryError> {
    if !root.exists() {
        info!(path = ?root, "recovery: creating repository root");
        fs::create_dir_all(root)?;
    }
    let bsn = crate::backup::recover_last_bsn(backup_root)
        .map_err(|e| RecoveryError::CorruptScheme(e.to_string()))?;
    Ok(bsn)
}

/// Checks whether a database directory carries a `drop` marker, indicating
/// it should be removed rather than recovered (spec.md §4.14 point 2).
pub fn has_drop_marker(db_dir: &Path) -> bool {
    db_dir.join("drop").exists()
}

/// Removes a dropped database's directory tree.
pub fn remove_dropped_database(db_dir: &Path) -> Result<(), RecoveryError> {
    info!(path = ?db_dir, "recovery: removing dropped database");
    fs::remove_dir_all(db_dir)?;
    Ok(())
}
