//! Point-in-time backup.
//!
//! A backup copies, byte-for-byte, every node file of every database plus
//! each database's scheme file into `<backup_root>/<bsn>.incomplete/`, then
//! copies every rotated log file into its `log/` subdirectory, then renames
//! the incomplete directory to `<backup_root>/<bsn>` on success — matching
//! the node store's own create/seal/rename discipline for atomicity.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while running or inspecting a backup.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error during backup: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup state transition {0:?} -> {1:?} is not valid")]
    InvalidTransition(BackupState, BackupState),
}

/// The backup state machine: `Armed -> CreatingDirs -> Copying ->
/// Finalizing -> Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Armed,
    CreatingDirs,
    Copying,
    Finalizing,
    Complete,
}

impl BackupState {
    fn next(self) -> Option<Self> {
        match self {
            BackupState::Armed => Some(BackupState::CreatingDirs),
            BackupState::CreatingDirs => Some(BackupState::Copying),
            BackupState::Copying => Some(BackupState::Finalizing),
            BackupState::Finalizing => Some(BackupState::Complete),
            BackupState::Complete => None,
        }
    }
}

/// One database's worth of input to a backup job: its node directory, the
/// node files within it, and its scheme file.
pub struct DatabaseSnapshot<'a> {
    pub name: &'a str,
    pub node_files: Vec<PathBuf>,
    pub scheme_file: PathBuf,
}

/// A single backup run, identified by its `bsn` (backup sequence number).
pub struct BackupJob {
    bsn: u64,
    backup_root: PathBuf,
    state: BackupState,
}

impl BackupJob {
    pub fn new(backup_root: impl Into<PathBuf>, bsn: u64) -> Self {
        Self {
            bsn,
            backup_root: backup_root.into(),
            state: BackupState::Armed,
        }
    }

    pub fn bsn(&self) -> u64 {
        self.bsn
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn incomplete_dir(&self) -> PathBuf {
        self.backup_root.join(format!("{}.incomplete", self.bsn))
    }

    fn final_dir(&self) -> PathBuf {
        self.backup_root.join(self.bsn.to_string())
    }

    fn advance(&mut self) -> Result<(), BackupError> {
        match self.state.next() {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            None => Err(BackupError::InvalidTransition(self.state, self.state)),
        }
    }

    /// Runs the full backup pipeline for the given databases and rotated
    /// log files, advancing the state machine at each phase.
    pub fn run(
        &mut self,
        databases: &[DatabaseSnapshot<'_>],
        rotated_log_files: &[PathBuf],
    ) -> Result<PathBuf, BackupError> {
        info!(bsn = self.bsn, "backup: starting");

        self.advance()?; // -> CreatingDirs
        let incomplete = self.incomplete_dir();
        fs::create_dir_all(&incomplete)?;
        for db in databases {
            fs::create_dir_all(incomplete.join(db.name))?;
        }
        fs::create_dir_all(incomplete.join("log"))?;

        self.advance()?; // -> Copying
        for db in databases {
            let db_dir = incomplete.join(db.name);
            copy_file(&db.scheme_file, &db_dir.join("scheme"))?;
            for node_file in &db.node_files {
                let Some(file_name) = node_file.file_name() else {
                    continue;
                };
                copy_file(node_file, &db_dir.join(file_name))?;
            }
        }
        let log_dir = incomplete.join("log");
        for log_file in rotated_log_files {
            let Some(file_name) = log_file.file_name() else {
                continue;
            };
            copy_file(log_file, &log_dir.join(file_name))?;
        }

        self.advance()?; // -> Finalizing
        let final_dir = self.final_dir();
        fs::rename(&incomplete, &final_dir)?;

        self.advance()?; // -> Complete
        info!(bsn = self.bsn, path = ?final_dir, "backup: complete");
        Ok(final_dir)
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<(), BackupError> {
    debug!(from = ?src, to = ?dst, "backup: copying file");
    fs::copy(src, dst)?;
    Ok(())
}

/// Scans `backup_root` for completed backup directories (named by their
/// `bsn`) and returns the highest one found, used to recover `bsn` on
/// repository open. Directories still named `<bsn>.incomplete` are ignored
/// — a crash mid-backup leaves no trace on the recovered sequence.
pub fn recover_last_bsn(backup_root: &Path) -> Result<u64, BackupError> {
    if !backup_root.exists() {
        return Ok(0);
    }

    let mut max_bsn = 0u64;
    for entry in fs::read_dir(backup_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".incomplete") {
            continue;
        }
        match name.parse::<u64>() {
            Ok(bsn) => max_bsn = max_bsn.max(bsn),
            Err(_) => warn!(entry = name, "backup: ignoring unrecognized entry in backup root"),
        }
    }
    Ok(max_bsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_backup_renames_incomplete_to_final() {
        let tmp = tempfile::tempdir().unwrap();
        let node_file = tmp.path().join("1.db");
        fs::File::create(&node_file)
            .unwrap()
            .write_all(b"node-bytes")
            .unwrap();
        let scheme_file = tmp.path().join("scheme");
        fs::File::create(&scheme_file)
            .unwrap()
            .write_all(b"scheme-bytes")
            .unwrap();

        let backup_root = tmp.path().join("backup");
        let mut job = BackupJob::new(&backup_root, 1);
        let dbs = vec![DatabaseSnapshot {
            name: "mydb",
            node_files: vec![node_file],
            scheme_file,
        }];
        let final_dir = job.run(&dbs, &[]).unwrap();

        assert!(final_dir.join("mydb").join("scheme").exists());
        assert!(final_dir.join("mydb").join("1.db").exists());
        assert!(!backup_root.join("1.incomplete").exists());
        assert_eq!(job.state(), BackupState::Complete);
    }

    #[test]
    fn recover_last_bsn_ignores_incomplete_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("3")).unwrap();
        fs::create_dir_all(tmp.path().join("5.incomplete")).unwrap();
        fs::create_dir_all(tmp.path().join("2")).unwrap();
        assert_eq!(recover_last_bsn(tmp.path()).unwrap(), 3);
    }

    #[test]
    fn recover_last_bsn_is_zero_when_root_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        assert_eq!(recover_last_bsn(&missing).unwrap(), 0);
    }
}
