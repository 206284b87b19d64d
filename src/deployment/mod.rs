//! Sole writer of the live predictor.
//!
//! Every version that was ever live is kept as an immutable snapshot, and
//! every state change of a deployment is appended to `deployments.jsonl`
//! (the last line per deployment id wins).

mod atomic;
pub mod snapshot;

pub use atomic::replace_atomically;
pub use snapshot::{SnapshotKind, SnapshotRef};

use crate::journal::{append_lines, read_lines};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

const MAX_SNAPSHOT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("no live predictor at {0}")]
    NoLiveCode(PathBuf),

    #[error("snapshot failed: {0}")]
    Snapshot(#[source] std::io::Error),

    #[error("atomic swap of live code failed: {0}")]
    Swap(#[source] std::io::Error),

    #[error("deployment journal write failed: {0}")]
    Journal(#[source] std::io::Error),

    #[error("unknown deployment {0}")]
    UnknownDeployment(Uuid),

    #[error("unknown snapshot {0}")]
    UnknownSnapshot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deployed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: Uuid,
    /// Snapshot of the live code taken just before this deployment
    pub backup_path: SnapshotRef,
    /// Snapshot of the code this deployment put live
    pub deployed_code_ref: SnapshotRef,
    pub status: DeploymentStatus,
    pub deployed_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub session_id: Option<Uuid>,
    pub description: Option<String>,
}

/// Where a deployment came from
#[derive(Debug, Clone, Default)]
pub struct DeploymentMeta {
    pub session_id: Option<Uuid>,
    pub description: Option<String>,
}

pub struct DeploymentManager {
    live_path: PathBuf,
    snapshot_dir: PathBuf,
    journal_path: PathBuf,
    write_lock: Mutex<()>,
    #[cfg(test)]
    fail_journal: std::sync::atomic::AtomicBool,
}

impl DeploymentManager {
    pub fn new(data_dir: impl AsRef<Path>, live_path: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            live_path: live_path.into(),
            snapshot_dir: data_dir.join("snapshots"),
            journal_path: data_dir.join("deployments.jsonl"),
            write_lock: Mutex::new(()),
            #[cfg(test)]
            fail_journal: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn live_code(&self) -> Result<String, DeploymentError> {
        match std::fs::read_to_string(&self.live_path) {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DeploymentError::NoLiveCode(self.live_path.clone()))
            }
            Err(e) => Err(DeploymentError::Snapshot(e)),
        }
    }

    /// Put `code` live only when nothing is live yet. Returns whether it did.
    pub fn install_initial(&self, code: &str) -> Result<bool, DeploymentError> {
        let _guard = self.lock();
        if self.live_path.exists() {
            return Ok(false);
        }
        replace_atomically(&self.live_path, code.as_bytes()).map_err(DeploymentError::Swap)?;
        tracing::info!(path = %self.live_path.display(), "Installed initial predictor");
        Ok(true)
    }

    /// Back up the live code, swap `code` in, and journal the deployment
    ///
    /// The caller must have validated `code`. On any error the live code is
    /// what it was before the call.
    pub fn deploy(&self, code: &str, meta: DeploymentMeta) -> Result<DeploymentRecord, DeploymentError> {
        let _guard = self.lock();
        let previous = self.live_code()?;

        let backup = self.write_snapshot(SnapshotKind::Backup, &previous)?;
        let release = self.write_snapshot(SnapshotKind::Release, code)?;

        replace_atomically(&self.live_path, code.as_bytes()).map_err(DeploymentError::Swap)?;

        let record = DeploymentRecord {
            deployment_id: Uuid::new_v4(),
            backup_path: backup,
            deployed_code_ref: release,
            status: DeploymentStatus::Deployed,
            deployed_at: Utc::now(),
            rolled_back_at: None,
            session_id: meta.session_id,
            description: meta.description,
        };

        if let Err(e) = self.append_records(std::slice::from_ref(&record)) {
            // Unrecorded deployments must not stay live
            if let Err(restore) = replace_atomically(&self.live_path, previous.as_bytes()) {
                tracing::error!(
                    "Failed to restore live code after journal error: {} (backup kept at {})",
                    restore,
                    record.backup_path
                );
            }
            return Err(DeploymentError::Journal(e));
        }

        tracing::info!(
            deployment_id = %record.deployment_id,
            backup = %record.backup_path,
            release = %record.deployed_code_ref,
            "Deployed new predictor"
        );
        Ok(record)
    }

    /// Restore the backup taken before `deployment_id`
    ///
    /// Later deployments still marked live are rolled back with it, since
    /// their code is gone too. Rolling back an already rolled-back
    /// deployment does nothing and returns its record.
    pub fn rollback(&self, deployment_id: Uuid) -> Result<DeploymentRecord, DeploymentError> {
        let _guard = self.lock();
        let history = self.history()?;
        let record = history
            .iter()
            .find(|r| r.deployment_id == deployment_id)
            .cloned()
            .ok_or(DeploymentError::UnknownDeployment(deployment_id))?;

        if record.status == DeploymentStatus::RolledBack {
            tracing::info!(deployment_id = %deployment_id, "Deployment already rolled back");
            return Ok(record);
        }

        let backup = self.read_snapshot(&record.backup_path)?;
        let from_seq = record.backup_path.seq();
        let superseded = history
            .into_iter()
            .filter(|r| r.status == DeploymentStatus::Deployed)
            .filter(|r| {
                r.deployment_id == deployment_id
                    || matches!((r.backup_path.seq(), from_seq), (Some(seq), Some(from)) if seq >= from)
            })
            .collect();

        let rolled_back = self.restore(&backup, superseded)?;
        let target = rolled_back
            .into_iter()
            .find(|r| r.deployment_id == deployment_id)
            .ok_or(DeploymentError::UnknownDeployment(deployment_id))?;

        tracing::info!(
            deployment_id = %deployment_id,
            restored = %target.backup_path,
            "Rolled back deployment"
        );
        Ok(target)
    }

    /// Make an arbitrary snapshot live again
    ///
    /// Every still-deployed record whose backup is at or after the snapshot
    /// is marked rolled back; their ids are returned.
    pub fn rollback_to(&self, snapshot: &SnapshotRef) -> Result<Vec<Uuid>, DeploymentError> {
        let _guard = self.lock();
        let target_seq = snapshot
            .seq()
            .ok_or_else(|| DeploymentError::UnknownSnapshot(snapshot.to_string()))?;
        let contents = self.read_snapshot(snapshot)?;

        let superseded = self
            .history()?
            .into_iter()
            .filter(|r| r.status == DeploymentStatus::Deployed)
            .filter(|r| r.backup_path.seq().map_or(false, |seq| seq >= target_seq))
            .collect();

        let affected: Vec<Uuid> = self
            .restore(&contents, superseded)?
            .into_iter()
            .map(|r| r.deployment_id)
            .collect();

        tracing::info!(
            snapshot = %snapshot,
            rolled_back = affected.len(),
            "Restored snapshot"
        );
        Ok(affected)
    }

    /// Latest state of every deployment, oldest deployment first
    pub fn history(&self) -> Result<Vec<DeploymentRecord>, DeploymentError> {
        let lines: Vec<DeploymentRecord> =
            read_lines(&self.journal_path).map_err(DeploymentError::Journal)?;

        let mut order: Vec<Uuid> = Vec::new();
        let mut latest: HashMap<Uuid, DeploymentRecord> = HashMap::new();
        for record in lines {
            if !latest.contains_key(&record.deployment_id) {
                order.push(record.deployment_id);
            }
            latest.insert(record.deployment_id, record);
        }

        Ok(order.into_iter().filter_map(|id| latest.remove(&id)).collect())
    }

    /// Most recent deployment that is still live
    pub fn current(&self) -> Result<Option<DeploymentRecord>, DeploymentError> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|r| r.status == DeploymentStatus::Deployed)
            .max_by_key(|r| r.deployed_code_ref.seq()))
    }

    /// Every snapshot on disk, oldest first
    pub fn snapshots(&self) -> Result<Vec<SnapshotRef>, DeploymentError> {
        let entries = match std::fs::read_dir(&self.snapshot_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DeploymentError::Snapshot(e)),
        };

        let mut snapshots: Vec<SnapshotRef> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        snapshots.sort_by_key(|s: &SnapshotRef| s.seq());
        Ok(snapshots)
    }

    pub fn read_snapshot(&self, snapshot: &SnapshotRef) -> Result<String, DeploymentError> {
        match std::fs::read_to_string(self.snapshot_dir.join(snapshot.as_str())) {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DeploymentError::UnknownSnapshot(snapshot.to_string()))
            }
            Err(e) => Err(DeploymentError::Snapshot(e)),
        }
    }

    /// Swap `contents` live and journal `superseded` as rolled back in one
    /// append. If the journal write fails the previous live code goes back.
    fn restore(
        &self,
        contents: &str,
        superseded: Vec<DeploymentRecord>,
    ) -> Result<Vec<DeploymentRecord>, DeploymentError> {
        let previous = match self.live_code() {
            Ok(code) => Some(code),
            Err(DeploymentError::NoLiveCode(_)) => None,
            Err(e) => return Err(e),
        };
        let prerollback = match &previous {
            Some(code) => Some(self.write_snapshot(SnapshotKind::Prerollback, code)?),
            None => None,
        };
        if let Some(snapshot) = &prerollback {
            tracing::debug!(snapshot = %snapshot, "Saved live code before rollback");
        }

        replace_atomically(&self.live_path, contents.as_bytes()).map_err(DeploymentError::Swap)?;

        let now = Utc::now();
        let rolled_back: Vec<DeploymentRecord> = superseded
            .into_iter()
            .map(|record| DeploymentRecord {
                status: DeploymentStatus::RolledBack,
                rolled_back_at: Some(now),
                ..record
            })
            .collect();

        if let Err(e) = self.append_records(&rolled_back) {
            let undo = match &previous {
                Some(code) => replace_atomically(&self.live_path, code.as_bytes()),
                None => std::fs::remove_file(&self.live_path),
            };
            if let Err(undo) = undo {
                tracing::error!(
                    "Failed to put back live code after journal error: {} (saved as {:?})",
                    undo,
                    prerollback
                );
            }
            return Err(DeploymentError::Journal(e));
        }

        Ok(rolled_back)
    }

    fn append_records(&self, records: &[DeploymentRecord]) -> std::io::Result<()> {
        #[cfg(test)]
        {
            if self.fail_journal.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "journal unavailable",
                ));
            }
        }
        append_lines(&self.journal_path, records)
    }

    /// New snapshot file; never overwrites an existing one
    fn write_snapshot(&self, kind: SnapshotKind, contents: &str) -> Result<SnapshotRef, DeploymentError> {
        std::fs::create_dir_all(&self.snapshot_dir).map_err(DeploymentError::Snapshot)?;
        let mut seq = self.next_seq()?;

        for _ in 0..MAX_SNAPSHOT_RETRIES {
            let snapshot = SnapshotRef::new(seq, kind);
            let path = self.snapshot_dir.join(snapshot.as_str());

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    fill_new_file(&path, file, |f| f.write_all(contents.as_bytes()))
                        .map_err(DeploymentError::Snapshot)?;
                    return Ok(snapshot);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => seq += 1,
                Err(e) => return Err(DeploymentError::Snapshot(e)),
            }
        }

        Err(DeploymentError::Snapshot(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not allocate a fresh snapshot name",
        )))
    }

    fn next_seq(&self) -> Result<u64, DeploymentError> {
        Ok(self
            .snapshots()?
            .iter()
            .filter_map(|s| s.seq())
            .max()
            .map_or(1, |max| max + 1))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write and fsync a freshly created file; a partial file is removed so it
/// cannot pass for a complete snapshot
fn fill_new_file(
    path: &Path,
    mut file: File,
    fill: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let result = fill(&mut file).and_then(|_| file.sync_all());
    if result.is_err() {
        drop(file);
        if let Err(cleanup) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), "Could not remove partial snapshot: {}", cleanup);
        }
    }
    result
}
