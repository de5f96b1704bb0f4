//! Snapshot persistence
//!
//! The ledger lives in memory; a [`LedgerSnapshot`] captures subnets, every
//! current and historical record, conflicts and the audit trail so the whole
//! state can be exported and restored.

use crate::models::{AllocationRecord, AuditEntry, ConflictRecord, Subnet};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot format version written by this crate
pub const SNAPSHOT_VERSION: u32 = 1;

/// Full exported ledger state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    /// Ordered by id
    pub subnets: Vec<Subnet>,
    /// Current and historical records, ordered by address then creation
    pub records: Vec<AllocationRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub audit: Vec<AuditEntry>,
}

impl LedgerSnapshot {
    pub fn check_version(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        Ok(())
    }
}

/// Where snapshots are kept
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;

    /// The latest saved snapshot, if any
    fn load(&self) -> Result<Option<LedgerSnapshot>>;
}

/// Keeps the latest snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    latest: RwLock<Option<LedgerSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        *self.latest.write() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.latest.read().clone())
    }
}

/// Writes snapshots as pretty JSON to a single file
///
/// A save goes to a sibling temporary file first and is renamed over the
/// target, so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SnapshotStore for JsonFileStore {
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;

        tracing::info!(
            path = %self.path.display(),
            subnets = snapshot.subnets.len(),
            records = snapshot.records.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: LedgerSnapshot = serde_json::from_slice(&body)?;
        snapshot.check_version()?;
        Ok(Some(snapshot))
    }
}
