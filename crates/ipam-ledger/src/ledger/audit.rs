//! Append-only audit trail

use crate::models::{AuditEntry, StateKind, SubnetId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::IpAddr;
use uuid::Uuid;

/// Everything needed to append one entry
#[derive(Debug, Clone)]
pub struct AuditDraft<'a> {
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub record_id: Uuid,
    pub actor: &'a str,
    pub at: DateTime<Utc>,
    pub previous: StateKind,
    pub next: StateKind,
    pub reason: &'a str,
}

/// Append-only list of [`AuditEntry`] values
///
/// Entries are never modified or removed; sequence numbers are dense and
/// start at 1.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number
    pub fn append(&self, draft: AuditDraft<'_>) -> u64 {
        let mut entries = self.entries.lock();
        let sequence = entries.len() as u64 + 1;
        entries.push(AuditEntry {
            sequence,
            address: draft.address,
            subnet_id: draft.subnet_id,
            record_id: draft.record_id,
            actor: draft.actor.to_string(),
            at: draft.at,
            previous: draft.previous,
            next: draft.next,
            reason: draft.reason.to_string(),
        });
        sequence
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full trail in sequence order
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Entries with a sequence number greater than `sequence`
    pub fn since(&self, sequence: u64) -> Vec<AuditEntry> {
        let entries = self.entries.lock();
        let start = (sequence as usize).min(entries.len());
        entries[start..].to_vec()
    }

    /// Entries touching one address
    pub fn for_address(&self, address: IpAddr) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.address == address)
            .cloned()
            .collect()
    }

    /// Replace the trail with persisted entries, renumbering densely
    pub(crate) fn restore(&self, mut restored: Vec<AuditEntry>) {
        restored.sort_by_key(|e| e.sequence);
        for (i, entry) in restored.iter_mut().enumerate() {
            entry.sequence = i as u64 + 1;
        }
        *self.entries.lock() = restored;
    }
}
