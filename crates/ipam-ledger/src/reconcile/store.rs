//! Conflict record store

use crate::models::{ConflictFilter, ConflictRecord, ConflictStatus, ObservedHostFact};
use crate::{Error, Result};
use dashmap::DashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// All conflict records, with an index of the open one per address
///
/// At most one conflict per address is open at a time; that is the dedup
/// key reconciliation relies on.
#[derive(Debug, Default)]
pub struct ConflictStore {
    records: DashMap<Uuid, ConflictRecord>,
    open: DashMap<IpAddr, Uuid>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ConflictRecord) {
        if record.is_open() {
            if let Some(previous) = self.open.insert(record.address, record.id) {
                tracing::warn!(
                    address = %record.address,
                    previous = %previous,
                    replacement = %record.id,
                    "Replacing open conflict"
                );
            }
        }
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: Uuid) -> Option<ConflictRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// The open conflict for an address, if any
    pub fn open_for(&self, address: IpAddr) -> Option<ConflictRecord> {
        let id = *self.open.get(&address)?;
        self.get(id)
    }

    /// Fold a new observation into an existing conflict
    pub fn observe(&self, id: Uuid, fact: ObservedHostFact) -> Option<ConflictRecord> {
        let mut record = self.records.get_mut(&id)?;
        record.observe(fact);
        Some(record.clone())
    }

    /// Close an open conflict
    pub fn close(&self, id: Uuid, status: ConflictStatus) -> Result<ConflictRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or(Error::ConflictNotFound(id))?;
        if !record.is_open() {
            return Err(Error::ConflictAlreadyResolved(id));
        }
        record.status = status;
        let closed = record.clone();
        drop(record);

        self.open.remove_if(&closed.address, |_, open_id| *open_id == id);
        Ok(closed)
    }

    /// Conflicts matching `filter`, oldest first
    pub fn list(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        let mut out: Vec<ConflictRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then(a.address.cmp(&b.address))
        });
        out
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
