//! Per-address allocation ledger
//!
//! Owns every [`AllocationRecord`] and the only code path that changes
//! record state. Each address has its own slot lock, so transitions on
//! different addresses never contend; the per-subnet active index is updated
//! inside the same critical section as the record it counts.

mod audit;

pub use audit::{AuditDraft, AuditLog};

use crate::models::{
    AddressStatus, AllocationRecord, AllocationSource, AllocationState, AllocationType,
    HostIdentity, StateKind, SubnetId, Transition,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Field updates carried by a transition
#[derive(Debug, Clone, Default)]
pub struct RecordChange {
    pub identity: Option<HostIdentity>,
    pub device_type: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub allocation_type: Option<AllocationType>,
    pub source: Option<AllocationSource>,
    /// `Some(None)` clears the expiry
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RecordChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn device_type(mut self, device_type: Option<String>) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn allocation_type(mut self, allocation_type: AllocationType) -> Self {
        self.allocation_type = Some(allocation_type);
        self
    }

    pub fn source(mut self, source: AllocationSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn seen_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_seen = Some(at);
        self
    }

    fn apply_to(self, record: &mut AllocationRecord) {
        if let Some(identity) = self.identity {
            record.identity = identity;
        }
        if self.device_type.is_some() {
            record.device_type = self.device_type;
        }
        if self.owner.is_some() {
            record.owner = self.owner;
        }
        if self.description.is_some() {
            record.description = self.description;
        }
        if let Some(allocation_type) = self.allocation_type {
            record.allocation_type = allocation_type;
        }
        if let Some(source) = self.source {
            record.source = source;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(seen) = self.last_seen {
            record.last_seen = Some(seen);
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    /// Non-terminal record, `None` when the address is FREE
    current: Option<AllocationRecord>,
    /// Terminal records, oldest first
    history: Vec<AllocationRecord>,
}

#[derive(Debug, Default)]
struct AddressSlot {
    state: Mutex<SlotState>,
}

/// Locked view of one address handed to [`AllocationLedger::with_address`]
pub struct AddressEntry<'a> {
    ledger: &'a AllocationLedger,
    address: IpAddr,
    slot: &'a mut SlotState,
}

impl<'a> AddressEntry<'a> {
    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn current(&self) -> Option<&AllocationRecord> {
        self.slot.current.as_ref()
    }

    pub fn status(&self) -> AddressStatus {
        match &self.slot.current {
            Some(record) => AddressStatus::Held(record.clone()),
            None => AddressStatus::Free,
        }
    }

    pub fn kind(&self) -> StateKind {
        self.slot
            .current
            .as_ref()
            .map(|r| r.kind())
            .unwrap_or(StateKind::Free)
    }

    /// Apply one transition and return the resulting record
    ///
    /// `subnet_id` is used when a new record is created from FREE; existing
    /// records keep their subnet.
    pub fn apply(
        &mut self,
        subnet_id: SubnetId,
        transition: Transition,
        change: RecordChange,
        actor: &str,
    ) -> Result<AllocationRecord> {
        let now = Utc::now();
        let previous = self.slot.current.as_ref().map(|r| r.state);
        let previous_kind = previous.map(|s| s.kind()).unwrap_or(StateKind::Free);

        let next = AllocationState::apply(previous.as_ref(), transition).ok_or(
            Error::InvalidTransition {
                address: self.address,
                from: previous_kind,
                event: transition.name(),
            },
        )?;

        let is_new = self.slot.current.is_none();
        let mut record = match self.slot.current.take() {
            Some(record) => record,
            None => AllocationRecord {
                id: Uuid::new_v4(),
                address: self.address,
                subnet_id,
                state: next,
                identity: HostIdentity::default(),
                device_type: None,
                owner: None,
                description: None,
                allocation_type: AllocationType::default(),
                source: AllocationSource::Manual,
                created_at: now,
                updated_at: now,
                expires_at: None,
                last_seen: None,
                audit_ref: 0,
            },
        };

        change.apply_to(&mut record);
        record.state = next;
        record.updated_at = now;

        if transition != Transition::Touch {
            record.audit_ref = self.ledger.audit.append(AuditDraft {
                address: self.address,
                subnet_id: record.subnet_id,
                record_id: record.id,
                actor,
                at: now,
                previous: previous_kind,
                next: next.kind(),
                reason: transition.name(),
            });
        }

        if next.is_terminal() {
            self.ledger.index_remove(record.subnet_id, self.address);
            self.slot.history.push(record.clone());
            tracing::debug!(
                address = %self.address,
                subnet_id = %record.subnet_id,
                state = %next.kind(),
                "Record closed"
            );
        } else {
            if is_new {
                self.ledger.index_insert(record.subnet_id, self.address);
            }
            self.slot.current = Some(record.clone());
        }

        Ok(record)
    }
}

/// The allocation ledger
#[derive(Debug)]
pub struct AllocationLedger {
    slots: DashMap<IpAddr, Arc<AddressSlot>>,
    /// Active (non-terminal) addresses per subnet
    active: DashMap<SubnetId, BTreeSet<IpAddr>>,
    audit: AuditLog,
    lock_timeout: Duration,
}

impl AllocationLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            active: DashMap::new(),
            audit: AuditLog::new(),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    fn slot(&self, address: IpAddr) -> Arc<AddressSlot> {
        self.slots.entry(address).or_default().clone()
    }

    fn existing_slot(&self, address: IpAddr) -> Option<Arc<AddressSlot>> {
        self.slots.get(&address).map(|s| s.value().clone())
    }

    fn index_insert(&self, subnet_id: SubnetId, address: IpAddr) {
        self.active.entry(subnet_id).or_default().insert(address);
    }

    fn index_remove(&self, subnet_id: SubnetId, address: IpAddr) {
        if let Some(mut set) = self.active.get_mut(&subnet_id) {
            set.remove(&address);
        }
    }

    /// Run `f` with the address exclusively locked
    ///
    /// Fails with [`Error::Busy`] if the lock is not acquired within the
    /// configured timeout.
    pub fn with_address<R>(
        &self,
        address: IpAddr,
        f: impl FnOnce(&mut AddressEntry<'_>) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(address);
        let mut guard = slot
            .state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Error::Busy(format!("address {}", address)))?;

        let mut entry = AddressEntry {
            ledger: self,
            address,
            slot: &mut guard,
        };
        f(&mut entry)
    }

    /// Current state of an address
    pub fn get(&self, address: IpAddr) -> Result<AddressStatus> {
        let Some(slot) = self.existing_slot(address) else {
            return Ok(AddressStatus::Free);
        };
        let guard = slot
            .state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Error::Busy(format!("address {}", address)))?;
        Ok(match &guard.current {
            Some(record) => AddressStatus::Held(record.clone()),
            None => AddressStatus::Free,
        })
    }

    /// Apply a single transition under the address lock
    pub fn transition(
        &self,
        address: IpAddr,
        subnet_id: SubnetId,
        transition: Transition,
        change: RecordChange,
        actor: &str,
    ) -> Result<AllocationRecord> {
        self.with_address(address, |entry| entry.apply(subnet_id, transition, change, actor))
    }

    /// Terminal records of an address, oldest first
    pub fn history(&self, address: IpAddr) -> Result<Vec<AllocationRecord>> {
        let Some(slot) = self.existing_slot(address) else {
            return Ok(Vec::new());
        };
        let guard = slot
            .state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Error::Busy(format!("address {}", address)))?;
        Ok(guard.history.clone())
    }

    /// Number of active records governed by a subnet
    pub fn active_count(&self, subnet_id: SubnetId) -> u128 {
        self.active
            .get(&subnet_id)
            .map(|set| set.len() as u128)
            .unwrap_or(0)
    }

    /// Active addresses of a subnet in ascending order
    pub fn active_addresses(&self, subnet_id: SubnetId) -> Vec<IpAddr> {
        self.active
            .get(&subnet_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active addresses of a subnet that fall inside `net`
    pub fn active_within(&self, subnet_id: SubnetId, net: &IpNet) -> Vec<IpAddr> {
        let Some(set) = self.active.get(&subnet_id) else {
            return Vec::new();
        };
        set.range(net.network()..=net.broadcast()).copied().collect()
    }

    /// Run `f` over the ordered active set of a subnet
    pub fn with_active<R>(&self, subnet_id: SubnetId, f: impl FnOnce(&BTreeSet<IpAddr>) -> R) -> R {
        match self.active.get(&subnet_id) {
            Some(set) => f(&set),
            None => f(&BTreeSet::new()),
        }
    }

    /// Current records of a subnet in address order
    pub fn records_in(&self, subnet_id: SubnetId) -> Result<Vec<AllocationRecord>> {
        let mut records = Vec::new();
        for address in self.active_addresses(subnet_id) {
            if let AddressStatus::Held(record) = self.get(address)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Addresses whose lease elapsed at `now`
    ///
    /// Conflicted records are left for triage. Busy slots are skipped and
    /// picked up by the next sweep.
    pub fn due_for_expiry(&self, now: DateTime<Utc>) -> Vec<(IpAddr, SubnetId)> {
        let slots: Vec<(IpAddr, Arc<AddressSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut due = Vec::new();
        for (address, slot) in slots {
            let Some(guard) = slot.state.try_lock_for(self.lock_timeout) else {
                tracing::debug!(address = %address, "Skipping busy slot during expiry scan");
                continue;
            };
            if let Some(record) = &guard.current {
                if record.is_due(now) && record.kind() != StateKind::Conflicted {
                    due.push((address, record.subnet_id));
                }
            }
        }
        due.sort();
        due
    }

    /// Move active records of `from` into the subnets that now govern them
    ///
    /// Every affected slot is locked before anything changes, so either all
    /// records move or none do.
    pub(crate) fn rehome(
        &self,
        from: SubnetId,
        targets: &[(SubnetId, IpNet)],
        actor: &str,
    ) -> Result<usize> {
        let moves: Vec<(IpAddr, SubnetId)> = self
            .active_addresses(from)
            .into_iter()
            .filter_map(|addr| {
                targets
                    .iter()
                    .find(|(_, net)| net.contains(&addr))
                    .map(|(id, _)| (addr, *id))
            })
            .collect();
        if moves.is_empty() {
            return Ok(0);
        }

        let slots: Vec<Arc<AddressSlot>> = moves.iter().map(|(addr, _)| self.slot(*addr)).collect();
        let mut guards = Vec::with_capacity(slots.len());
        for (slot, (addr, _)) in slots.iter().zip(&moves) {
            let guard = slot
                .state
                .try_lock_for(self.lock_timeout)
                .ok_or_else(|| Error::Busy(format!("address {}", addr)))?;
            guards.push(guard);
        }

        let now = Utc::now();
        for (guard, (addr, to)) in guards.iter_mut().zip(&moves) {
            if let Some(record) = guard.current.as_mut() {
                record.subnet_id = *to;
                record.updated_at = now;
                record.audit_ref = self.audit.append(AuditDraft {
                    address: *addr,
                    subnet_id: *to,
                    record_id: record.id,
                    actor,
                    at: now,
                    previous: record.kind(),
                    next: record.kind(),
                    reason: "rehome",
                });
            }
        }

        if let Some(mut set) = self.active.get_mut(&from) {
            for (addr, _) in &moves {
                set.remove(addr);
            }
        }
        for (addr, to) in &moves {
            self.index_insert(*to, *addr);
        }

        tracing::info!(
            from = %from,
            moved = moves.len(),
            "Re-homed allocations into more specific subnets"
        );

        Ok(moves.len())
    }

    /// Every record, current and historical
    pub fn all_records(&self) -> Result<Vec<AllocationRecord>> {
        let slots: Vec<(IpAddr, Arc<AddressSlot>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut records = Vec::new();
        for (address, slot) in slots {
            let guard = slot
                .state
                .try_lock_for(self.lock_timeout)
                .ok_or_else(|| Error::Busy(format!("address {}", address)))?;
            records.extend(guard.history.iter().cloned());
            records.extend(guard.current.iter().cloned());
        }
        records.sort_by(|a, b| a.address.cmp(&b.address).then(a.updated_at.cmp(&b.updated_at)));
        Ok(records)
    }

    /// Load a persisted record
    pub(crate) fn restore_record(&self, record: AllocationRecord) -> Result<()> {
        let address = record.address;
        self.with_address(address, |entry| {
            if record.is_active() {
                if entry.slot.current.is_some() {
                    return Err(Error::AlreadyAllocated(address));
                }
                entry.ledger.index_insert(record.subnet_id, address);
                entry.slot.current = Some(record);
            } else {
                entry.slot.history.push(record);
            }
            Ok(())
        })
    }
}
