//! IPAM Service
//!
//! Single entry point over the ledger, providing:
//! - Subnet tree operations
//! - Address allocation and lease handling
//! - Reconciliation and conflict triage
//! - Capacity planning
//! - Snapshot export and restore

use crate::allocator::{AllocationEngine, AllocationRequest};
use crate::config::LedgerConfig;
use crate::events::{
    Channel, EventPublisher, LedgerMessage, PublisherStats, SubnetEvent,
};
use crate::ledger::AllocationLedger;
use crate::models::{
    AddressStatus, AllocationPolicy, AllocationRecord, AuditEntry, ConflictFilter,
    ConflictRecord, ObservedHostFact, ResolutionAction, Subnet, SubnetId, SubnetSpec,
};
use crate::planner::{CapacityPlanner, Forecast, GrowthTrend, SpaceSummary, Utilization};
use crate::reconcile::ReconciliationEngine;
use crate::space::AddressSpace;
use crate::storage::{LedgerSnapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything known about one address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressReport {
    pub address: IpAddr,
    /// Most specific subnet containing the address, if any
    pub subnet_id: Option<SubnetId>,
    pub status: AddressStatus,
    pub open_conflict: Option<ConflictRecord>,
}

/// Statistics for the service
#[derive(Debug, Clone, Default)]
pub struct IpamStats {
    pub total_subnets: usize,
    pub root_subnets: usize,
    pub active_records: usize,
    pub open_conflicts: usize,
    pub audit_entries: usize,
    pub events: PublisherStats,
}

/// The address-space ledger service
#[derive(Debug)]
pub struct IpamService {
    config: LedgerConfig,
    ledger: Arc<AllocationLedger>,
    space: Arc<AddressSpace>,
    allocator: AllocationEngine,
    reconciler: ReconciliationEngine,
    planner: CapacityPlanner,
    events: EventPublisher,
}

impl IpamService {
    /// Create an empty ledger
    pub fn new(config: LedgerConfig) -> Result<Self> {
        config.validate()?;

        let events = if config.event_channel_capacity == 0 {
            EventPublisher::new()
        } else {
            EventPublisher::with_capacity(config.event_channel_capacity)
        };
        let ledger = Arc::new(AllocationLedger::new(config.lock_timeout()));
        let space = Arc::new(AddressSpace::new(ledger.clone()));
        let allocator = AllocationEngine::new(space.clone(), events.clone())
            .with_thresholds(&config.exhaustion_thresholds);
        let reconciler =
            ReconciliationEngine::new(space.clone(), events.clone(), config.reconciler());
        let planner = CapacityPlanner::new(space.clone());

        Ok(Self {
            config,
            ledger,
            space,
            allocator,
            reconciler,
            planner,
            events,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    // ==================== Subnet Operations ====================

    /// Insert a subnet and return its snapshot
    pub fn create_subnet(
        &self,
        cidr: IpNet,
        parent_hint: Option<SubnetId>,
        spec: SubnetSpec,
    ) -> Result<Subnet> {
        let id = self.space.insert_subnet(cidr, parent_hint, spec)?;
        self.subnet_created(id)
    }

    /// Create a child of `prefix_len` in the lowest free block of `parent`
    pub fn carve_subnet(&self, parent: SubnetId, prefix_len: u8, spec: SubnetSpec) -> Result<Subnet> {
        let id = self.space.carve_subnet(parent, prefix_len, spec)?;
        self.subnet_created(id)
    }

    /// Split a childless subnet into equal children
    pub fn split_subnet(&self, id: SubnetId, new_prefix: u8) -> Result<Vec<Subnet>> {
        let ids = self.space.split_subnet(id, new_prefix)?;
        ids.into_iter().map(|child| self.subnet_created(child)).collect()
    }

    /// Remove an empty, childless subnet
    pub fn remove_subnet(&self, id: SubnetId) -> Result<Subnet> {
        let removed = self.space.remove_subnet(id)?;
        self.events
            .publish(LedgerMessage::SubnetRemoved(SubnetEvent::from_subnet(&removed)));
        Ok(removed)
    }

    fn subnet_created(&self, id: SubnetId) -> Result<Subnet> {
        let subnet = self.space.get(id)?;
        self.events
            .publish(LedgerMessage::SubnetCreated(SubnetEvent::from_subnet(&subnet)));
        Ok(subnet)
    }

    pub fn set_policy(&self, id: SubnetId, policy: AllocationPolicy) -> Result<()> {
        self.space.set_policy(id, policy)
    }

    pub fn set_metadata(&self, id: SubnetId, key: &str, value: Option<String>) -> Result<()> {
        self.space.set_metadata(id, key, value)
    }

    pub fn get_subnet(&self, id: SubnetId) -> Result<Subnet> {
        self.space.get(id)
    }

    pub fn list_subnets(&self) -> Result<Vec<Subnet>> {
        self.space.list()
    }

    /// Most specific subnet containing `addr`
    pub fn find_containing(&self, addr: IpAddr) -> Result<SubnetId> {
        self.space.find_containing(addr)
    }

    pub fn children(&self, id: SubnetId) -> Result<Vec<SubnetId>> {
        self.space.children(id)
    }

    pub fn ancestors(&self, id: SubnetId) -> Result<Vec<SubnetId>> {
        self.space.ancestors(id)
    }

    // ==================== Address Operations ====================

    pub fn allocate(&self, request: AllocationRequest) -> Result<AllocationRecord> {
        self.allocator.allocate(request)
    }

    pub fn reserve(&self, request: AllocationRequest) -> Result<AllocationRecord> {
        self.allocator.reserve(request)
    }

    pub fn confirm(&self, address: IpAddr, actor: &str) -> Result<AllocationRecord> {
        self.allocator.confirm(address, actor)
    }

    pub fn release(&self, address: IpAddr, actor: &str) -> Result<AllocationRecord> {
        self.allocator.release(address, actor)
    }

    pub fn renew(&self, address: IpAddr, lease: Option<Duration>, actor: &str) -> Result<AllocationRecord> {
        self.allocator.renew(address, lease, actor)
    }

    pub fn find_available(&self, subnet_id: SubnetId, count: usize) -> Result<Vec<IpAddr>> {
        self.allocator.find_available(subnet_id, count)
    }

    /// Ledger state, governing subnet and open conflict of an address
    pub fn get_status(&self, address: IpAddr) -> Result<AddressReport> {
        let subnet_id = match self.space.find_containing(address) {
            Ok(id) => Some(id),
            Err(Error::NoContainingSubnet(_)) => None,
            Err(e) => return Err(e),
        };
        Ok(AddressReport {
            address,
            subnet_id,
            status: self.ledger.get(address)?,
            open_conflict: self.reconciler.conflicts().open_for(address),
        })
    }

    /// Closed records of an address, oldest first
    pub fn history(&self, address: IpAddr) -> Result<Vec<AllocationRecord>> {
        self.ledger.history(address)
    }

    /// Audit entries, optionally for a single address
    pub fn audit_trail(&self, address: Option<IpAddr>) -> Vec<AuditEntry> {
        match address {
            Some(address) => self.ledger.audit().for_address(address),
            None => self.ledger.audit().entries(),
        }
    }

    // ==================== Reconciliation ====================

    pub fn reconcile(
        &self,
        subnet_id: SubnetId,
        facts: Vec<ObservedHostFact>,
    ) -> Result<Vec<ConflictRecord>> {
        self.reconciler.reconcile(subnet_id, facts)
    }

    pub fn reconcile_at(
        &self,
        subnet_id: SubnetId,
        facts: Vec<ObservedHostFact>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConflictRecord>> {
        self.reconciler.reconcile_at(subnet_id, facts, now)
    }

    pub fn list_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        self.reconciler.list_conflicts(filter)
    }

    pub fn get_conflict(&self, id: Uuid) -> Result<ConflictRecord> {
        self.reconciler.get_conflict(id)
    }

    pub fn resolve_conflict(
        &self,
        id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<ConflictRecord> {
        self.reconciler.resolve_conflict(id, action, actor)
    }

    // ==================== Capacity ====================

    pub fn utilization(&self, subnet_id: SubnetId) -> Result<Utilization> {
        self.planner.utilization(subnet_id)
    }

    pub fn free_capacity(&self, subnet_id: SubnetId) -> Result<u128> {
        self.space.free_capacity(subnet_id)
    }

    pub fn forecast(
        &self,
        subnet_id: SubnetId,
        horizon: Duration,
        trend: Option<GrowthTrend>,
    ) -> Result<Forecast> {
        self.planner.forecast(subnet_id, horizon, trend)
    }

    pub fn summary(&self) -> Result<SpaceSummary> {
        self.planner.summary()
    }

    // ==================== Expiry ====================

    /// Expire every lease that elapsed at `now`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<AllocationRecord> {
        self.allocator.sweep_expired(now)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every sweep interval
    ///
    /// The task ends on its own once the service is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    tracing::debug!("Service dropped, expiry sweeper stopping");
                    break;
                };
                let expired = service.sweep_expired(Utc::now());
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "Sweeper pass complete");
                }
            }
        })
    }

    // ==================== Events ====================

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<LedgerMessage> {
        self.events.subscribe(channel)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerMessage> {
        self.events.subscribe_all()
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    // ==================== Persistence ====================

    /// Export the full ledger state
    ///
    /// The tree is frozen for the duration of the capture, so every record
    /// refers to a subnet in the same snapshot. Fails with [`Error::Busy`]
    /// when structural changes hold the tree past the lock timeout.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.space.with_frozen_structure(|| {
            Ok(LedgerSnapshot {
                version: SNAPSHOT_VERSION,
                taken_at: Utc::now(),
                subnets: self.space.list()?,
                records: self.ledger.all_records()?,
                conflicts: self.reconciler.list_conflicts(&ConflictFilter::default()),
                audit: self.ledger.audit().entries(),
            })
        })
    }

    pub fn save_to(&self, store: &dyn SnapshotStore) -> Result<()> {
        store.save(&self.snapshot()?)
    }

    /// Rebuild a service from an exported snapshot
    pub fn from_snapshot(config: LedgerConfig, snapshot: LedgerSnapshot) -> Result<Self> {
        snapshot.check_version()?;
        let service = Self::new(config)?;

        service.space.restore(snapshot.subnets)?;
        for record in snapshot.records {
            if !service.space.contains(record.subnet_id) {
                return Err(Error::Storage(format!(
                    "record for {} references unknown {}",
                    record.address, record.subnet_id
                )));
            }
            service.ledger.restore_record(record)?;
        }
        for conflict in snapshot.conflicts {
            service.reconciler.restore_conflict(conflict);
        }
        service.ledger.audit().restore(snapshot.audit);

        tracing::info!(
            subnets = service.space.len(),
            audit_entries = service.ledger.audit().len(),
            taken_at = %snapshot.taken_at,
            "Ledger restored from snapshot"
        );
        Ok(service)
    }

    /// Load the latest snapshot from `store`, or start empty
    pub fn load_from(config: LedgerConfig, store: &dyn SnapshotStore) -> Result<Self> {
        match store.load()? {
            Some(snapshot) => Self::from_snapshot(config, snapshot),
            None => Self::new(config),
        }
    }

    // ==================== Statistics ====================

    pub fn get_stats(&self) -> Result<IpamStats> {
        let subnets = self.space.list()?;
        Ok(IpamStats {
            total_subnets: subnets.len(),
            root_subnets: self.space.roots()?.len(),
            active_records: subnets
                .iter()
                .map(|s| self.ledger.active_count(s.id) as usize)
                .sum(),
            open_conflicts: self.reconciler.conflicts().open_count(),
            audit_entries: self.ledger.audit().len(),
            events: self.events.stats(),
        })
    }
}
