//! Allocation engine
//!
//! Every operation resolves the governing subnet, holds its read gate and
//! then works on the address under its slot lock. Policy checks run in a
//! fixed order (range membership, hostname, gateway, capacity) so the first
//! failing check always determines the reported error.

use super::request::AllocationRequest;
use super::selector::lowest_free;
use crate::events::{
    AddressEvent, AddressExpiredEvent, CapacityThresholdEvent, EventPublisher, LedgerMessage,
};
use crate::ledger::{AddressEntry, AllocationLedger, RecordChange};
use crate::models::{AllocationRecord, ExpiryReason, StateKind, SubnetId, Transition};
use crate::space::{AddressSpace, SubnetView};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Utilization thresholds (percent) that raise capacity events by default
pub const DEFAULT_THRESHOLDS: [u8; 2] = [75, 90];

/// Candidates tried before giving up on a contended subnet
const MAX_BIND_ATTEMPTS: usize = 64;

/// Allocation engine over a shared address space and ledger
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    space: Arc<AddressSpace>,
    ledger: Arc<AllocationLedger>,
    events: EventPublisher,
    /// Ascending, deduplicated
    thresholds: Vec<u8>,
    /// Per subnet, how many of `thresholds` have been announced
    fired: Arc<DashMap<SubnetId, usize>>,
}

impl AllocationEngine {
    pub fn new(space: Arc<AddressSpace>, events: EventPublisher) -> Self {
        let ledger = space.ledger().clone();
        Self {
            space,
            ledger,
            events,
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
            fired: Arc::new(DashMap::new()),
        }
    }

    /// Replace the capacity thresholds
    pub fn with_thresholds(mut self, thresholds: &[u8]) -> Self {
        let mut thresholds: Vec<u8> = thresholds.iter().copied().filter(|t| *t <= 100).collect();
        thresholds.sort_unstable();
        thresholds.dedup();
        self.thresholds = thresholds;
        self.fired.clear();
        self
    }

    // ==================== Acquire ====================

    /// Allocate an address straight into ALLOCATED
    pub fn allocate(&self, request: AllocationRequest) -> Result<AllocationRecord> {
        self.acquire(request, true)
    }

    /// Hold an address in RESERVED until it is confirmed
    pub fn reserve(&self, request: AllocationRequest) -> Result<AllocationRecord> {
        self.acquire(request, false)
    }

    fn acquire(&self, request: AllocationRequest, confirm: bool) -> Result<AllocationRecord> {
        let (record, crossings) = self.space.with_subnet(request.subnet_id, |view| {
            self.check_policy(view, &request)?;

            let record = match request.address {
                Some(address) => self.ledger.with_address(address, |entry| {
                    if entry.current().is_some() {
                        return Err(Error::AlreadyAllocated(address));
                    }
                    Self::bind(entry, view, &request, confirm)
                })?,
                None => self.bind_lowest(view, &request, confirm)?,
            };

            Ok((record, self.settle_thresholds(view, true)))
        })?;

        tracing::info!(
            address = %record.address,
            subnet_id = %record.subnet_id,
            state = %record.kind(),
            hostname = ?record.identity.hostname,
            actor = %request.actor,
            "Address acquired"
        );

        self.events.publish(LedgerMessage::AddressAllocated(AddressEvent::from_record(
            &record,
            &request.actor,
        )));
        for event in crossings {
            tracing::warn!(
                subnet_id = %event.subnet_id,
                threshold = event.threshold,
                percent = event.percent,
                "Subnet utilization threshold crossed"
            );
            self.events
                .publish(LedgerMessage::CapacityThresholdCrossed(event));
        }

        Ok(record)
    }

    /// Range membership, then hostname, then gateway; capacity is checked
    /// when an address is bound
    fn check_policy(&self, view: &SubnetView, request: &AllocationRequest) -> Result<()> {
        if let Some(address) = request.address {
            if !view.in_range(address) {
                return Err(Error::AddressOutOfRange {
                    address,
                    subnet: view.id(),
                });
            }
        }

        if view.policy().require_hostname && !request.has_hostname() {
            return Err(Error::HostnameRequired(view.id()));
        }

        if let Some(address) = request.address {
            if view.gateway() == Some(address) {
                return Err(Error::GatewayConflict(address));
            }
        }

        Ok(())
    }

    fn bind(
        entry: &mut AddressEntry<'_>,
        view: &SubnetView,
        request: &AllocationRequest,
        confirm: bool,
    ) -> Result<AllocationRecord> {
        let change = request.change(Utc::now(), view.policy().lease());
        let record = entry.apply(view.id(), Transition::Reserve, change, &request.actor)?;
        if confirm {
            entry.apply(view.id(), Transition::Confirm, RecordChange::new(), &request.actor)
        } else {
            Ok(record)
        }
    }

    /// Bind the lowest free address, retrying when a concurrent writer takes
    /// the candidate first
    ///
    /// Gives up with [`Error::Busy`] after [`MAX_BIND_ATTEMPTS`] lost races.
    fn bind_lowest(
        &self,
        view: &SubnetView,
        request: &AllocationRequest,
        confirm: bool,
    ) -> Result<AllocationRecord> {
        for _ in 0..MAX_BIND_ATTEMPTS {
            let candidate = self
                .ledger
                .with_active(view.id(), |active| lowest_free(view, active, 1))
                .into_iter()
                .next()
                .ok_or(Error::NoCapacity(view.id()))?;

            let bound = self.ledger.with_address(candidate, |entry| {
                if entry.current().is_some() {
                    return Ok(None);
                }
                Self::bind(entry, view, request, confirm).map(Some)
            })?;

            match bound {
                Some(record) => return Ok(record),
                None => {
                    tracing::debug!(address = %candidate, "Candidate taken concurrently, retrying");
                }
            }
        }

        tracing::warn!(subnet_id = %view.id(), attempts = MAX_BIND_ATTEMPTS, "Allocation contended");
        Err(Error::Busy(format!(
            "subnet {} lost {} candidates to concurrent writers",
            view.id(),
            MAX_BIND_ATTEMPTS
        )))
    }

    /// Bring the announced-threshold mark of a subnet in line with its
    /// current utilization
    ///
    /// Utilization is read while the subnet's entry in `fired` is locked, so
    /// concurrent callers observe a serialized sequence of readings. Falling
    /// below a threshold re-arms it. Rising past one yields its event once,
    /// and only when `announce` is set; other callers leave the rise for the
    /// allocation that caused it.
    fn settle_thresholds(&self, view: &SubnetView, announce: bool) -> Vec<CapacityThresholdEvent> {
        if self.thresholds.is_empty() {
            return Vec::new();
        }

        let mut fired = self.fired.entry(view.id()).or_insert(0);
        let total = view.allocatable_count();
        let free = self.space.free_in_view(view);
        let percent = percent_used(total, free);
        let level = self
            .thresholds
            .iter()
            .take_while(|t| percent >= f64::from(**t))
            .count();

        if level < *fired {
            tracing::debug!(subnet_id = %view.id(), percent, "Capacity thresholds re-armed");
            *fired = level;
            return Vec::new();
        }
        if !announce {
            return Vec::new();
        }

        let events = self.thresholds[*fired..level]
            .iter()
            .map(|t| CapacityThresholdEvent {
                subnet_id: view.id(),
                cidr: view.cidr().to_string(),
                threshold: *t,
                percent,
                free,
                crossed_at: Utc::now(),
            })
            .collect();
        *fired = level;
        events
    }

    // ==================== Address Operations ====================

    /// Move a RESERVED address to ALLOCATED
    pub fn confirm(&self, address: IpAddr, actor: &str) -> Result<AllocationRecord> {
        let record = self.space.with_governing(address, |view| {
            self.ledger.with_address(address, |entry| {
                if entry.current().is_none() {
                    return Err(Error::NotAllocated(address));
                }
                entry.apply(view.id(), Transition::Confirm, RecordChange::new(), actor)
            })
        })?;

        tracing::info!(address = %address, subnet_id = %record.subnet_id, actor = %actor, "Address confirmed");
        self.events.publish(LedgerMessage::AddressAllocated(AddressEvent::from_record(
            &record, actor,
        )));
        Ok(record)
    }

    /// Release a RESERVED or ALLOCATED address
    pub fn release(&self, address: IpAddr, actor: &str) -> Result<AllocationRecord> {
        let record = self.space.with_governing(address, |view| {
            let record = self.ledger.with_address(address, |entry| {
                if entry.current().is_none() {
                    return Err(Error::NotAllocated(address));
                }
                entry.apply(view.id(), Transition::Release, RecordChange::new(), actor)
            })?;
            self.settle_thresholds(view, false);
            Ok(record)
        })?;

        tracing::info!(address = %address, subnet_id = %record.subnet_id, actor = %actor, "Address released");
        self.events.publish(LedgerMessage::AddressReleased(AddressEvent::from_record(
            &record, actor,
        )));
        Ok(record)
    }

    /// Extend the lease of a RESERVED or ALLOCATED address
    ///
    /// Without an explicit `lease` the subnet's default lease applies.
    pub fn renew(&self, address: IpAddr, lease: Option<Duration>, actor: &str) -> Result<AllocationRecord> {
        let record = self.space.with_governing(address, |view| {
            let lease = lease.or_else(|| view.policy().lease()).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "no lease given and subnet {} has no default lease",
                    view.id()
                ))
            })?;
            self.ledger.with_address(address, |entry| {
                if entry.current().is_none() {
                    return Err(Error::NotAllocated(address));
                }
                let change = RecordChange::new().expires_at(Utc::now().checked_add_signed(lease));
                entry.apply(view.id(), Transition::Renew, change, actor)
            })
        })?;

        tracing::debug!(address = %address, expires_at = ?record.expires_at, "Lease renewed");
        Ok(record)
    }

    /// Up to `count` free addresses in ascending order
    ///
    /// Returns fewer when the subnet runs out; never an error for that.
    pub fn find_available(&self, subnet_id: SubnetId, count: usize) -> Result<Vec<IpAddr>> {
        self.space.with_subnet(subnet_id, |view| {
            Ok(self
                .ledger
                .with_active(view.id(), |active| lowest_free(view, active, count)))
        })
    }

    // ==================== Expiry ====================

    /// Expire every RESERVED or ALLOCATED record whose lease elapsed at `now`
    ///
    /// Busy addresses are left for the next sweep.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<AllocationRecord> {
        let mut expired = Vec::new();

        for (address, _) in self.ledger.due_for_expiry(now) {
            let outcome = self.space.with_governing(address, |view| {
                let expired = self.ledger.with_address(address, |entry| {
                    let due = entry
                        .current()
                        .map(|r| r.is_due(now) && r.kind() != StateKind::Conflicted)
                        .unwrap_or(false);
                    if !due {
                        return Ok(None);
                    }
                    entry
                        .apply(
                            view.id(),
                            Transition::Expire(ExpiryReason::LeaseElapsed),
                            RecordChange::new(),
                            "expiry-sweeper",
                        )
                        .map(Some)
                })?;
                if expired.is_some() {
                    self.settle_thresholds(view, false);
                }
                Ok(expired)
            });

            match outcome {
                Ok(Some(record)) => {
                    self.events
                        .publish(LedgerMessage::AddressExpired(AddressExpiredEvent {
                            address,
                            subnet_id: record.subnet_id,
                            record_id: record.id,
                            reason: ExpiryReason::LeaseElapsed,
                            expired_at: record.updated_at,
                        }));
                    expired.push(record);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "Skipping expiry");
                }
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired elapsed leases");
        }
        expired
    }
}

fn percent_used(total: u128, free: u128) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (total.saturating_sub(free)) as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Channel;
    use crate::models::{AllocationPolicy, SubnetSpec};
    use ipnet::IpNet;
    use std::str::FromStr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup(cidr: &str, policy: AllocationPolicy) -> (AllocationEngine, SubnetId) {
        let ledger = Arc::new(AllocationLedger::new(std::time::Duration::from_millis(100)));
        let space = Arc::new(AddressSpace::new(ledger));
        let id = space
            .insert_subnet(
                IpNet::from_str(cidr).unwrap(),
                None,
                SubnetSpec::new("test").with_policy(policy),
            )
            .unwrap();
        (AllocationEngine::new(space, EventPublisher::new()), id)
    }

    #[test]
    fn test_lowest_first_with_gateway() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new().reserve_gateway());

        let got: Vec<IpAddr> = (0..3)
            .map(|_| engine.allocate(AllocationRequest::new(id)).unwrap().address)
            .collect();
        assert_eq!(got, vec![ip("10.0.0.2"), ip("10.0.0.3"), ip("10.0.0.4")]);
    }

    #[test]
    fn test_policy_check_order() {
        let policy = AllocationPolicy::new()
            .with_range(ip("10.0.0.10"), ip("10.0.0.20"))
            .with_gateway(ip("10.0.0.10"))
            .require_hostname();
        let (engine, id) = setup("10.0.0.0/24", policy);

        // Out of range wins over missing hostname
        let err = engine
            .allocate(AllocationRequest::new(id).with_address(ip("10.0.0.50")))
            .unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange { .. }));

        // Missing hostname wins over gateway conflict
        let err = engine
            .allocate(AllocationRequest::new(id).with_address(ip("10.0.0.10")))
            .unwrap_err();
        assert!(matches!(err, Error::HostnameRequired(_)));

        let err = engine
            .allocate(
                AllocationRequest::new(id)
                    .with_address(ip("10.0.0.10"))
                    .with_hostname("gw"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::GatewayConflict(_)));

        let record = engine
            .allocate(AllocationRequest::new(id).with_hostname("web-01"))
            .unwrap();
        assert_eq!(record.address, ip("10.0.0.11"));

        let err = engine
            .allocate(
                AllocationRequest::new(id)
                    .with_address(ip("10.0.0.11"))
                    .with_hostname("web-02"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAllocated(_)));
    }

    #[test]
    fn test_exhaustion_leaves_state_untouched() {
        let (engine, id) = setup("10.0.0.0/30", AllocationPolicy::new());
        engine.allocate(AllocationRequest::new(id)).unwrap();
        engine.allocate(AllocationRequest::new(id)).unwrap();

        let audit_before = engine.ledger.audit().len();
        let err = engine.allocate(AllocationRequest::new(id)).unwrap_err();
        assert!(matches!(err, Error::NoCapacity(_)));
        assert_eq!(engine.ledger.audit().len(), audit_before);
        assert_eq!(engine.ledger.active_count(id), 2);
    }

    #[test]
    fn test_reserve_confirm_release() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new());
        let reserved = engine.reserve(AllocationRequest::new(id)).unwrap();
        assert_eq!(reserved.kind(), StateKind::Reserved);

        let confirmed = engine.confirm(reserved.address, "ops").unwrap();
        assert_eq!(confirmed.kind(), StateKind::Allocated);

        assert!(matches!(
            engine.confirm(reserved.address, "ops"),
            Err(Error::InvalidTransition { .. })
        ));

        engine.release(reserved.address, "ops").unwrap();
        assert!(matches!(
            engine.release(reserved.address, "ops"),
            Err(Error::NotAllocated(_))
        ));
        assert_eq!(
            engine.find_available(id, 1).unwrap(),
            vec![reserved.address]
        );
    }

    #[test]
    fn test_find_available_partial() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new());
        let free = engine.find_available(id, 10).unwrap();
        assert_eq!(free.len(), 6);
        assert_eq!(free[0], ip("10.0.0.1"));
    }

    #[test]
    fn test_lease_sweep() {
        let policy = AllocationPolicy::new().with_lease(Duration::minutes(30));
        let (engine, id) = setup("10.0.0.0/29", policy);

        let leased = engine.allocate(AllocationRequest::new(id)).unwrap();
        let pinned = engine
            .allocate(AllocationRequest::new(id).static_allocation())
            .unwrap();
        assert!(leased.expires_at.is_some());
        assert!(pinned.expires_at.is_none());

        assert!(engine.sweep_expired(Utc::now()).is_empty());

        let later = Utc::now() + Duration::hours(1);
        let expired = engine.sweep_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].address, leased.address);
        assert_eq!(expired[0].kind(), StateKind::Expired);
        assert_eq!(engine.ledger.active_count(id), 1);

        // Expired capacity is free again
        assert_eq!(
            engine.find_available(id, 1).unwrap(),
            vec![leased.address]
        );
    }

    #[test]
    fn test_renew_extends_lease() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new());
        let record = engine.allocate(AllocationRequest::new(id)).unwrap();

        assert!(matches!(
            engine.renew(record.address, None, "ops"),
            Err(Error::InvalidArgument(_))
        ));

        let renewed = engine
            .renew(record.address, Some(Duration::hours(2)), "ops")
            .unwrap();
        assert_eq!(renewed.kind(), StateKind::Allocated);
        assert!(renewed.expires_at.unwrap() > Utc::now() + Duration::minutes(119));
    }

    #[test]
    fn test_threshold_crossed_once() {
        // Four allocatable addresses: 25, 50, 75, 100 percent
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new().with_range(ip("10.0.0.1"), ip("10.0.0.4")));
        let mut rx = engine.events.subscribe(Channel::Capacity);

        for _ in 0..4 {
            engine.allocate(AllocationRequest::new(id)).unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(LedgerMessage::CapacityThresholdCrossed(event)) = rx.try_recv() {
            seen.push(event.threshold);
        }
        assert_eq!(seen, vec![75, 90]);
    }

    #[test]
    fn test_threshold_rearms_after_release() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new().with_range(ip("10.0.0.1"), ip("10.0.0.4")));
        let mut rx = engine.events.subscribe(Channel::Capacity);

        let records: Vec<AllocationRecord> = (0..3)
            .map(|_| engine.allocate(AllocationRequest::new(id)).unwrap())
            .collect();
        // Back to 50 percent, then up to 75 again
        engine.release(records[2].address, "ops").unwrap();
        engine.release(records[1].address, "ops").unwrap();
        engine.allocate(AllocationRequest::new(id)).unwrap();
        engine.allocate(AllocationRequest::new(id)).unwrap();

        let mut seen = Vec::new();
        while let Ok(LedgerMessage::CapacityThresholdCrossed(event)) = rx.try_recv() {
            seen.push(event.threshold);
        }
        assert_eq!(seen, vec![75, 75]);
    }

    #[test]
    fn test_contended_bind_gives_up() {
        let (engine, id) = setup("10.0.0.0/29", AllocationPolicy::new());

        // Held under another subnet's index, so the lowest candidate is
        // always taken by the time its slot is locked
        engine
            .ledger
            .transition(ip("10.0.0.1"), SubnetId::new(999), Transition::Reserve, RecordChange::new(), "other")
            .unwrap();

        let err = engine.allocate(AllocationRequest::new(id)).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.ledger.active_count(id), 0);
    }

    #[test]
    fn test_percent_used() {
        assert_eq!(percent_used(4, 1), 75.0);
        assert_eq!(percent_used(0, 0), 100.0);
    }
}
