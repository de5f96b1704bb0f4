//! Reconciliation of observed host facts against the ledger
//!
//! A batch of [`ObservedHostFact`]s is diffed against the ledger for one
//! subnet and everything below it:
//!
//! | Ledger state | Observed | Outcome |
//! |--------------|----------|---------|
//! | FREE | yes | record synthesized into CONFLICTED, or adopted on trusted subnets |
//! | RESERVED / ALLOCATED | identity matches | last-seen updated |
//! | RESERVED / ALLOCATED | identity differs | CONFLICTED |
//! | RESERVED / ALLOCATED | absent past the grace period | EXPIRED (stale) |
//! | CONFLICTED | yes | open conflict updated |
//!
//! Running the same batch twice against an unchanged ledger yields the same
//! open conflicts: the open conflict per address is the dedup key.

mod store;

pub use store::ConflictStore;

use crate::address;
use crate::events::{
    AddressEvent, AddressExpiredEvent, ConflictDetectedEvent, ConflictResolvedEvent,
    EventPublisher, LedgerMessage,
};
use crate::ledger::{AddressEntry, AllocationLedger, RecordChange};
use crate::models::{
    AllocationRecord, AllocationState, AllocationType, AutoAction, ConflictFilter, ConflictKind,
    ConflictRecord, ConflictStatus, ExpiryReason, ObservedHostFact, ResolutionAction,
    ResolveTarget, StateKind, SubnetId, Transition,
};
use crate::space::{AddressSpace, SubnetView};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Actor recorded for transitions made by reconciliation
pub const RECONCILER_ACTOR: &str = "reconciler";

/// Reconciliation settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long a recorded address may go unobserved before it is reclaimed
    pub stale_grace: Duration,
    /// Drop facts whose TTL elapsed before the reconciliation instant
    pub discard_expired_facts: bool,
}

impl ReconcilerConfig {
    /// The grace period has no default and must be chosen explicitly
    pub fn new(stale_grace: Duration) -> Self {
        Self {
            stale_grace,
            discard_expired_facts: true,
        }
    }

    pub fn keep_expired_facts(mut self) -> Self {
        self.discard_expired_facts = false;
        self
    }
}

/// Per-address result inside a batch
enum Outcome {
    /// A new conflict, possibly auto-resolved on detection
    Detected(ConflictRecord, Option<AutoAction>),
    /// An open conflict received another observation
    Updated(ConflictRecord),
    /// Observation agreed with the ledger
    Confirmed,
    Skipped,
}

/// Diffs observed facts against the ledger and tracks conflicts
#[derive(Debug)]
pub struct ReconciliationEngine {
    space: Arc<AddressSpace>,
    ledger: Arc<AllocationLedger>,
    conflicts: ConflictStore,
    events: EventPublisher,
    config: ReconcilerConfig,
}

impl ReconciliationEngine {
    pub fn new(space: Arc<AddressSpace>, events: EventPublisher, config: ReconcilerConfig) -> Self {
        let ledger = space.ledger().clone();
        Self {
            space,
            ledger,
            conflicts: ConflictStore::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    /// Reconcile a batch against the ledger at the current instant
    pub fn reconcile(
        &self,
        subnet_id: SubnetId,
        facts: Vec<ObservedHostFact>,
    ) -> Result<Vec<ConflictRecord>> {
        self.reconcile_at(subnet_id, facts, Utc::now())
    }

    /// Reconcile a batch as of `now`
    ///
    /// Returns every conflict the batch created or touched, ordered by
    /// address.
    pub fn reconcile_at(
        &self,
        subnet_id: SubnetId,
        facts: Vec<ObservedHostFact>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConflictRecord>> {
        let scope = self.space.get(subnet_id)?.cidr;
        let batch = self.partition(&scope, facts, now);

        let mut touched = Vec::new();
        let mut detected = 0usize;

        for (addr, fact) in &batch {
            let outcome = self.space.with_governing(*addr, |view| {
                if !address::is_usable(view.cidr(), *addr) || view.gateway() == Some(*addr) {
                    return Ok(Outcome::Skipped);
                }
                self.ledger
                    .with_address(*addr, |entry| self.apply_fact(entry, view, fact, now))
            });

            match outcome {
                Ok(Outcome::Detected(conflict, auto_action)) => {
                    detected += 1;
                    self.events.publish(LedgerMessage::ConflictDetected(
                        ConflictDetectedEvent::from_conflict(&conflict, auto_action),
                    ));
                    touched.push(conflict);
                }
                Ok(Outcome::Updated(conflict)) => touched.push(conflict),
                Ok(Outcome::Confirmed) | Ok(Outcome::Skipped) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(address = %addr, error = %e, "Address busy, left for next batch");
                }
                Err(e) => return Err(e),
            }
        }

        let observed: BTreeSet<IpAddr> = batch.keys().copied().collect();
        let reclaimed = self.reclaim_stale(subnet_id, &observed, now)?;
        detected += reclaimed.len();
        touched.extend(reclaimed);

        touched.sort_by(|a, b| a.address.cmp(&b.address));

        tracing::info!(
            subnet_id = %subnet_id,
            facts = batch.len(),
            conflicts = touched.len(),
            new_conflicts = detected,
            "Reconciliation complete"
        );

        Ok(touched)
    }

    /// Latest usable fact per address inside `scope`
    fn partition(
        &self,
        scope: &ipnet::IpNet,
        facts: Vec<ObservedHostFact>,
        now: DateTime<Utc>,
    ) -> BTreeMap<IpAddr, ObservedHostFact> {
        let mut batch: BTreeMap<IpAddr, ObservedHostFact> = BTreeMap::new();

        for fact in facts {
            if !scope.contains(&fact.address) {
                tracing::warn!(address = %fact.address, scope = %scope, "Fact outside subnet, skipped");
                continue;
            }
            if self.config.discard_expired_facts && fact.is_expired(now) {
                tracing::debug!(address = %fact.address, "Fact past its TTL, discarded");
                continue;
            }
            match batch.get(&fact.address) {
                Some(existing) if existing.observed_at > fact.observed_at => {}
                _ => {
                    batch.insert(fact.address, fact);
                }
            }
        }

        batch
    }

    fn apply_fact(
        &self,
        entry: &mut AddressEntry<'_>,
        view: &SubnetView,
        fact: &ObservedHostFact,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let seen = RecordChange::new().seen_at(fact.observed_at);

        let Some(current) = entry.current().cloned() else {
            let mut conflict =
                ConflictRecord::new(fact.address, view.id(), ConflictKind::UnauthorizedHost, now)
                    .with_observation(fact.clone());
            let synthesized = RecordChange::new()
                .identity(fact.identity.clone())
                .source(fact.method.source())
                .seen_at(fact.observed_at);

            entry.apply(
                view.id(),
                Transition::Flag {
                    conflict_id: conflict.id,
                },
                synthesized,
                RECONCILER_ACTOR,
            )?;

            let auto_action = if view.policy().trust_discovery {
                entry.apply(
                    view.id(),
                    Transition::Resolve(ResolveTarget::Allocated),
                    RecordChange::new(),
                    RECONCILER_ACTOR,
                )?;
                conflict.status = ConflictStatus::AutoResolved {
                    action: AutoAction::Adopted,
                    at: now,
                };
                tracing::info!(address = %fact.address, subnet_id = %view.id(), "Unknown host adopted");
                Some(AutoAction::Adopted)
            } else {
                tracing::warn!(
                    address = %fact.address,
                    subnet_id = %view.id(),
                    hostname = ?fact.identity.hostname,
                    mac = ?fact.identity.mac,
                    "Unauthorized host observed"
                );
                None
            };

            self.conflicts.insert(conflict.clone());
            return Ok(Outcome::Detected(conflict, auto_action));
        };

        match current.state {
            AllocationState::Conflicted { conflict_id } => {
                entry.apply(current.subnet_id, Transition::Touch, seen, RECONCILER_ACTOR)?;
                match self.conflicts.observe(conflict_id, fact.clone()) {
                    Some(conflict) => Ok(Outcome::Updated(conflict)),
                    None => {
                        tracing::warn!(
                            address = %fact.address,
                            conflict_id = %conflict_id,
                            "Conflicted record without a stored conflict"
                        );
                        Ok(Outcome::Skipped)
                    }
                }
            }
            AllocationState::Reserved | AllocationState::Allocated => {
                if current.identity.matches(&fact.identity) {
                    entry.apply(current.subnet_id, Transition::Touch, seen, RECONCILER_ACTOR)?;
                    return Ok(Outcome::Confirmed);
                }

                let conflict = ConflictRecord::new(
                    fact.address,
                    current.subnet_id,
                    ConflictKind::IdentityMismatch,
                    now,
                )
                .with_expected(current.clone())
                .with_observation(fact.clone());

                entry.apply(
                    current.subnet_id,
                    Transition::Flag {
                        conflict_id: conflict.id,
                    },
                    seen,
                    RECONCILER_ACTOR,
                )?;

                tracing::warn!(
                    address = %fact.address,
                    recorded_hostname = ?current.identity.hostname,
                    observed_hostname = ?fact.identity.hostname,
                    recorded_mac = ?current.identity.mac,
                    observed_mac = ?fact.identity.mac,
                    "Identity mismatch"
                );

                self.conflicts.insert(conflict.clone());
                Ok(Outcome::Detected(conflict, None))
            }
            AllocationState::Released | AllocationState::Expired { .. } => {
                Err(Error::Internal(format!(
                    "terminal record held as current for {}",
                    fact.address
                )))
            }
        }
    }

    /// Expire dynamic RESERVED or ALLOCATED records under `subnet_id` that
    /// were not observed in this batch and have no evidence newer than the
    /// grace period
    fn reclaim_stale(
        &self,
        subnet_id: SubnetId,
        observed: &BTreeSet<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConflictRecord>> {
        // A grace period reaching before the representable range never elapses
        let Some(cutoff) = now.checked_sub_signed(self.config.stale_grace) else {
            return Ok(Vec::new());
        };
        let is_stale = |record: &AllocationRecord| {
            matches!(record.kind(), StateKind::Reserved | StateKind::Allocated)
                && record.allocation_type == AllocationType::Dynamic
                && !observed.contains(&record.address)
                && record.last_evidence() < cutoff
        };

        let mut candidates = Vec::new();
        for id in self.space.subtree(subnet_id)? {
            candidates.extend(
                self.ledger
                    .records_in(id)?
                    .into_iter()
                    .filter(|r| is_stale(r))
                    .map(|r| r.address),
            );
        }

        let mut reclaimed = Vec::new();
        for addr in candidates {
            let outcome = self.space.with_governing(addr, |_view| {
                self.ledger.with_address(addr, |entry| {
                    let Some(record) = entry.current().cloned() else {
                        return Ok(None);
                    };
                    if !is_stale(&record) {
                        return Ok(None);
                    }

                    let expired = entry.apply(
                        record.subnet_id,
                        Transition::Expire(ExpiryReason::Stale),
                        RecordChange::new(),
                        RECONCILER_ACTOR,
                    )?;

                    let mut conflict = ConflictRecord::new(
                        addr,
                        record.subnet_id,
                        ConflictKind::StaleAllocation,
                        now,
                    )
                    .with_expected(record);
                    conflict.status = ConflictStatus::AutoResolved {
                        action: AutoAction::Reclaimed,
                        at: now,
                    };
                    self.conflicts.insert(conflict.clone());

                    Ok(Some((conflict, expired)))
                })
            });

            match outcome {
                Ok(Some((conflict, expired))) => {
                    tracing::info!(
                        address = %addr,
                        subnet_id = %expired.subnet_id,
                        last_seen = ?expired.last_seen,
                        "Stale allocation reclaimed"
                    );
                    self.events.publish(LedgerMessage::ConflictDetected(
                        ConflictDetectedEvent::from_conflict(&conflict, Some(AutoAction::Reclaimed)),
                    ));
                    self.events
                        .publish(LedgerMessage::AddressExpired(AddressExpiredEvent {
                            address: addr,
                            subnet_id: expired.subnet_id,
                            record_id: expired.id,
                            reason: ExpiryReason::Stale,
                            expired_at: expired.updated_at,
                        }));
                    reclaimed.push(conflict);
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(address = %addr, error = %e, "Address busy, stale check deferred");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(reclaimed)
    }

    // ==================== Triage ====================

    pub fn list_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictRecord> {
        self.conflicts.list(filter)
    }

    pub fn get_conflict(&self, id: Uuid) -> Result<ConflictRecord> {
        self.conflicts.get(id).ok_or(Error::ConflictNotFound(id))
    }

    /// Resolve an open conflict by operator decision
    pub fn resolve_conflict(
        &self,
        id: Uuid,
        action: ResolutionAction,
        actor: &str,
    ) -> Result<ConflictRecord> {
        let conflict = self.get_conflict(id)?;
        if !conflict.is_open() {
            return Err(Error::ConflictAlreadyResolved(id));
        }
        let addr = conflict.address;

        let (resolved, record) = self.space.with_governing(addr, |_view| {
            self.ledger.with_address(addr, |entry| {
                // Re-check under the slot lock; a concurrent resolve may have won
                let current = self.get_conflict(id)?;
                if !current.is_open() {
                    return Err(Error::ConflictAlreadyResolved(id));
                }
                let subnet_id = match entry.current() {
                    Some(record)
                        if record.state == (AllocationState::Conflicted { conflict_id: id }) =>
                    {
                        record.subnet_id
                    }
                    _ => {
                        return Err(Error::InvalidTransition {
                            address: addr,
                            from: entry.kind(),
                            event: "resolve",
                        })
                    }
                };

                let (target, change) = match action {
                    ResolutionAction::KeepRecorded => (ResolveTarget::Allocated, RecordChange::new()),
                    ResolutionAction::AdoptObserved => {
                        let change = match &current.observed {
                            Some(fact) => RecordChange::new()
                                .identity(fact.identity.clone())
                                .seen_at(fact.observed_at),
                            None => RecordChange::new(),
                        };
                        (ResolveTarget::Allocated, change)
                    }
                    ResolutionAction::Release => (ResolveTarget::Released, RecordChange::new()),
                };

                let record = entry.apply(subnet_id, Transition::Resolve(target), change, actor)?;
                let resolved = self.conflicts.close(
                    id,
                    ConflictStatus::Resolved {
                        action,
                        actor: actor.to_string(),
                        at: Utc::now(),
                    },
                )?;
                Ok((resolved, record))
            })
        })?;

        tracing::info!(
            conflict_id = %id,
            address = %addr,
            action = ?action,
            actor = %actor,
            "Conflict resolved"
        );

        self.events
            .publish(LedgerMessage::ConflictResolved(ConflictResolvedEvent {
                conflict_id: id,
                address: addr,
                subnet_id: record.subnet_id,
                action,
                actor: actor.to_string(),
                resolved_at: Utc::now(),
            }));
        if record.kind() == StateKind::Released {
            self.events
                .publish(LedgerMessage::AddressReleased(AddressEvent::from_record(
                    &record, actor,
                )));
        }

        Ok(resolved)
    }

    /// Load a persisted conflict
    pub(crate) fn restore_conflict(&self, record: ConflictRecord) {
        self.conflicts.insert(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{AllocationEngine, AllocationRequest};
    use crate::ledger::AllocationLedger;
    use crate::models::{AllocationPolicy, ObservationMethod, SubnetSpec};
    use ipnet::IpNet;
    use std::str::FromStr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    struct Fixture {
        engine: AllocationEngine,
        reconciler: ReconciliationEngine,
        ledger: Arc<AllocationLedger>,
        subnet: SubnetId,
    }

    fn fixture(policy: AllocationPolicy) -> Fixture {
        let ledger = Arc::new(AllocationLedger::new(std::time::Duration::from_millis(100)));
        let space = Arc::new(AddressSpace::new(ledger.clone()));
        let subnet = space
            .insert_subnet(
                IpNet::from_str("10.0.0.0/24").unwrap(),
                None,
                SubnetSpec::new("lan").with_policy(policy),
            )
            .unwrap();
        let events = EventPublisher::new();
        Fixture {
            engine: AllocationEngine::new(space.clone(), events.clone()),
            reconciler: ReconciliationEngine::new(
                space,
                events,
                ReconcilerConfig::new(Duration::hours(24)),
            ),
            ledger,
            subnet,
        }
    }

    fn arp(addr: &str) -> ObservedHostFact {
        ObservedHostFact::new(ip(addr), ObservationMethod::Arp)
    }

    #[test]
    fn test_unknown_host_synthesizes_conflict() {
        let fx = fixture(AllocationPolicy::new());
        let result = fx
            .reconciler
            .reconcile(fx.subnet, vec![arp("10.0.0.5").with_hostname("mystery")])
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].kind, ConflictKind::UnauthorizedHost);
        assert!(result[0].is_open());

        let status = fx.ledger.get(ip("10.0.0.5")).unwrap();
        assert_eq!(status.kind(), StateKind::Conflicted);
        let record = status.record().unwrap();
        assert_eq!(record.identity.hostname.as_deref(), Some("mystery"));
        assert_eq!(record.source, crate::models::AllocationSource::Discovery);
    }

    #[test]
    fn test_trusted_subnet_adopts() {
        let fx = fixture(AllocationPolicy::new().trust_discovery());
        let result = fx
            .reconciler
            .reconcile(fx.subnet, vec![arp("10.0.0.5")])
            .unwrap();

        assert_eq!(result.len(), 1);
        assert!(matches!(
            result[0].status,
            ConflictStatus::AutoResolved {
                action: AutoAction::Adopted,
                ..
            }
        ));
        assert_eq!(
            fx.ledger.get(ip("10.0.0.5")).unwrap().kind(),
            StateKind::Allocated
        );
        assert_eq!(fx.reconciler.conflicts().open_count(), 0);
    }

    #[test]
    fn test_matching_identity_only_touches() {
        let fx = fixture(AllocationPolicy::new());
        let record = fx
            .engine
            .allocate(
                AllocationRequest::new(fx.subnet)
                    .with_hostname("web-01")
                    .with_mac("aa:bb:cc:00:11:22"),
            )
            .unwrap();
        let audit_len = fx.ledger.audit().len();

        let seen_at = Utc::now();
        let result = fx
            .reconciler
            .reconcile(
                fx.subnet,
                vec![ObservedHostFact::new(record.address, ObservationMethod::Snmp)
                    .with_mac("AA-BB-CC-00-11-22")
                    .observed_at(seen_at)],
            )
            .unwrap();

        assert!(result.is_empty());
        let status = fx.ledger.get(record.address).unwrap();
        assert_eq!(status.kind(), StateKind::Allocated);
        assert_eq!(status.record().unwrap().last_seen, Some(seen_at));
        assert_eq!(fx.ledger.audit().len(), audit_len);
    }

    #[test]
    fn test_identity_mismatch() {
        let fx = fixture(AllocationPolicy::new());
        let record = fx
            .engine
            .allocate(AllocationRequest::new(fx.subnet).with_hostname("web-01"))
            .unwrap();

        let result = fx
            .reconciler
            .reconcile(
                fx.subnet,
                vec![arp(&record.address.to_string()).with_hostname("intruder")],
            )
            .unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].kind, ConflictKind::IdentityMismatch);
        assert_eq!(
            result[0]
                .expected
                .as_ref()
                .unwrap()
                .identity
                .hostname
                .as_deref(),
            Some("web-01")
        );
        assert_eq!(
            fx.ledger.get(record.address).unwrap().kind(),
            StateKind::Conflicted
        );
    }

    #[test]
    fn test_idempotent() {
        let fx = fixture(AllocationPolicy::new());
        let facts = vec![arp("10.0.0.5"), arp("10.0.0.9"), arp("10.0.0.5")];

        let first = fx.reconciler.reconcile(fx.subnet, facts.clone()).unwrap();
        let second = fx.reconciler.reconcile(fx.subnet, facts).unwrap();

        let ids = |v: &[ConflictRecord]| v.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(fx.reconciler.conflicts().len(), 2);
        assert_eq!(
            fx.reconciler.list_conflicts(&ConflictFilter::open()).len(),
            2
        );
        assert_eq!(second[0].observation_count, 2);
    }

    #[test]
    fn test_expired_and_foreign_facts_ignored() {
        let fx = fixture(AllocationPolicy::new());
        let old = arp("10.0.0.5")
            .observed_at(Utc::now() - Duration::hours(2))
            .with_ttl(Duration::minutes(10));
        let foreign = arp("192.168.1.1");
        let network = arp("10.0.0.0");

        let result = fx
            .reconciler
            .reconcile(fx.subnet, vec![old, foreign, network])
            .unwrap();
        assert!(result.is_empty());
        assert!(fx.ledger.get(ip("10.0.0.5")).unwrap().is_free());
    }

    #[test]
    fn test_stale_reclaimed_after_grace() {
        let fx = fixture(AllocationPolicy::new());
        let dynamic = fx
            .engine
            .allocate(AllocationRequest::new(fx.subnet))
            .unwrap();
        let pinned = fx
            .engine
            .allocate(AllocationRequest::new(fx.subnet).static_allocation())
            .unwrap();

        // Inside the grace period nothing happens
        let soon = Utc::now() + Duration::hours(1);
        assert!(fx
            .reconciler
            .reconcile_at(fx.subnet, Vec::new(), soon)
            .unwrap()
            .is_empty());

        let later = Utc::now() + Duration::hours(25);
        let result = fx
            .reconciler
            .reconcile_at(fx.subnet, Vec::new(), later)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].kind, ConflictKind::StaleAllocation);
        assert_eq!(result[0].address, dynamic.address);

        assert_eq!(
            fx.ledger.get(dynamic.address).unwrap().kind(),
            StateKind::Free
        );
        assert_eq!(
            fx.ledger.get(pinned.address).unwrap().kind(),
            StateKind::Allocated
        );
        let history = fx.ledger.history(dynamic.address).unwrap();
        assert_eq!(
            history[0].state,
            AllocationState::Expired {
                reason: ExpiryReason::Stale
            }
        );
    }

    #[test]
    fn test_observed_record_not_stale() {
        let fx = fixture(AllocationPolicy::new());
        let record = fx
            .engine
            .allocate(AllocationRequest::new(fx.subnet))
            .unwrap();

        let later = Utc::now() + Duration::hours(25);
        let result = fx
            .reconciler
            .reconcile_at(
                fx.subnet,
                vec![arp(&record.address.to_string()).observed_at(later)],
                later,
            )
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(
            fx.ledger.get(record.address).unwrap().kind(),
            StateKind::Allocated
        );
    }

    #[test]
    fn test_resolve_actions() {
        let fx = fixture(AllocationPolicy::new());
        let record = fx
            .engine
            .allocate(AllocationRequest::new(fx.subnet).with_hostname("web-01"))
            .unwrap();
        let conflicts = fx
            .reconciler
            .reconcile(
                fx.subnet,
                vec![
                    arp(&record.address.to_string()).with_hostname("web-01-new"),
                    arp("10.0.0.77"),
                ],
            )
            .unwrap();
        assert_eq!(conflicts.len(), 2);

        let mismatch = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::IdentityMismatch)
            .unwrap();
        let resolved = fx
            .reconciler
            .resolve_conflict(mismatch.id, ResolutionAction::AdoptObserved, "ops")
            .unwrap();
        assert!(matches!(resolved.status, ConflictStatus::Resolved { .. }));
        let status = fx.ledger.get(record.address).unwrap();
        assert_eq!(status.kind(), StateKind::Allocated);
        assert_eq!(
            status.record().unwrap().identity.hostname.as_deref(),
            Some("web-01-new")
        );

        assert!(matches!(
            fx.reconciler
                .resolve_conflict(mismatch.id, ResolutionAction::Release, "ops"),
            Err(Error::ConflictAlreadyResolved(_))
        ));

        let unknown = conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::UnauthorizedHost)
            .unwrap();
        fx.reconciler
            .resolve_conflict(unknown.id, ResolutionAction::Release, "ops")
            .unwrap();
        assert!(fx.ledger.get(ip("10.0.0.77")).unwrap().is_free());

        assert!(matches!(
            fx.reconciler
                .resolve_conflict(Uuid::new_v4(), ResolutionAction::Release, "ops"),
            Err(Error::ConflictNotFound(_))
        ));
    }
}
