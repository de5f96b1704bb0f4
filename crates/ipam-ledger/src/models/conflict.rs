//! Conflict records produced by reconciliation

use super::{AllocationRecord, ObservedHostFact, SubnetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// What kind of disagreement between ledger and network was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Address observed while the ledger says FREE
    UnauthorizedHost,
    /// Address observed with a different hostname or MAC than recorded
    IdentityMismatch,
    /// Recorded address not observed for longer than the grace period
    StaleAllocation,
}

/// Operator resolution of an open conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Return to ALLOCATED with the recorded identity
    KeepRecorded,
    /// Return to ALLOCATED with the observed identity
    AdoptObserved,
    /// Release the address
    Release,
}

/// Automatic resolution applied by policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoAction {
    /// Unknown host adopted on a trusted subnet
    Adopted,
    /// Stale allocation returned to free capacity
    Reclaimed,
}

/// Lifecycle of a conflict record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved {
        action: ResolutionAction,
        actor: String,
        at: DateTime<Utc>,
    },
    AutoResolved {
        action: AutoAction,
        at: DateTime<Utc>,
    },
}

impl ConflictStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ConflictStatus::Open)
    }
}

/// A detected mismatch between recorded and observed address usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub kind: ConflictKind,
    /// Ledger view at detection time
    pub expected: Option<AllocationRecord>,
    /// Latest discovery view
    pub observed: Option<ObservedHostFact>,
    pub detected_at: DateTime<Utc>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub observation_count: u32,
    pub status: ConflictStatus,
}

impl ConflictRecord {
    pub fn new(
        address: IpAddr,
        subnet_id: SubnetId,
        kind: ConflictKind,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            subnet_id,
            kind,
            expected: None,
            observed: None,
            detected_at,
            last_observed_at: None,
            observation_count: 0,
            status: ConflictStatus::Open,
        }
    }

    pub fn with_expected(mut self, record: AllocationRecord) -> Self {
        self.expected = Some(record);
        self
    }

    pub fn with_observation(mut self, fact: ObservedHostFact) -> Self {
        self.observe(fact);
        self
    }

    /// Fold a newer observation into the record
    pub fn observe(&mut self, fact: ObservedHostFact) {
        let newer = self
            .last_observed_at
            .map(|at| fact.observed_at >= at)
            .unwrap_or(true);
        if newer {
            self.last_observed_at = Some(fact.observed_at);
            self.observed = Some(fact);
        }
        self.observation_count += 1;
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// Filter for listing conflicts
#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub subnet_id: Option<SubnetId>,
    pub kind: Option<ConflictKind>,
    pub open_only: bool,
}

impl ConflictFilter {
    pub fn open() -> Self {
        Self {
            open_only: true,
            ..Default::default()
        }
    }

    pub fn in_subnet(mut self, subnet_id: SubnetId) -> Self {
        self.subnet_id = Some(subnet_id);
        self
    }

    pub fn of_kind(mut self, kind: ConflictKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, conflict: &ConflictRecord) -> bool {
        self.subnet_id.map_or(true, |id| conflict.subnet_id == id)
            && self.kind.map_or(true, |kind| conflict.kind == kind)
            && (!self.open_only || conflict.is_open())
    }
}
