//! Allocation records and the per-address state machine

use super::SubnetId;
use crate::address::normalize_mac;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Flat state label, used in audit entries and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Free,
    Reserved,
    Allocated,
    Conflicted,
    Released,
    Expired,
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Released | StateKind::Expired)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Free => "FREE",
            StateKind::Reserved => "RESERVED",
            StateKind::Allocated => "ALLOCATED",
            StateKind::Conflicted => "CONFLICTED",
            StateKind::Released => "RELEASED",
            StateKind::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Why a record expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// `expires_at` elapsed without renewal
    LeaseElapsed,
    /// Not observed on the network for longer than the grace period
    Stale,
}

/// State of a recorded address. FREE is the absence of a current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AllocationState {
    Reserved,
    Allocated,
    Conflicted { conflict_id: Uuid },
    Released,
    Expired { reason: ExpiryReason },
}

/// Target of a conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveTarget {
    Allocated,
    Released,
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// FREE -> RESERVED
    Reserve,
    /// RESERVED -> ALLOCATED
    Confirm,
    /// RESERVED | ALLOCATED -> RELEASED
    Release,
    /// FREE | RESERVED | ALLOCATED -> CONFLICTED
    Flag { conflict_id: Uuid },
    /// CONFLICTED -> ALLOCATED | RELEASED
    Resolve(ResolveTarget),
    /// any non-terminal -> EXPIRED
    Expire(ExpiryReason),
    /// RESERVED | ALLOCATED -> same state, new expiry
    Renew,
    /// any non-terminal -> same state, new last-seen
    Touch,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Reserve => "reserve",
            Transition::Confirm => "confirm",
            Transition::Release => "release",
            Transition::Flag { .. } => "flag",
            Transition::Resolve(_) => "resolve",
            Transition::Expire(_) => "expire",
            Transition::Renew => "renew",
            Transition::Touch => "touch",
        }
    }
}

impl AllocationState {
    pub fn kind(&self) -> StateKind {
        match self {
            AllocationState::Reserved => StateKind::Reserved,
            AllocationState::Allocated => StateKind::Allocated,
            AllocationState::Conflicted { .. } => StateKind::Conflicted,
            AllocationState::Released => StateKind::Released,
            AllocationState::Expired { .. } => StateKind::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Apply a transition to the current state (`None` = FREE)
    ///
    /// Returns `None` when the transition is not allowed.
    pub fn apply(current: Option<&AllocationState>, transition: Transition) -> Option<Self> {
        use AllocationState as S;

        match (current, transition) {
            (None, Transition::Reserve) => Some(S::Reserved),
            (None, Transition::Flag { conflict_id }) => Some(S::Conflicted { conflict_id }),

            (Some(S::Reserved), Transition::Confirm) => Some(S::Allocated),

            (Some(S::Reserved | S::Allocated), Transition::Release) => Some(S::Released),
            (Some(S::Reserved | S::Allocated), Transition::Flag { conflict_id }) => {
                Some(S::Conflicted { conflict_id })
            }
            (Some(state @ (S::Reserved | S::Allocated)), Transition::Renew) => Some(*state),

            (Some(S::Conflicted { .. }), Transition::Resolve(ResolveTarget::Allocated)) => {
                Some(S::Allocated)
            }
            (Some(S::Conflicted { .. }), Transition::Resolve(ResolveTarget::Released)) => {
                Some(S::Released)
            }

            (Some(state), Transition::Expire(reason)) if !state.is_terminal() => {
                Some(S::Expired { reason })
            }
            (Some(state), Transition::Touch) if !state.is_terminal() => Some(*state),

            _ => None,
        }
    }
}

/// Who or what created a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    Manual,
    Dhcp,
    Dns,
    Discovery,
    PolicyAuto,
}

/// Static allocations are exempt from stale reclamation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    Static,
    #[default]
    Dynamic,
}

/// Identity of a host as recorded or observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: Option<String>,
    /// Lowercase colon-separated MAC
    pub mac: Option<String>,
}

impl HostIdentity {
    pub fn new(hostname: Option<String>, mac: Option<String>) -> Self {
        Self {
            hostname: hostname.filter(|h| !h.trim().is_empty()),
            mac: mac.and_then(|m| normalize_mac(&m)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hostname.is_none() && self.mac.is_none()
    }

    /// Whether an observation is consistent with this recorded identity
    ///
    /// MACs decide when both sides carry one; otherwise hostnames decide
    /// (case-insensitive) when both sides carry one; otherwise presence alone
    /// is consistent.
    pub fn matches(&self, observed: &HostIdentity) -> bool {
        if let (Some(recorded), Some(seen)) = (&self.mac, &observed.mac) {
            return recorded == seen;
        }
        if let (Some(recorded), Some(seen)) = (&self.hostname, &observed.hostname) {
            return recorded.eq_ignore_ascii_case(seen);
        }
        true
    }
}

/// A recorded binding of an address, current or historical
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: Uuid,
    pub address: IpAddr,
    /// Most specific subnet governing the address
    pub subnet_id: SubnetId,
    pub state: AllocationState,
    #[serde(flatten)]
    pub identity: HostIdentity,
    pub device_type: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub allocation_type: AllocationType,
    pub source: AllocationSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Sequence number of the latest audit entry for this record
    pub audit_ref: u64,
}

impl AllocationRecord {
    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the lease has elapsed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Last time the host was known to be present
    pub fn last_evidence(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(self.created_at)
    }
}

/// Ledger view of a single address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "record", rename_all = "snake_case")]
pub enum AddressStatus {
    Free,
    Held(AllocationRecord),
}

impl AddressStatus {
    pub fn kind(&self) -> StateKind {
        match self {
            AddressStatus::Free => StateKind::Free,
            AddressStatus::Held(record) => record.kind(),
        }
    }

    pub fn record(&self) -> Option<&AllocationRecord> {
        match self {
            AddressStatus::Free => None,
            AddressStatus::Held(record) => Some(record),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, AddressStatus::Free)
    }
}
