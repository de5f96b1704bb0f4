//! Ledger event messages
//!
//! These are the structured records handed to notification and reporting
//! collaborators; delivery is theirs.

use super::Channel;
use crate::models::{
    AllocationRecord, AutoAction, ConflictKind, ConflictRecord, ExpiryReason, ResolutionAction,
    StateKind, Subnet, SubnetId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Main ledger event message type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LedgerMessage {
    // ========================================================================
    // Allocation Events (Allocations channel)
    // ========================================================================
    /// An address entered RESERVED or ALLOCATED
    AddressAllocated(AddressEvent),

    /// An address was released by an operator or a conflict resolution
    AddressReleased(AddressEvent),

    /// A lease elapsed or a stale allocation was reclaimed
    AddressExpired(AddressExpiredEvent),

    // ========================================================================
    // Conflict Events (Conflicts channel)
    // ========================================================================
    /// Reconciliation found a mismatch
    ConflictDetected(ConflictDetectedEvent),

    /// An open conflict was resolved by an operator
    ConflictResolved(ConflictResolvedEvent),

    // ========================================================================
    // Capacity Events (Capacity channel)
    // ========================================================================
    /// Utilization rose past a configured threshold
    CapacityThresholdCrossed(CapacityThresholdEvent),

    // ========================================================================
    // Topology Events (Topology channel)
    // ========================================================================
    /// A subnet was added to the tree
    SubnetCreated(SubnetEvent),

    /// A subnet was removed from the tree
    SubnetRemoved(SubnetEvent),
}

// ============================================================================
// Allocation Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEvent {
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub record_id: Uuid,
    pub state: StateKind,
    pub hostname: Option<String>,
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl AddressEvent {
    pub fn from_record(record: &AllocationRecord, actor: &str) -> Self {
        Self {
            address: record.address,
            subnet_id: record.subnet_id,
            record_id: record.id,
            state: record.kind(),
            hostname: record.identity.hostname.clone(),
            actor: actor.to_string(),
            at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressExpiredEvent {
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub record_id: Uuid,
    pub reason: ExpiryReason,
    pub expired_at: DateTime<Utc>,
}

// ============================================================================
// Conflict Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictDetectedEvent {
    pub conflict_id: Uuid,
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub kind: ConflictKind,
    pub observed_hostname: Option<String>,
    pub observed_mac: Option<String>,
    /// Set when policy resolved the conflict on detection
    pub auto_action: Option<AutoAction>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictDetectedEvent {
    pub fn from_conflict(conflict: &ConflictRecord, auto_action: Option<AutoAction>) -> Self {
        let identity = conflict.observed.as_ref().map(|f| &f.identity);
        Self {
            conflict_id: conflict.id,
            address: conflict.address,
            subnet_id: conflict.subnet_id,
            kind: conflict.kind,
            observed_hostname: identity.and_then(|i| i.hostname.clone()),
            observed_mac: identity.and_then(|i| i.mac.clone()),
            auto_action,
            detected_at: conflict.detected_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolvedEvent {
    pub conflict_id: Uuid,
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub action: ResolutionAction,
    pub actor: String,
    pub resolved_at: DateTime<Utc>,
}

// ============================================================================
// Capacity Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityThresholdEvent {
    pub subnet_id: SubnetId,
    pub cidr: String,
    /// Threshold that was crossed, in percent
    pub threshold: u8,
    /// Utilization after the allocation, in percent
    pub percent: f64,
    pub free: u128,
    pub crossed_at: DateTime<Utc>,
}

// ============================================================================
// Topology Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetEvent {
    pub subnet_id: SubnetId,
    pub name: String,
    pub cidr: String,
    pub parent: Option<SubnetId>,
    pub at: DateTime<Utc>,
}

impl SubnetEvent {
    pub fn from_subnet(subnet: &Subnet) -> Self {
        Self {
            subnet_id: subnet.id,
            name: subnet.name.clone(),
            cidr: subnet.cidr.to_string(),
            parent: subnet.parent,
            at: Utc::now(),
        }
    }
}

impl LedgerMessage {
    /// Get the channel this message belongs to
    pub fn channel(&self) -> Channel {
        match self {
            LedgerMessage::AddressAllocated(_)
            | LedgerMessage::AddressReleased(_)
            | LedgerMessage::AddressExpired(_) => Channel::Allocations,

            LedgerMessage::ConflictDetected(_) | LedgerMessage::ConflictResolved(_) => {
                Channel::Conflicts
            }

            LedgerMessage::CapacityThresholdCrossed(_) => Channel::Capacity,

            LedgerMessage::SubnetCreated(_) | LedgerMessage::SubnetRemoved(_) => Channel::Topology,
        }
    }

    /// Get a short description of this event
    pub fn description(&self) -> &'static str {
        match self {
            LedgerMessage::AddressAllocated(_) => "address allocated",
            LedgerMessage::AddressReleased(_) => "address released",
            LedgerMessage::AddressExpired(_) => "address expired",
            LedgerMessage::ConflictDetected(_) => "conflict detected",
            LedgerMessage::ConflictResolved(_) => "conflict resolved",
            LedgerMessage::CapacityThresholdCrossed(_) => "capacity threshold crossed",
            LedgerMessage::SubnetCreated(_) => "subnet created",
            LedgerMessage::SubnetRemoved(_) => "subnet removed",
        }
    }
}
