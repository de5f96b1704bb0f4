//! Append-only audit trail entries

use super::{StateKind, SubnetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// One state change of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic position in the trail, starting at 1
    pub sequence: u64,
    pub address: IpAddr,
    pub subnet_id: SubnetId,
    pub record_id: Uuid,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub previous: StateKind,
    pub next: StateKind,
    /// Event name, e.g. `reserve`, `release`, `rehome`
    pub reason: String,
}
