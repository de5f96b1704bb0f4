//! Well-known channels for ledger events
//!
//! Every [`LedgerMessage`](super::LedgerMessage) belongs to exactly one
//! channel; subscribers pick the channels they care about.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A broadcast channel for ledger events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Address allocated, released, expired
    Allocations,
    /// Conflict detected, resolved
    Conflicts,
    /// Utilization threshold crossings
    Capacity,
    /// Subnet created, removed
    Topology,
}

impl Channel {
    /// All channels in a stable order
    pub const ALL: [Channel; 4] = [
        Channel::Allocations,
        Channel::Conflicts,
        Channel::Capacity,
        Channel::Topology,
    ];

    /// Dotted channel name as seen by external notification collaborators
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Allocations => "ipam.allocations",
            Channel::Conflicts => "ipam.conflicts",
            Channel::Capacity => "ipam.capacity",
            Channel::Topology => "ipam.topology",
        }
    }

    /// Default buffer size of the broadcast channel
    pub(crate) fn default_capacity(&self) -> usize {
        match self {
            Channel::Allocations => 1024,
            Channel::Conflicts => 512,
            Channel::Capacity => 128,
            Channel::Topology => 128,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
