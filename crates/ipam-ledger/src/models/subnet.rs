//! Subnet and allocation policy models

use crate::address::{self, Family};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Stable arena identifier of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(u64);

impl SubnetId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subnet#{}", self.0)
    }
}

/// Per-subnet allocation policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// First allocatable address (defaults to the first usable host)
    pub range_start: Option<IpAddr>,
    /// Last allocatable address (defaults to the last usable host)
    pub range_end: Option<IpAddr>,
    /// Explicit gateway address (defaults to the first usable host)
    pub gateway: Option<IpAddr>,
    /// Keep the gateway out of automatic and explicit allocation
    pub auto_reserve_gateway: bool,
    /// Reject allocations without a hostname
    pub require_hostname: bool,
    /// Default lease applied to new records, in seconds
    pub lease_secs: Option<u64>,
    /// Adopt unknown observed hosts straight into ALLOCATED
    ///
    /// Off by default; turning it on legitimizes whatever discovery reports.
    pub trust_discovery: bool,
}

impl AllocationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, start: IpAddr, end: IpAddr) -> Self {
        self.range_start = Some(start);
        self.range_end = Some(end);
        self
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self.auto_reserve_gateway = true;
        self
    }

    pub fn reserve_gateway(mut self) -> Self {
        self.auto_reserve_gateway = true;
        self
    }

    pub fn require_hostname(mut self) -> Self {
        self.require_hostname = true;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_secs = Some(lease.num_seconds().max(0) as u64);
        self
    }

    pub fn trust_discovery(mut self) -> Self {
        self.trust_discovery = true;
        self
    }

    /// Default lease as a duration
    pub fn lease(&self) -> Option<Duration> {
        self.lease_secs.map(super::saturating_seconds)
    }

    /// Check the policy against the subnet it is attached to
    pub fn validate(&self, cidr: &IpNet) -> Result<()> {
        let family = Family::of_net(cidr);
        for (label, addr) in [
            ("range_start", self.range_start),
            ("range_end", self.range_end),
            ("gateway", self.gateway),
        ] {
            if let Some(addr) = addr {
                if Family::of(addr) != family || !address::is_usable(cidr, addr) {
                    return Err(Error::InvalidPolicy(format!(
                        "{} {} is not a usable address of {}",
                        label, addr, cidr
                    )));
                }
            }
        }

        if let (Some(start), Some(end)) = (self.range_start, self.range_end) {
            if address::to_bits(start) > address::to_bits(end) {
                return Err(Error::InvalidPolicy(format!(
                    "range_start {} is after range_end {}",
                    start, end
                )));
            }
        }

        Ok(())
    }

    /// Inclusive integer window of addresses this policy allows in `cidr`
    pub fn window(&self, cidr: &IpNet) -> (u128, u128) {
        let (lo, hi) = address::usable_bounds(cidr);
        let lo = self.range_start.map(address::to_bits).unwrap_or(lo).max(lo);
        let hi = self.range_end.map(address::to_bits).unwrap_or(hi).min(hi);
        (lo, hi)
    }

    /// Gateway address kept out of allocation, if gateway reservation is on
    pub fn reserved_gateway(&self, cidr: &IpNet) -> Option<IpAddr> {
        if !self.auto_reserve_gateway {
            return None;
        }
        self.gateway.or_else(|| {
            let (lo, _) = address::usable_bounds(cidr);
            Some(address::from_bits(Family::of_net(cidr), lo))
        })
    }
}

/// Attributes supplied when a subnet is created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub name: String,
    pub description: Option<String>,
    pub vlan_id: Option<u16>,
    pub policy: AllocationPolicy,
    pub metadata: BTreeMap<String, String>,
}

impl SubnetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = Some(vlan_id);
        self
    }

    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Point-in-time view of a subnet in the address space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub name: String,
    pub description: Option<String>,
    pub vlan_id: Option<u16>,
    pub cidr: IpNet,
    pub parent: Option<SubnetId>,
    /// Children ordered by network address
    pub children: Vec<SubnetId>,
    pub policy: AllocationPolicy,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subnet {
    /// Number of usable host addresses in the whole CIDR
    pub fn usable_count(&self) -> u128 {
        address::usable_count(&self.cidr)
    }

    /// Check if an address is within this subnet
    pub fn contains(&self, addr: IpAddr) -> bool {
        address::contains(&self.cidr, addr)
    }

    /// Gateway address reserved by policy, if any
    pub fn gateway(&self) -> Option<IpAddr> {
        self.policy.reserved_gateway(&self.cidr)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
