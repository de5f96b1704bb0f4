//! Arena node of the subnet tree

use crate::address::{self, Family};
use crate::models::{AllocationPolicy, Subnet, SubnetId, SubnetSpec};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sibling index of one tree level, keyed by network address
pub(crate) type LevelIndex = BTreeMap<IpAddr, (SubnetId, IpNet)>;

/// Where a new range lands relative to one tree level
pub(crate) enum Placement {
    /// A sibling strictly contains the range; continue the descent there
    Descend(SubnetId),
    /// No sibling intersects the range
    Vacant,
}

/// Sibling on this level whose range contains `addr`
///
/// Siblings never overlap, so only the closest predecessor by network
/// address can match.
pub(crate) fn lookup(level: &LevelIndex, addr: IpAddr) -> Option<(SubnetId, IpNet)> {
    level
        .range(..=addr)
        .next_back()
        .map(|(_, entry)| *entry)
        .filter(|(_, net)| net.contains(&addr))
}

/// Decide how `cidr` fits into one level
pub(crate) fn place(level: &LevelIndex, cidr: &IpNet) -> Result<Placement> {
    if let Some((id, net)) = lookup(level, cidr.network()) {
        if net == *cidr {
            return Err(Error::SubnetExists(cidr.to_string()));
        }
        if address::strictly_contains(&net, cidr) {
            return Ok(Placement::Descend(id));
        }
        return Err(Error::Overlap {
            cidr: cidr.to_string(),
            existing: net.to_string(),
        });
    }

    // Any sibling starting inside the new range would be enclosed by it
    if let Some((_, (_, net))) = level.range(cidr.network()..=cidr.broadcast()).next() {
        return Err(Error::Overlap {
            cidr: cidr.to_string(),
            existing: net.to_string(),
        });
    }

    Ok(Placement::Vacant)
}

#[derive(Debug, Clone)]
pub(crate) struct NodeAttrs {
    pub policy: AllocationPolicy,
    pub metadata: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

/// One subnet in the arena
///
/// Identity fields are immutable after creation. `gate` serializes
/// structural changes (write) against address-level work (read).
#[derive(Debug)]
pub(crate) struct SubnetNode {
    pub id: SubnetId,
    pub cidr: IpNet,
    pub name: String,
    pub description: Option<String>,
    pub vlan_id: Option<u16>,
    pub parent: Option<SubnetId>,
    pub created_at: DateTime<Utc>,
    pub children: RwLock<LevelIndex>,
    pub attrs: RwLock<NodeAttrs>,
    pub gate: RwLock<()>,
    retired: AtomicBool,
}

impl SubnetNode {
    pub fn new(id: SubnetId, cidr: IpNet, parent: Option<SubnetId>, spec: SubnetSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            cidr,
            name: spec.name,
            description: spec.description,
            vlan_id: spec.vlan_id,
            parent,
            created_at: now,
            children: RwLock::new(BTreeMap::new()),
            attrs: RwLock::new(NodeAttrs {
                policy: spec.policy,
                metadata: spec.metadata,
                updated_at: now,
            }),
            gate: RwLock::new(()),
            retired: AtomicBool::new(false),
        }
    }

    /// Rebuild a node from a persisted subnet, keeping its timestamps
    pub fn restored(subnet: &Subnet) -> Self {
        let spec = SubnetSpec {
            name: subnet.name.clone(),
            description: subnet.description.clone(),
            vlan_id: subnet.vlan_id,
            policy: subnet.policy.clone(),
            metadata: subnet.metadata.clone(),
        };
        let mut node = Self::new(subnet.id, subnet.cidr, subnet.parent, spec);
        node.created_at = subnet.created_at;
        node.attrs.get_mut().updated_at = subnet.updated_at;
        node
    }

    pub fn family(&self) -> Family {
        Family::of_net(&self.cidr)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn busy(&self, what: &str, timeout: Duration) -> Error {
        Error::Busy(format!("{} of {} (timeout {:?})", what, self.id, timeout))
    }

    pub fn read_children(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, LevelIndex>> {
        self.children
            .try_read_for(timeout)
            .ok_or_else(|| self.busy("children", timeout))
    }

    pub fn write_children(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, LevelIndex>> {
        self.children
            .try_write_for(timeout)
            .ok_or_else(|| self.busy("children", timeout))
    }

    pub fn read_attrs(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, NodeAttrs>> {
        self.attrs
            .try_read_for(timeout)
            .ok_or_else(|| self.busy("attributes", timeout))
    }

    pub fn write_attrs(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, NodeAttrs>> {
        self.attrs
            .try_write_for(timeout)
            .ok_or_else(|| self.busy("attributes", timeout))
    }

    pub fn child_ranges(&self, timeout: Duration) -> Result<Vec<IpNet>> {
        Ok(self
            .read_children(timeout)?
            .values()
            .map(|(_, net)| *net)
            .collect())
    }

    pub fn snapshot(&self, timeout: Duration) -> Result<Subnet> {
        let attrs = self.read_attrs(timeout)?.clone();
        let children = self
            .read_children(timeout)?
            .values()
            .map(|(id, _)| *id)
            .collect();
        Ok(Subnet {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            vlan_id: self.vlan_id,
            cidr: self.cidr,
            parent: self.parent,
            children,
            policy: attrs.policy,
            metadata: attrs.metadata,
            created_at: self.created_at,
            updated_at: attrs.updated_at,
        })
    }
}

/// Consistent view of a subnet taken under its read gate
///
/// Handed to closures that run address-level work; the gate stays held for
/// as long as the view is borrowed.
#[derive(Debug, Clone)]
pub struct SubnetView {
    id: SubnetId,
    cidr: IpNet,
    policy: AllocationPolicy,
    child_ranges: Vec<IpNet>,
}

impl SubnetView {
    pub(crate) fn capture(node: &SubnetNode, timeout: Duration) -> Result<Self> {
        Ok(Self {
            id: node.id,
            cidr: node.cidr,
            policy: node.read_attrs(timeout)?.policy.clone(),
            child_ranges: node.child_ranges(timeout)?,
        })
    }

    pub fn id(&self) -> SubnetId {
        self.id
    }

    pub fn cidr(&self) -> &IpNet {
        &self.cidr
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    pub fn family(&self) -> Family {
        Family::of_net(&self.cidr)
    }

    /// Child ranges in ascending order
    pub fn child_ranges(&self) -> &[IpNet] {
        &self.child_ranges
    }

    /// Gateway kept out of allocation, if any
    pub fn gateway(&self) -> Option<IpAddr> {
        self.policy.reserved_gateway(&self.cidr)
    }

    /// Inclusive integer window allowed by the policy
    pub fn window(&self) -> (u128, u128) {
        self.policy.window(&self.cidr)
    }

    fn in_child(&self, addr: IpAddr) -> bool {
        self.child_ranges.iter().any(|net| net.contains(&addr))
    }

    /// Whether this subnet is the most specific one containing `addr`
    pub fn governs(&self, addr: IpAddr) -> bool {
        self.cidr.contains(&addr) && !self.in_child(addr)
    }

    /// Governed, usable and inside the policy window
    pub fn in_range(&self, addr: IpAddr) -> bool {
        if !self.governs(addr) || !address::is_usable(&self.cidr, addr) {
            return false;
        }
        let (lo, hi) = self.window();
        let bits = address::to_bits(addr);
        bits >= lo && bits <= hi
    }

    /// Whether automatic or explicit allocation may hand out `addr`
    pub fn is_allocatable(&self, addr: IpAddr) -> bool {
        self.in_range(addr) && self.gateway() != Some(addr)
    }

    /// Number of addresses [`Self::is_allocatable`] accepts
    pub fn allocatable_count(&self) -> u128 {
        let window = self.window();
        if window.0 > window.1 {
            return 0;
        }
        let mut count = window.1 - window.0 + 1;
        for child in &self.child_ranges {
            count -= address::intersection_len(window, address::bounds(child));
        }
        if let Some(gateway) = self.gateway() {
            if self.in_range(gateway) {
                count -= 1;
            }
        }
        count
    }

    /// Child ranges as inclusive integer bounds, ascending
    pub(crate) fn child_bounds(&self) -> Vec<(u128, u128)> {
        self.child_ranges.iter().map(address::bounds).collect()
    }
}
