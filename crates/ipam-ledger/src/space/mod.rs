//! Hierarchical subnet tree
//!
//! Subnets live in an arena keyed by [`SubnetId`]; each level of the tree is
//! a `BTreeMap` ordered by network address, so resolving the governing
//! subnet of an address is a longest-prefix-match descent costing
//! O(depth · log siblings). Structural changes hold the write gate of the one
//! subnet they modify, address-level work holds the read gate of the subnet
//! that governs the address. The space-wide structure lock is only taken for
//! write while an export needs the tree to stand still; structural changes
//! share it. Every wait is bounded by the ledger's lock timeout.

mod node;

pub use node::SubnetView;

use crate::address::{self, Family};
use crate::ledger::AllocationLedger;
use crate::models::{AllocationPolicy, Subnet, SubnetId, SubnetSpec};
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use ipnet::IpNet;
use node::{lookup, place, LevelIndex, Placement, SubnetNode};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Actor recorded in the audit trail for records moved by structural changes
pub const STRUCTURE_ACTOR: &str = "address-space";

/// Largest number of children a single split may create
pub const MAX_SPLIT_CHILDREN: u128 = 1024;

/// Attempts made when a concurrent structural change invalidates a lookup
const MAX_DESCENT_RETRIES: usize = 8;

/// The subnet tree
#[derive(Debug)]
pub struct AddressSpace {
    nodes: DashMap<SubnetId, Arc<SubnetNode>>,
    roots: RwLock<LevelIndex>,
    /// Shared by structural changes, exclusive while the tree is frozen
    structure: RwLock<()>,
    next_id: AtomicU64,
    ledger: Arc<AllocationLedger>,
    lock_timeout: Duration,
}

impl AddressSpace {
    pub fn new(ledger: Arc<AllocationLedger>) -> Self {
        let lock_timeout = ledger.lock_timeout();
        Self {
            nodes: DashMap::new(),
            roots: RwLock::new(BTreeMap::new()),
            structure: RwLock::new(()),
            next_id: AtomicU64::new(1),
            ledger,
            lock_timeout,
        }
    }

    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    fn node(&self, id: SubnetId) -> Result<Arc<SubnetNode>> {
        self.nodes
            .get(&id)
            .map(|n| n.value().clone())
            .ok_or(Error::SubnetNotFound(id))
    }

    fn allocate_id(&self) -> SubnetId {
        SubnetId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn busy(&self, what: impl std::fmt::Display) -> Error {
        Error::Busy(format!("{} (timeout {:?})", what, self.lock_timeout))
    }

    fn read_roots(&self) -> Result<RwLockReadGuard<'_, LevelIndex>> {
        self.roots
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.busy("root index"))
    }

    fn shared_structure(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.structure
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.busy("address space structure"))
    }

    /// Run `f` while no structural change can start or is in flight
    ///
    /// Address-level work keeps running; only the set of subnets and the
    /// subnet each record belongs to stand still.
    pub(crate) fn with_frozen_structure<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _frozen = self
            .structure
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy("address space structure"))?;
        f()
    }

    // ==================== Structure ====================

    /// Insert a subnet under its most specific container
    ///
    /// With a `parent_hint` the descent starts at that subnet, which must
    /// strictly contain `cidr`. Active records of the parent that fall into
    /// the new range are re-homed to it.
    pub fn insert_subnet(
        &self,
        cidr: IpNet,
        parent_hint: Option<SubnetId>,
        spec: SubnetSpec,
    ) -> Result<SubnetId> {
        let cidr = cidr.trunc();
        spec.policy.validate(&cidr)?;
        let _structure = self.shared_structure()?;

        let mut parent = match parent_hint {
            Some(hint) => {
                let node = self.node(hint)?;
                if node.cidr == cidr {
                    return Err(Error::SubnetExists(cidr.to_string()));
                }
                if !address::strictly_contains(&node.cidr, &cidr) {
                    return Err(Error::NotNested {
                        cidr: cidr.to_string(),
                        parent: node.cidr.to_string(),
                    });
                }
                Some(node)
            }
            None => None,
        };

        loop {
            let Some(node) = parent.take() else {
                let mut roots = self
                    .roots
                    .try_write_for(self.lock_timeout)
                    .ok_or_else(|| self.busy("root index"))?;
                match place(&roots, &cidr)? {
                    Placement::Descend(id) => {
                        drop(roots);
                        parent = Some(self.node(id)?);
                        continue;
                    }
                    Placement::Vacant => {
                        let id = self.allocate_id();
                        self.nodes
                            .insert(id, Arc::new(SubnetNode::new(id, cidr, None, spec)));
                        roots.insert(cidr.network(), (id, cidr));
                        tracing::info!(subnet_id = %id, cidr = %cidr, "Root subnet created");
                        return Ok(id);
                    }
                }
            };

            let _gate = node
                .gate
                .try_write_for(self.lock_timeout)
                .ok_or_else(|| self.busy(node.id))?;
            if node.is_retired() {
                return Err(self.busy(format!("{} removed concurrently", node.id)));
            }

            let mut children = node.write_children(self.lock_timeout)?;
            match place(&children, &cidr)? {
                Placement::Descend(id) => {
                    drop(children);
                    parent = Some(self.node(id)?);
                }
                Placement::Vacant => {
                    for addr in self.ledger.active_within(node.id, &cidr) {
                        if !address::is_usable(&cidr, addr) {
                            return Err(Error::WouldStrand {
                                subnet: node.id,
                                address: addr,
                            });
                        }
                    }

                    let id = self.allocate_id();
                    self.nodes
                        .insert(id, Arc::new(SubnetNode::new(id, cidr, Some(node.id), spec)));
                    children.insert(cidr.network(), (id, cidr));

                    if let Err(e) = self.ledger.rehome(node.id, &[(id, cidr)], STRUCTURE_ACTOR) {
                        children.remove(&cidr.network());
                        self.nodes.remove(&id);
                        return Err(e);
                    }

                    tracing::info!(
                        subnet_id = %id,
                        parent_id = %node.id,
                        cidr = %cidr,
                        "Subnet created"
                    );
                    return Ok(id);
                }
            }
        }
    }

    /// Remove a subnet that has no active allocations and no children
    pub fn remove_subnet(&self, id: SubnetId) -> Result<Subnet> {
        let node = self.node(id)?;
        let _structure = self.shared_structure()?;
        let _gate = node
            .gate
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        if node.is_retired() {
            return Err(Error::SubnetNotFound(id));
        }

        let children = node.read_children(self.lock_timeout)?.len();
        let active = self.ledger.active_count(id);
        if children > 0 || active > 0 {
            return Err(Error::NonEmpty {
                subnet: id,
                active,
                children,
            });
        }

        let snapshot = node.snapshot(self.lock_timeout)?;
        match node.parent {
            Some(parent_id) => {
                let parent = self.node(parent_id)?;
                parent
                    .write_children(self.lock_timeout)?
                    .remove(&node.cidr.network());
            }
            None => {
                self.roots
                    .try_write_for(self.lock_timeout)
                    .ok_or_else(|| self.busy("root index"))?
                    .remove(&node.cidr.network());
            }
        }

        node.retire();
        self.nodes.remove(&id);

        tracing::info!(subnet_id = %id, cidr = %node.cidr, "Subnet removed");
        Ok(snapshot)
    }

    /// Split a childless subnet into equal children of `new_prefix`
    ///
    /// Children inherit the flag-style policy settings and metadata; range
    /// bounds and explicit gateways stay with the parent. Every active record
    /// moves to the child that now governs it.
    pub fn split_subnet(&self, id: SubnetId, new_prefix: u8) -> Result<Vec<SubnetId>> {
        let node = self.node(id)?;
        let family = node.family();
        if new_prefix <= node.cidr.prefix_len() || new_prefix > address::max_prefix(family) {
            return Err(Error::InvalidArgument(format!(
                "cannot split {} into /{}",
                node.cidr, new_prefix
            )));
        }
        let bits = u32::from(new_prefix - node.cidr.prefix_len());
        if bits >= 127 || (1u128 << bits) > MAX_SPLIT_CHILDREN {
            return Err(Error::InvalidArgument(format!(
                "splitting {} into /{} exceeds {} children",
                node.cidr, new_prefix, MAX_SPLIT_CHILDREN
            )));
        }

        let _structure = self.shared_structure()?;
        let _gate = node
            .gate
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        if node.is_retired() {
            return Err(Error::SubnetNotFound(id));
        }

        let mut children = node.write_children(self.lock_timeout)?;
        if !children.is_empty() {
            return Err(Error::NonEmpty {
                subnet: id,
                active: self.ledger.active_count(id),
                children: children.len(),
            });
        }

        let blocks: Vec<IpNet> = node.cidr.subnets(new_prefix)?.collect();
        for addr in self.ledger.active_addresses(id) {
            let stranded = blocks
                .iter()
                .find(|b| b.contains(&addr))
                .map(|b| !address::is_usable(b, addr))
                .unwrap_or(true);
            if stranded {
                return Err(Error::WouldStrand {
                    subnet: id,
                    address: addr,
                });
            }
        }

        let attrs = node.read_attrs(self.lock_timeout)?.clone();
        let inherited = AllocationPolicy {
            range_start: None,
            range_end: None,
            gateway: None,
            ..attrs.policy
        };

        let mut targets = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let child_id = self.allocate_id();
            let spec = SubnetSpec {
                name: format!("{}-{}", node.name, i),
                description: None,
                vlan_id: node.vlan_id,
                policy: inherited.clone(),
                metadata: attrs.metadata.clone(),
            };
            self.nodes.insert(
                child_id,
                Arc::new(SubnetNode::new(child_id, *block, Some(id), spec)),
            );
            children.insert(block.network(), (child_id, *block));
            targets.push((child_id, *block));
        }

        if let Err(e) = self.ledger.rehome(id, &targets, STRUCTURE_ACTOR) {
            for (child_id, block) in &targets {
                children.remove(&block.network());
                self.nodes.remove(child_id);
            }
            return Err(e);
        }

        tracing::info!(
            subnet_id = %id,
            cidr = %node.cidr,
            prefix = new_prefix,
            children = targets.len(),
            "Subnet split"
        );

        Ok(targets.into_iter().map(|(child_id, _)| child_id).collect())
    }

    /// Create a child of `prefix_len` in the lowest free aligned block of
    /// `parent`
    pub fn carve_subnet(
        &self,
        parent: SubnetId,
        prefix_len: u8,
        spec: SubnetSpec,
    ) -> Result<SubnetId> {
        for _ in 0..MAX_DESCENT_RETRIES {
            let block = {
                let node = self.node(parent)?;
                let family = node.family();
                if prefix_len <= node.cidr.prefix_len() || prefix_len > address::max_prefix(family)
                {
                    return Err(Error::InvalidArgument(format!(
                        "cannot carve a /{} out of {}",
                        prefix_len, node.cidr
                    )));
                }
                let taken: Vec<(u128, u128)> = node
                    .child_ranges(self.lock_timeout)?
                    .iter()
                    .map(address::bounds)
                    .collect();
                find_gap(&node.cidr, &taken, prefix_len).ok_or(Error::NoCapacity(parent))?
            };

            match self.insert_subnet(block, Some(parent), spec.clone()) {
                // Lost a race for the block
                Err(Error::Overlap { .. }) | Err(Error::SubnetExists(_)) => continue,
                other => return other,
            }
        }
        Err(self.busy(format!("carving /{} from {}", prefix_len, parent)))
    }

    /// Replace the allocation policy of a subnet
    pub fn set_policy(&self, id: SubnetId, policy: AllocationPolicy) -> Result<()> {
        let node = self.node(id)?;
        policy.validate(&node.cidr)?;
        let _gate = node
            .gate
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;

        let mut attrs = node.write_attrs(self.lock_timeout)?;
        attrs.policy = policy;
        attrs.updated_at = Utc::now();
        tracing::info!(subnet_id = %id, "Subnet policy updated");
        Ok(())
    }

    /// Set or clear (`None`) one metadata entry
    pub fn set_metadata(&self, id: SubnetId, key: &str, value: Option<String>) -> Result<()> {
        let node = self.node(id)?;
        let _gate = node
            .gate
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        if node.is_retired() {
            return Err(Error::SubnetNotFound(id));
        }

        let mut attrs = node.write_attrs(self.lock_timeout)?;
        match value {
            Some(value) => {
                attrs.metadata.insert(key.to_string(), value);
            }
            None => {
                attrs.metadata.remove(key);
            }
        }
        attrs.updated_at = Utc::now();
        Ok(())
    }

    // ==================== Queries ====================

    /// Most specific subnet containing `addr`
    pub fn find_containing(&self, addr: IpAddr) -> Result<SubnetId> {
        'restart: for _ in 0..MAX_DESCENT_RETRIES {
            let mut current = lookup(&*self.read_roots()?, addr)
                .map(|(id, _)| id)
                .ok_or(Error::NoContainingSubnet(addr))?;

            loop {
                let Ok(node) = self.node(current) else {
                    continue 'restart;
                };
                let next = lookup(&*node.read_children(self.lock_timeout)?, addr);
                match next {
                    Some((child, _)) => current = child,
                    None => return Ok(current),
                }
            }
        }
        Err(self.busy(format!("resolving {}", addr)))
    }

    pub fn get(&self, id: SubnetId) -> Result<Subnet> {
        self.node(id)?.snapshot(self.lock_timeout)
    }

    pub fn contains(&self, id: SubnetId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// All subnets ordered by id
    pub fn list(&self) -> Result<Vec<Subnet>> {
        let nodes: Vec<Arc<SubnetNode>> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let mut subnets = nodes
            .iter()
            .map(|node| node.snapshot(self.lock_timeout))
            .collect::<Result<Vec<Subnet>>>()?;
        subnets.sort_by_key(|s| s.id);
        Ok(subnets)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root subnets ordered by network address
    pub fn roots(&self) -> Result<Vec<SubnetId>> {
        Ok(self.read_roots()?.values().map(|(id, _)| *id).collect())
    }

    /// Direct children ordered by network address
    pub fn children(&self, id: SubnetId) -> Result<Vec<SubnetId>> {
        let node = self.node(id)?;
        let ids = node
            .read_children(self.lock_timeout)?
            .values()
            .map(|(id, _)| *id)
            .collect();
        Ok(ids)
    }

    /// Ancestors from the direct parent up to the root
    pub fn ancestors(&self, id: SubnetId) -> Result<Vec<SubnetId>> {
        let mut out = Vec::new();
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.node(parent)?.parent;
        }
        Ok(out)
    }

    /// The subnet and every subnet below it, depth first
    pub fn subtree(&self, id: SubnetId) -> Result<Vec<SubnetId>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node(current)?;
            out.push(current);
            let children: Vec<SubnetId> = node
                .read_children(self.lock_timeout)?
                .values()
                .rev()
                .map(|(id, _)| *id)
                .collect();
            stack.extend(children);
        }
        Ok(out)
    }

    /// Allocatable addresses not held by an active record
    ///
    /// Counts the policy window minus child ranges and the reserved gateway,
    /// taken under the subnet's read gate so it agrees with the ledger at the
    /// instant of the call.
    pub fn free_capacity(&self, id: SubnetId) -> Result<u128> {
        self.with_subnet(id, |view| Ok(self.free_in_view(view)))
    }

    pub(crate) fn free_in_view(&self, view: &SubnetView) -> u128 {
        let held = self.ledger.with_active(view.id(), |active| {
            active.iter().filter(|a| view.is_allocatable(**a)).count() as u128
        });
        view.allocatable_count().saturating_sub(held)
    }

    // ==================== Gates ====================

    /// Run `f` with the subnet's read gate held
    pub fn with_subnet<R>(&self, id: SubnetId, f: impl FnOnce(&SubnetView) -> Result<R>) -> Result<R> {
        let node = self.node(id)?;
        let _gate = node
            .gate
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        if node.is_retired() {
            return Err(Error::SubnetNotFound(id));
        }
        let view = SubnetView::capture(&node, self.lock_timeout)?;
        f(&view)
    }

    /// Run `f` with the read gate of the subnet governing `addr` held
    ///
    /// The descent is repeated if a structural change moved `addr` to a new
    /// subnet between lookup and locking.
    pub fn with_governing<R>(
        &self,
        addr: IpAddr,
        f: impl FnOnce(&SubnetView) -> Result<R>,
    ) -> Result<R> {
        for _ in 0..MAX_DESCENT_RETRIES {
            let id = self.find_containing(addr)?;
            let Ok(node) = self.node(id) else {
                continue;
            };
            let _gate = node
                .gate
                .try_read_for(self.lock_timeout)
                .ok_or_else(|| self.busy(id))?;
            if node.is_retired() {
                continue;
            }
            let view = SubnetView::capture(&node, self.lock_timeout)?;
            if !view.governs(addr) {
                continue;
            }
            return f(&view);
        }
        Err(self.busy(format!("resolving {}", addr)))
    }

    // ==================== Persistence ====================

    /// Rebuild the tree from persisted subnets, keeping their ids
    pub(crate) fn restore(&self, mut subnets: Vec<Subnet>) -> Result<()> {
        if !self.nodes.is_empty() {
            return Err(Error::Internal("restore into a non-empty address space".into()));
        }
        subnets.sort_by_key(|s| (s.cidr.prefix_len(), s.id));

        let mut max_id = 0;
        for subnet in &subnets {
            let cidr = subnet.cidr;
            match subnet.parent {
                Some(parent_id) => {
                    let parent = self.node(parent_id)?;
                    if !address::strictly_contains(&parent.cidr, &cidr) {
                        return Err(Error::NotNested {
                            cidr: cidr.to_string(),
                            parent: parent.cidr.to_string(),
                        });
                    }
                    let mut children = parent.write_children(self.lock_timeout)?;
                    if let Placement::Descend(_) = place(&children, &cidr)? {
                        return Err(Error::Storage(format!(
                            "{} is recorded under {} but nests inside a sibling",
                            cidr, parent.cidr
                        )));
                    }
                    children.insert(cidr.network(), (subnet.id, cidr));
                }
                None => {
                    let mut roots = self
                        .roots
                        .try_write_for(self.lock_timeout)
                        .ok_or_else(|| self.busy("root index"))?;
                    if let Placement::Descend(_) = place(&roots, &cidr)? {
                        return Err(Error::Storage(format!(
                            "{} is recorded as a root but nests inside another root",
                            cidr
                        )));
                    }
                    roots.insert(cidr.network(), (subnet.id, cidr));
                }
            }
            self.nodes
                .insert(subnet.id, Arc::new(SubnetNode::restored(subnet)));
            max_id = max_id.max(subnet.id.get());
        }

        self.next_id.store(max_id + 1, Ordering::Relaxed);
        Ok(())
    }
}

/// Lowest aligned block of `prefix_len` inside `space` that overlaps none of
/// the sorted `taken` ranges
fn find_gap(space: &IpNet, taken: &[(u128, u128)], prefix_len: u8) -> Option<IpNet> {
    let family = Family::of_net(space);
    let block = address::block_size(family, prefix_len);
    let (space_start, space_end) = address::bounds(space);

    let fits = |start: u128, limit: u128| -> bool {
        start
            .checked_add(block - 1)
            .map(|end| end <= limit)
            .unwrap_or(false)
    };

    let mut current = space_start;
    for &(block_start, block_end) in taken {
        if current < block_start {
            if let Some(aligned) = align_up(current, block) {
                if block_start > 0 && fits(aligned, block_start - 1) && fits(aligned, space_end) {
                    return address::net_from_bits(family, aligned, prefix_len);
                }
            }
        }
        current = current.max(block_end.checked_add(1)?);
    }

    let aligned = align_up(current, block)?;
    if fits(aligned, space_end) {
        return address::net_from_bits(family, aligned, prefix_len);
    }
    None
}

/// Round `addr` up to a multiple of `block` (a power of two)
fn align_up(addr: u128, block: u128) -> Option<u128> {
    let aligned = addr & !(block - 1);
    if aligned < addr {
        aligned.checked_add(block)
    } else {
        Some(aligned)
    }
}
